//! Device drivers
//!
//! - [`stargo`]: Avalon StarGo mount, owning its AUX1 focuser
//! - [`microtouch`]: Microtouch binary-protocol focuser
//! - [`toupcam`]: ToupTek cameras behind an opaque SDK

pub mod focuser;
pub mod microtouch;
pub mod stargo;
pub mod stargo_focuser;
pub mod toupcam;

use std::time::Duration;

use crate::config::SerialSettings;
use crate::protocol::{
    open_serial_transport, open_tcp_transport, ProtocolError, QueryEngine, Transport,
};

/// Opens a fresh transport on every `connect`
pub type TransportFactory =
    Box<dyn FnMut() -> Result<Box<dyn Transport>, ProtocolError> + Send>;

/// Factory for a serial port, or a TCP bridge when one is configured
pub fn serial_factory(settings: &SerialSettings) -> TransportFactory {
    let settings = settings.clone();
    Box::new(move || match &settings.tcp_address {
        Some(addr) => Ok(Box::new(open_tcp_transport(addr)?) as Box<dyn Transport>),
        None => Ok(Box::new(open_serial_transport(&settings.port, settings.baud_rate)?)
            as Box<dyn Transport>),
    })
}

/// Factory handing out clones of one transport (mocks and simulators)
pub fn shared_factory<T>(transport: T) -> TransportFactory
where
    T: Transport + Clone + 'static,
{
    Box::new(move || Ok(Box::new(transport.clone()) as Box<dyn Transport>))
}

pub(crate) type Engine = QueryEngine<Box<dyn Transport>>;

pub(crate) fn open_engine(
    factory: &mut TransportFactory,
    timeout: Duration,
) -> Result<Engine, ProtocolError> {
    let transport = factory()?;
    Ok(QueryEngine::with_timeout(transport, timeout))
}
