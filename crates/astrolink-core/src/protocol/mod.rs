//! Serial Protocol Communication
//!
//! Byte transports, the two command codecs (framed ASCII for the mount and
//! its AUX port, fixed-length binary for the Microtouch focuser) and the
//! query engine that pairs them.

pub mod ascii;
pub mod binary;
mod error;
pub mod mock;
mod query;
pub mod serial;
pub mod transport;

pub use ascii::{AsciiCommand, ReplyShape};
pub use binary::{BinaryCommand, BinaryReply};
pub use error::ProtocolError;
pub use mock::MockTransport;
pub use query::{QueryCounters, QueryEngine};
pub use serial::{clear_buffers, configure_port, list_ports, open_port, PortInfo, UsbId};
pub use transport::{Channel, ChannelTransport, SerialChannel, TcpChannel, Transport};

/// Default baud rate for the mount's serial link
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Open `port_name`, configure it 8N1 and wrap it as a [`Transport`]
pub fn open_serial_transport(
    port_name: &str,
    baud_rate: u32,
) -> Result<ChannelTransport<SerialChannel>, ProtocolError> {
    let mut port = open_port(port_name, baud_rate).map_err(|e| {
        if matches!(e, ProtocolError::PortNotFound(_)) {
            for candidate in list_ports() {
                tracing::info!("available port: {}", candidate);
            }
        }
        e
    })?;
    configure_port(port.as_mut())?;
    clear_buffers(port.as_mut())?;
    tracing::info!("opened {} at {} baud", port_name, baud_rate);
    Ok(ChannelTransport::new(SerialChannel::new(port)))
}

/// Connect to a serial-over-TCP bridge at `addr` (`host:port`)
pub fn open_tcp_transport(addr: &str) -> Result<ChannelTransport<TcpChannel>, ProtocolError> {
    let stream = std::net::TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    tracing::info!("connected to {}", addr);
    Ok(ChannelTransport::new(TcpChannel::new(stream)))
}
