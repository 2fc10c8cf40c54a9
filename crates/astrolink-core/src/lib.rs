//! # astrolink Core Library
//!
//! Device drivers for observatory hardware behind a common host interface.
//!
//! This library provides:
//! - Byte transports over serial ports and TCP bridges
//! - The framed ASCII and fixed-length binary command codecs
//! - A query engine that serializes request/reply exchanges per port
//! - Focuser motion, guide-pulse and exposure state machines
//! - Drivers for the Avalon StarGo mount (with its AUX1 focuser), the
//!   Microtouch focuser and ToupTek cameras
//! - A dispatch loop that runs one driver on a tokio task
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use astrolink_core::prelude::*;
//!
//! let config = MicrotouchConfig::default();
//! let factory = serial_factory(&config.serial);
//! let mut focuser = Microtouch::new(config, factory, Box::new(LogSink), Arc::new(SystemClock));
//! focuser.connect();
//! focuser.update_number("ABS_FOCUS_POSITION", &[5000.0]);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod devices;
pub mod driver;
pub mod error;
pub mod exposure;
pub mod guide;
pub mod motion;
pub mod property;
pub mod protocol;
pub mod runtime;
pub mod sim;
pub mod timer;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{
        ConfigStore, DeviceConfig, HostConfig, JsonConfigStore, MicrotouchConfig, SerialSettings,
        StarGoConfig, ToupcamConfig,
    };
    pub use crate::devices::microtouch::Microtouch;
    pub use crate::devices::stargo::StarGoMount;
    pub use crate::devices::stargo_focuser::StarGoFocuser;
    pub use crate::devices::toupcam::{CameraRegistry, CameraSdk, ToupCamera};
    pub use crate::devices::{serial_factory, shared_factory, TransportFactory};
    pub use crate::driver::{ConnectionState, Driver};
    pub use crate::error::DriverError;
    pub use crate::property::{
        names, Capabilities, LogSink, PropertySink, PropertyState, PropertyValue, RecordingSink,
    };
    pub use crate::protocol::{ProtocolError, QueryEngine, Transport};
    pub use crate::runtime::run_driver;
    pub use crate::sim::{MicrotouchSimulator, SimulatedCameraSdk};
    pub use crate::timer::{Clock, ManualClock, SystemClock};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
