//! Driver errors

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors raised inside a driver. None of these cross the host boundary:
/// entry points turn them into an Alert state and a single log line.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{value} is outside the allowed range [{min}, {max}]")]
    Range { value: f64, min: f64, max: f64 },

    #[error("camera SDK call {operation} failed with code {code:#x}")]
    Sdk { code: i32, operation: &'static str },

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("device is not connected")]
    NotConnected,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DriverError {
    pub fn range(value: f64, min: f64, max: f64) -> Self {
        DriverError::Range { value, min, max }
    }

    /// True when the request was refused before anything reached the device
    pub fn is_rejected_request(&self) -> bool {
        matches!(
            self,
            DriverError::Range { .. }
                | DriverError::Unsupported(_)
                | DriverError::InvalidArgument(_)
                | DriverError::NotConnected
        )
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::Config(e.to_string())
    }
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        DriverError::Protocol(ProtocolError::IoError(e))
    }
}
