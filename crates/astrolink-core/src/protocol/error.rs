//! Protocol errors

use thiserror::Error;

/// Errors that can occur while exchanging bytes with a device
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Timed out after {waited_ms}ms: expected {expected}, received {received} bytes")]
    Timeout {
        /// What the reader was waiting for (byte count or terminator)
        expected: String,
        /// Bytes that did arrive before the deadline
        received: usize,
        waited_ms: u64,
    },

    #[error("Not connected to device")]
    NotConnected,

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Value {value} out of range for {field}")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for faults of the channel itself (nothing or too little arrived).
    ///
    /// These are the only errors a caller may consider retrying; a reply that
    /// arrived but does not decode is a protocol fault and is never retried.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::SerialError(_) | ProtocolError::Timeout { .. } | ProtocolError::IoError(_)
        )
    }

    /// True when the reply was received but could not be decoded.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::Malformed(_) | ProtocolError::OutOfRange { .. }
        )
    }

    pub(crate) fn malformed(what: impl Into<String>) -> Self {
        ProtocolError::Malformed(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classes_are_disjoint() {
        let timeout = ProtocolError::Timeout {
            expected: "3 bytes".into(),
            received: 1,
            waited_ms: 3000,
        };
        assert!(timeout.is_transport_fault());
        assert!(!timeout.is_protocol_fault());

        let malformed = ProtocolError::malformed("missing '='");
        assert!(malformed.is_protocol_fault());
        assert!(!malformed.is_transport_fault());
    }

    #[test]
    fn test_timeout_display_mentions_partial_read() {
        let err = ProtocolError::Timeout {
            expected: "terminator '#'".into(),
            received: 4,
            waited_ms: 2000,
        };
        let msg = err.to_string();
        assert!(msg.contains("2000ms"));
        assert!(msg.contains("4 bytes"));
    }
}
