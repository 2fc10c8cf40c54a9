//! Query engine
//!
//! Pairs a [`Transport`] with the codecs: discard stale input, send the
//! request, read the reply in the shape the command dictates. The engine
//! never retries. A timeout and a malformed reply surface as different
//! [`ProtocolError`] variants and the caller decides what to do; the motion
//! and guiding layers go to Alert instead of re-sending a motor command.

use std::time::Duration;

use super::{AsciiCommand, BinaryCommand, BinaryReply, ProtocolError, ReplyShape, Transport};
use super::DEFAULT_TIMEOUT_MS;

/// Cumulative traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCounters {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub exchanges: u64,
    pub failures: u64,
}

pub struct QueryEngine<T: Transport> {
    transport: T,
    timeout: Duration,
    counters: QueryCounters,
}

impl<T: Transport> QueryEngine<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timeout(transport, Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    pub fn with_timeout(transport: T, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            counters: QueryCounters::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn counters(&self) -> QueryCounters {
        self.counters
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// One request/reply exchange. `Silent` shapes return an empty reply.
    pub fn query(
        &mut self,
        request: &[u8],
        shape: ReplyShape,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let result = self.exchange(request, shape, timeout);
        self.counters.exchanges += 1;
        match &result {
            Ok(reply) => {
                self.counters.rx_bytes += reply.len() as u64;
                tracing::debug!(
                    "query {:?} -> {:?}",
                    String::from_utf8_lossy(request),
                    String::from_utf8_lossy(reply)
                );
            }
            Err(e) => {
                self.counters.failures += 1;
                tracing::debug!("query {:?} failed: {}", String::from_utf8_lossy(request), e);
            }
        }
        result
    }

    fn exchange(
        &mut self,
        request: &[u8],
        shape: ReplyShape,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.transport.discard_input()?;
        self.transport.write_all(request)?;
        self.counters.tx_bytes += request.len() as u64;

        match shape {
            ReplyShape::Terminated(terminator) => self.transport.read_until(terminator, timeout),
            ReplyShape::Fixed(len) => self.transport.read_exact(len, timeout),
            ReplyShape::Silent => Ok(Vec::new()),
        }
    }

    /// Read a continuation of the previous reply (no discard, no request)
    pub fn read_more(&mut self, shape: ReplyShape) -> Result<Vec<u8>, ProtocolError> {
        let reply = match shape {
            ReplyShape::Terminated(terminator) => {
                self.transport.read_until(terminator, self.timeout)
            }
            ReplyShape::Fixed(len) => self.transport.read_exact(len, self.timeout),
            ReplyShape::Silent => Ok(Vec::new()),
        }?;
        self.counters.rx_bytes += reply.len() as u64;
        Ok(reply)
    }

    /// Send a request that has no reply
    pub fn send(&mut self, request: &[u8]) -> Result<(), ProtocolError> {
        self.query(request, ReplyShape::Silent, self.timeout).map(|_| ())
    }

    pub fn query_ascii(
        &mut self,
        command: &AsciiCommand,
        shape: ReplyShape,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.query(&command.to_bytes(), shape, self.timeout)
    }

    /// Send a binary command and validate its `reply_len`-byte reply.
    ///
    /// Pass `0` for commands the device does not answer; the returned reply
    /// is then empty and unchecked.
    pub fn query_binary(
        &mut self,
        command: &BinaryCommand,
        reply_len: usize,
    ) -> Result<Option<BinaryReply>, ProtocolError> {
        if reply_len == 0 {
            self.query(&command.to_bytes(), ReplyShape::Silent, self.timeout)?;
            return Ok(None);
        }
        let bytes = self.query(&command.to_bytes(), ReplyShape::Fixed(reply_len), self.timeout)?;
        BinaryReply::parse(command.opcode(), reply_len, bytes).map(Some)
    }

    /// Binary command with a mandatory reply
    pub fn request_binary(
        &mut self,
        command: &BinaryCommand,
        reply_len: usize,
    ) -> Result<BinaryReply, ProtocolError> {
        self.query_binary(command, reply_len.max(1))?
            .ok_or_else(|| ProtocolError::malformed("missing reply"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MockTransport;

    #[test]
    fn test_discards_before_each_exchange() {
        let mock = MockTransport::new();
        mock.inject("stale#");
        mock.expect(":GVP#", "Avalon#");
        let mut engine = QueryEngine::new(mock.clone());

        let reply = engine
            .query_ascii(&AsciiCommand::new("GVP"), ReplyShape::HASH)
            .unwrap();
        assert_eq!(reply, b"Avalon".to_vec());
        assert_eq!(mock.discard_count(), 1);
    }

    #[test]
    fn test_timeout_and_malformed_are_distinct_and_not_retried() {
        let mock = MockTransport::new();
        mock.expect_silent(vec![0x8d]);
        mock.expect(vec![0x8d], vec![0x82, 0x00, 0x00]);
        let mut engine = QueryEngine::new(mock.clone());
        let cmd = BinaryCommand::new(0x8d);

        let first = engine.request_binary(&cmd, 3).unwrap_err();
        assert!(first.is_transport_fault());
        assert_eq!(mock.written().len(), 1);

        let second = engine.request_binary(&cmd, 3).unwrap_err();
        assert!(second.is_protocol_fault());
        assert_eq!(mock.written().len(), 2);

        let counters = engine.counters();
        assert_eq!(counters.exchanges, 2);
        assert_eq!(counters.failures, 2);
    }

    #[test]
    fn test_silent_command() {
        let mock = MockTransport::new();
        mock.expect_silent(":X0AAUX1ST#");
        let mut engine = QueryEngine::new(mock.clone());
        engine.send(b":X0AAUX1ST#").unwrap();
        assert_eq!(engine.counters().tx_bytes, 11);
        assert_eq!(mock.remaining(), 0);
    }
}
