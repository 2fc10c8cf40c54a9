//! Scripted transport for tests and dry runs
//!
//! A [`MockTransport`] replays a script of exchanges: each written request is
//! matched against the next expected request and answered with bytes, with
//! silence, or with an I/O failure. Handles are cheap clones sharing one
//! state, so a test can keep a handle while the driver owns another.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{ProtocolError, Transport};

/// How the scripted device answers a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    Bytes(Vec<u8>),
    Silent,
    IoError(String),
}

#[derive(Debug, Clone)]
struct Exchange {
    request: Vec<u8>,
    reply: MockReply,
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<Exchange>,
    /// Answers used whenever the script head does not match
    standing: Vec<Exchange>,
    pending: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    unexpected: Vec<Vec<u8>>,
    discards: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Expect `request` next and answer with `reply`
    pub fn expect(&self, request: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) -> &Self {
        self.push(request, MockReply::Bytes(reply.as_ref().to_vec()))
    }

    /// Expect `request` next and send nothing back
    pub fn expect_silent(&self, request: impl AsRef<[u8]>) -> &Self {
        self.push(request, MockReply::Silent)
    }

    /// Expect `request` next and fail the write
    pub fn expect_io_error(&self, request: impl AsRef<[u8]>, message: &str) -> &Self {
        self.push(request, MockReply::IoError(message.to_string()))
    }

    fn push(&self, request: impl AsRef<[u8]>, reply: MockReply) -> &Self {
        self.lock().script.push_back(Exchange {
            request: request.as_ref().to_vec(),
            reply,
        });
        self
    }

    /// Answer `request` with `reply` every time it is written outside the script
    pub fn always(&self, request: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) -> &Self {
        let request = request.as_ref().to_vec();
        let mut state = self.lock();
        state.standing.retain(|e| e.request != request);
        state.standing.push(Exchange {
            request,
            reply: MockReply::Bytes(reply.as_ref().to_vec()),
        });
        self
    }

    /// Queue unsolicited bytes, as left behind by an earlier broken exchange
    pub fn inject(&self, bytes: impl AsRef<[u8]>) {
        self.lock().pending.extend(bytes.as_ref().iter().copied());
    }

    /// Every request written so far, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Written requests rendered as text (ASCII protocols)
    pub fn written_text(&self) -> Vec<String> {
        self.lock()
            .written
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn clear_written(&self) {
        self.lock().written.clear();
    }

    /// Requests that matched neither the script head nor a standing answer
    pub fn unexpected(&self) -> Vec<Vec<u8>> {
        self.lock().unexpected.clone()
    }

    /// Scripted exchanges not yet consumed
    pub fn remaining(&self) -> usize {
        self.lock().script.len()
    }

    pub fn discard_count(&self) -> usize {
        self.lock().discards
    }
}

impl Transport for MockTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut state = self.lock();
        state.written.push(bytes.to_vec());

        let head_matches = state
            .script
            .front()
            .map_or(false, |head| head.request == bytes);
        let exchange = if head_matches {
            state.script.pop_front()
        } else {
            state.standing.iter().find(|e| e.request == bytes).cloned()
        };

        match exchange.map(|e| e.reply) {
            Some(MockReply::Bytes(reply)) => {
                state.pending.extend(reply);
                Ok(())
            }
            Some(MockReply::Silent) => Ok(()),
            Some(MockReply::IoError(message)) => Err(ProtocolError::IoError(io::Error::new(
                io::ErrorKind::BrokenPipe,
                message,
            ))),
            None => {
                tracing::debug!(
                    "mock transport: unscripted request {:?}",
                    String::from_utf8_lossy(bytes)
                );
                state.unexpected.push(bytes.to_vec());
                Ok(())
            }
        }
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let mut state = self.lock();
        match state.pending.iter().position(|&b| b == terminator) {
            Some(end) => {
                let mut reply: Vec<u8> = state.pending.drain(..=end).collect();
                reply.pop();
                Ok(reply)
            }
            None => {
                let received = state.pending.len();
                state.pending.clear();
                Err(ProtocolError::Timeout {
                    expected: format!("terminator {:?}", terminator as char),
                    received,
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let mut state = self.lock();
        if state.pending.len() >= len {
            return Ok(state.pending.drain(..len).collect());
        }
        let received = state.pending.len();
        state.pending.clear();
        Err(ProtocolError::Timeout {
            expected: format!("{} bytes", len),
            received,
            waited_ms: timeout.as_millis() as u64,
        })
    }

    fn discard_input(&mut self) -> Result<(), ProtocolError> {
        let mut state = self.lock();
        state.pending.clear();
        state.discards += 1;
        Ok(())
    }
}
