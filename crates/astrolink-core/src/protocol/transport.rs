//! Byte-stream transports
//!
//! A [`Transport`] writes a request and reads a reply, either up to a
//! terminator byte or an exact byte count, within a deadline. It never
//! retries: all retry policy belongs to callers of the query engine.
//!
//! [`ChannelTransport`] implements the contract over any [`Channel`]
//! (a serial port or a TCP bridge).

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use super::ProtocolError;

/// Contract between the query engine and the wire
pub trait Transport: Send {
    /// Write every byte of `bytes`
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError>;

    /// Read until `terminator` arrives; the terminator is not returned
    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, ProtocolError>;

    /// Read exactly `len` bytes
    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, ProtocolError>;

    /// Drop unread input left over from an earlier, desynchronised exchange
    fn discard_input(&mut self) -> Result<(), ProtocolError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        (**self).write_all(bytes)
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        (**self).read_until(terminator, timeout)
    }

    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        (**self).read_exact(len, timeout)
    }

    fn discard_input(&mut self) -> Result<(), ProtocolError> {
        (**self).discard_input()
    }
}

/// Abstraction for communication channels (Serial or TCP)
pub trait Channel: Read + Write + Send {
    /// Clear input buffers
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Get number of bytes available to read
    fn bytes_to_read(&mut self) -> io::Result<u32>;
}

/// Serial port wrapper implementing [`Channel`]
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Channel for SerialChannel {
    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port
            .bytes_to_read()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// TCP stream wrapper implementing [`Channel`], for serial-over-network bridges
pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Channel for TcpChannel {
    fn clear_input_buffer(&mut self) -> io::Result<()> {
        // No kernel call for this on sockets: drain with non-blocking reads
        self.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 1024];
        let result = loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.stream.set_nonblocking(false)?;
        result
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 1024];
        let result = self.stream.peek(&mut buf);
        self.stream.set_nonblocking(false)?;

        match result {
            Ok(n) => Ok(n as u32),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// [`Transport`] over a [`Channel`], polling `bytes_to_read()` so that reads
/// never block past the deadline.
pub struct ChannelTransport<C: Channel> {
    channel: C,
    poll_interval: Duration,
}

impl<C: Channel> ChannelTransport<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            poll_interval: Duration::from_millis(2),
        }
    }

    /// Read whatever is available (up to `max`) without blocking
    fn read_available(&mut self, max: usize) -> Result<Vec<u8>, ProtocolError> {
        let available = self
            .channel
            .bytes_to_read()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))? as usize;
        if available == 0 || max == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; available.min(max)];
        match self.channel.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(ProtocolError::SerialError(e.to_string())),
        }
    }
}

impl<C: Channel> Transport for ChannelTransport<C> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        tracing::trace!("write {} bytes: {:02x?}", bytes.len(), bytes);
        self.channel.write_all(bytes)?;
        self.channel.flush()?;
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let start = Instant::now();
        let mut response = Vec::new();

        loop {
            // One byte at a time so nothing after the terminator is consumed
            let chunk = self.read_available(1)?;
            match chunk.first() {
                Some(&b) if b == terminator => return Ok(response),
                Some(&b) => response.push(b),
                None => {
                    if start.elapsed() > timeout {
                        return Err(ProtocolError::Timeout {
                            expected: format!("terminator {:?}", terminator as char),
                            received: response.len(),
                            waited_ms: timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(self.poll_interval);
                }
            }
        }
    }

    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let start = Instant::now();
        let mut response = Vec::with_capacity(len);

        while response.len() < len {
            let chunk = self.read_available(len - response.len())?;
            if chunk.is_empty() {
                if start.elapsed() > timeout {
                    return Err(ProtocolError::Timeout {
                        expected: format!("{} bytes", len),
                        received: response.len(),
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
                std::thread::sleep(self.poll_interval);
                continue;
            }
            response.extend_from_slice(&chunk);
        }

        tracing::trace!("read {} bytes: {:02x?}", response.len(), response);
        Ok(response)
    }

    fn discard_input(&mut self) -> Result<(), ProtocolError> {
        self.channel
            .clear_input_buffer()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory channel: bytes pushed into `incoming` become readable
    struct LoopChannel {
        incoming: VecDeque<u8>,
        written: Vec<u8>,
    }

    impl Read for LoopChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.incoming.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.incoming.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }

    impl Write for LoopChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Channel for LoopChannel {
        fn clear_input_buffer(&mut self) -> io::Result<()> {
            self.incoming.clear();
            Ok(())
        }

        fn bytes_to_read(&mut self) -> io::Result<u32> {
            Ok(self.incoming.len() as u32)
        }
    }

    fn transport_with(input: &[u8]) -> ChannelTransport<LoopChannel> {
        ChannelTransport::new(LoopChannel {
            incoming: input.iter().copied().collect(),
            written: Vec::new(),
        })
    }

    #[test]
    fn test_read_until_stops_at_terminator() {
        let mut t = transport_with(b"AX1=0500123#extra");
        let reply = t.read_until(b'#', Duration::from_millis(50)).unwrap();
        assert_eq!(reply, b"AX1=0500123".to_vec());
        // Bytes after the terminator stay in the channel
        assert_eq!(t.read_exact(5, Duration::from_millis(50)).unwrap(), b"extra".to_vec());
    }

    #[test]
    fn test_read_exact_short_reply_times_out() {
        let mut t = transport_with(&[0x8d, 0x10]);
        match t.read_exact(3, Duration::from_millis(20)) {
            Err(ProtocolError::Timeout { received, .. }) => assert_eq!(received, 2),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_discard_input_drops_stale_bytes() {
        let mut t = transport_with(b"stale#");
        t.discard_input().unwrap();
        assert!(t.read_until(b'#', Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_write_all_reaches_channel() {
        let mut t = transport_with(b"");
        t.write_all(b":GR#").unwrap();
        assert_eq!(t.channel.written, b":GR#".to_vec());
    }
}
