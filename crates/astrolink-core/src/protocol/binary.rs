//! Binary command codec
//!
//! Commands are a single opcode byte followed by up to four payload bytes.
//! Replies have a fixed length per opcode, known in advance, with no
//! terminator; the first byte echoes the opcode.
//!
//! Position payloads are decimal digit sequences rather than binary
//! integers: ones, tens and hundreds each take one byte, and the last byte
//! carries the thousands (so `0..=255_999` fits).

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::ProtocolError;

/// Largest value [`BinaryCommand::with_digits`] can carry
pub const MAX_DIGIT_VALUE: u32 = 255_999;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryCommand {
    opcode: u8,
    payload: Vec<u8>,
}

impl BinaryCommand {
    pub fn new(opcode: u8) -> Self {
        Self {
            opcode,
            payload: Vec::new(),
        }
    }

    pub fn with_byte(opcode: u8, value: u8) -> Self {
        Self {
            opcode,
            payload: vec![value],
        }
    }

    pub fn with_i16_le(opcode: u8, value: i16) -> Self {
        let mut buf = [0u8; 2];
        LittleEndian::write_i16(&mut buf, value);
        Self {
            opcode,
            payload: buf.to_vec(),
        }
    }

    pub fn with_i32_le(opcode: u8, value: i32) -> Self {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, value);
        Self {
            opcode,
            payload: buf.to_vec(),
        }
    }

    /// Opcode followed by the 4-byte decimal digit encoding of `value`
    pub fn with_digits(opcode: u8, value: u32) -> Result<Self, ProtocolError> {
        Ok(Self {
            opcode,
            payload: encode_digits(value)?.to_vec(),
        })
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.payload.len());
        bytes.push(self.opcode);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Encode `value` as [ones, tens, hundreds, thousands]
pub fn encode_digits(value: u32) -> Result<[u8; 4], ProtocolError> {
    if value > MAX_DIGIT_VALUE {
        return Err(ProtocolError::OutOfRange {
            field: "digit payload",
            value: value as i64,
        });
    }
    Ok([
        (value % 10) as u8,
        (value / 10 % 10) as u8,
        (value / 100 % 10) as u8,
        (value / 1000) as u8,
    ])
}

/// Inverse of [`encode_digits`]
pub fn decode_digits(bytes: &[u8]) -> Result<u32, ProtocolError> {
    let [ones, tens, hundreds, thousands] = <[u8; 4]>::try_from(bytes).map_err(|_| {
        ProtocolError::malformed(format!("digit payload needs 4 bytes, got {}", bytes.len()))
    })?;
    if ones > 9 || tens > 9 || hundreds > 9 {
        return Err(ProtocolError::malformed(format!(
            "digit payload {:02x?} has a byte above 9",
            bytes
        )));
    }
    Ok(thousands as u32 * 1000 + hundreds as u32 * 100 + tens as u32 * 10 + ones as u32)
}

/// A fixed-length reply whose length and opcode echo have been checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryReply {
    bytes: Vec<u8>,
}

impl BinaryReply {
    /// Validate `bytes` as the reply to `opcode`
    pub fn parse(opcode: u8, expected_len: usize, bytes: Vec<u8>) -> Result<Self, ProtocolError> {
        if bytes.len() != expected_len {
            return Err(ProtocolError::malformed(format!(
                "reply to 0x{:02x} is {} bytes, expected {}",
                opcode,
                bytes.len(),
                expected_len
            )));
        }
        match bytes.first() {
            Some(&echo) if echo == opcode => Ok(Self { bytes }),
            Some(&echo) => Err(ProtocolError::malformed(format!(
                "reply echoes 0x{:02x}, expected 0x{:02x}",
                echo, opcode
            ))),
            None => Err(ProtocolError::malformed("empty reply")),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn field(&self, at: usize, width: usize) -> Result<&[u8], ProtocolError> {
        self.bytes.get(at..at + width).ok_or_else(|| {
            ProtocolError::malformed(format!(
                "field at {}..{} past end of {}-byte reply",
                at,
                at + width,
                self.bytes.len()
            ))
        })
    }

    pub fn byte(&self, at: usize) -> Result<u8, ProtocolError> {
        Ok(self.field(at, 1)?[0])
    }

    pub fn u16_le(&self, at: usize) -> Result<u16, ProtocolError> {
        Ok(LittleEndian::read_u16(self.field(at, 2)?))
    }

    pub fn i16_be(&self, at: usize) -> Result<i16, ProtocolError> {
        Ok(BigEndian::read_i16(self.field(at, 2)?))
    }

    pub fn i16_le(&self, at: usize) -> Result<i16, ProtocolError> {
        Ok(LittleEndian::read_i16(self.field(at, 2)?))
    }

    pub fn i32_le(&self, at: usize) -> Result<i32, ProtocolError> {
        Ok(LittleEndian::read_i32(self.field(at, 4)?))
    }
}
