//! Primitive field codec shared by every wire message.
//!
//! All integers are 4-byte big-endian, booleans a single byte and strings a
//! 2-byte big-endian length followed by UTF-8 bytes. Every read checks the
//! declared size against what is left in the datagram so a corrupt length can
//! never cause an out-of-bounds access or an oversized allocation.
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use super::MessageType;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{message}: required field '{field}' was never set")]
    Unset {
        message: MessageType,
        field: &'static str,
    },

    #[error("{message}: truncated '{field}', needed {needed} bytes but {remaining} remain")]
    Truncated {
        message: MessageType,
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("{message}: malformed '{field}', {reason}")]
    Malformed {
        message: MessageType,
        field: &'static str,
        reason: String,
    },

    #[error("{message}: '{field}' is {len} bytes, longer than the {max} byte limit")]
    TooLong {
        message: MessageType,
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("expected a {expected} datagram but the tag is {found}")]
    WrongType { expected: MessageType, found: u8 },

    #[error("message of {size} bytes exceeds the datagram limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("empty datagram")]
    Empty,
}

pub(crate) const INT_SIZE: usize = 4;
pub(crate) const BOOL_SIZE: usize = 1;
pub(crate) const STRING_PREFIX_SIZE: usize = 2;

/// Encoded size of a string field.
pub(crate) fn string_len(s: &str) -> usize {
    STRING_PREFIX_SIZE + s.len()
}

/// Appends fields to an outgoing datagram.
pub(crate) struct Writer<'a> {
    buf: &'a mut BytesMut,
    message: MessageType,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut BytesMut, message: MessageType) -> Self {
        Self { buf, message }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    /// Writes a non-negative quantity that travels as a signed 32-bit integer.
    pub fn put_count(&mut self, field: &'static str, v: usize) -> Result<(), ProtocolError> {
        let v = i32::try_from(v).map_err(|_| ProtocolError::Malformed {
            message: self.message,
            field,
            reason: format!("{v} does not fit a signed 32-bit integer"),
        })?;
        self.buf.put_i32(v);
        Ok(())
    }

    pub fn put_string(&mut self, field: &'static str, s: &str) -> Result<(), ProtocolError> {
        let len = u16::try_from(s.len()).map_err(|_| ProtocolError::TooLong {
            message: self.message,
            field,
            len: s.len(),
            max: u16::MAX as usize,
        })?;
        self.buf.put_u16(len);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    /// Writes a 4-byte length followed by the raw bytes.
    pub fn put_blob(&mut self, field: &'static str, blob: &[u8]) -> Result<(), ProtocolError> {
        self.put_count(field, blob.len())?;
        self.buf.put_slice(blob);
        Ok(())
    }
}

/// Consumes fields from an incoming datagram.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    message: MessageType,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], message: MessageType) -> Self {
        Self { buf, message }
    }

    fn need(&self, field: &'static str, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Truncated {
                message: self.message,
                field,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn malformed(&self, field: &'static str, reason: String) -> ProtocolError {
        ProtocolError::Malformed {
            message: self.message,
            field,
            reason,
        }
    }

    pub fn get_bool(&mut self, field: &'static str) -> Result<bool, ProtocolError> {
        self.need(field, BOOL_SIZE)?;
        Ok(self.buf.get_u8() != 0)
    }

    pub fn get_i32(&mut self, field: &'static str) -> Result<i32, ProtocolError> {
        self.need(field, INT_SIZE)?;
        Ok(self.buf.get_i32())
    }

    /// Reads a non-negative 32-bit quantity.
    pub fn get_u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        let v = self.get_i32(field)?;
        u32::try_from(v).map_err(|_| self.malformed(field, format!("negative value {v}")))
    }

    /// Reads an element count and checks that `count * elem_size` bytes could
    /// still follow.
    pub fn get_count(
        &mut self,
        field: &'static str,
        elem_size: usize,
    ) -> Result<usize, ProtocolError> {
        let count = self.get_u32(field)? as usize;
        let needed = count.saturating_mul(elem_size);
        if needed > self.buf.remaining() {
            return Err(ProtocolError::Truncated {
                message: self.message,
                field,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(count)
    }

    pub fn get_string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        self.need(field, STRING_PREFIX_SIZE)?;
        let len = self.buf.get_u16() as usize;
        self.need(field, len)?;
        let s = std::str::from_utf8(&self.buf[..len])
            .map_err(|e| self.malformed(field, e.to_string()))?
            .to_string();
        self.buf.advance(len);
        Ok(s)
    }

    pub fn get_i32_vec(
        &mut self,
        field: &'static str,
        count: usize,
    ) -> Result<Vec<i32>, ProtocolError> {
        self.need(field, count.saturating_mul(INT_SIZE))?;
        Ok((0..count).map(|_| self.buf.get_i32()).collect())
    }

    pub fn get_blob(&mut self, field: &'static str) -> Result<Vec<u8>, ProtocolError> {
        let len = self.get_count(field, 1)?;
        let blob = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(blob)
    }
}
