//! Byte-level primitives for the update format.
//!
//! Unsigned integers use LEB128: seven payload bits per byte, high bit set
//! on every byte except the last. Strings and opaque payloads are
//! length-prefixed.

use crate::error::DecodeError;

/// Longest LEB128 encoding of a `u64`.
const MAX_VAR_LEN: usize = 10;

/// Append-only byte writer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Encoder {
        return Encoder { buf: Vec::new() };
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write an unsigned LEB128 integer.
    pub fn write_var(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Write a length-prefixed byte payload.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_var(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn len(&self) -> usize {
        return self.buf.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.buf.is_empty();
    }

    pub fn into_bytes(self) -> Vec<u8> {
        return self.buf;
    }
}

/// Cursor over an input buffer.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Decoder<'a> {
        return Decoder { buf, pos: 0 };
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        return self.buf.len() - self.pos;
    }

    /// Fail unless every byte was consumed.
    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => return Ok(()),
            n => return Err(DecodeError::TrailingBytes(n)),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEnd)?;
        self.pos += 1;
        return Ok(byte);
    }

    /// Read an unsigned LEB128 integer.
    pub fn read_var(&mut self) -> Result<u64, DecodeError> {
        let mut result: u64 = 0;
        for i in 0..MAX_VAR_LEN {
            let byte = self.read_u8()?;
            let part = (byte & 0x7f) as u64;
            let shift = (i * 7) as u32;
            // The tenth byte may only carry the single top bit
            if i == MAX_VAR_LEN - 1 && part > 1 {
                return Err(DecodeError::VarIntOverflow);
            }
            result |= part << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        return Err(DecodeError::VarIntOverflow);
    }

    /// Read an unsigned LEB128 integer that must fit a `u32`.
    pub fn read_var_u32(&mut self) -> Result<u32, DecodeError> {
        let value = self.read_var()?;
        return u32::try_from(value).map_err(|_| DecodeError::VarIntOverflow);
    }

    /// Read a length-prefixed byte payload.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_var()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::VarIntOverflow)?;
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEnd);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        return Ok(bytes);
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<&'a str, DecodeError> {
        let bytes = self.read_bytes()?;
        return std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_small_values_take_one_byte() {
        let mut enc = Encoder::new();
        enc.write_var(0);
        enc.write_var(127);
        assert_eq!(enc.into_bytes(), vec![0x00, 0x7f]);
    }

    #[test]
    fn var_multi_byte_layout() {
        let mut enc = Encoder::new();
        enc.write_var(300);
        assert_eq!(enc.into_bytes(), vec![0xac, 0x02]);
    }

    #[test]
    fn var_extremes() {
        let mut enc = Encoder::new();
        enc.write_var(u64::MAX);
        let bytes = enc.into_bytes();
        assert_eq!(bytes.len(), MAX_VAR_LEN);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var().unwrap(), u64::MAX);
        assert!(dec.finish().is_ok());
    }

    #[test]
    fn var_overflow_is_rejected() {
        let bytes = [0xff; 11];
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var(), Err(DecodeError::VarIntOverflow));
    }

    #[test]
    fn u32_overflow_is_rejected() {
        let mut enc = Encoder::new();
        enc.write_var(u32::MAX as u64 + 1);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var_u32(), Err(DecodeError::VarIntOverflow));
    }

    #[test]
    fn truncated_payload() {
        let mut enc = Encoder::new();
        enc.write_string("hello");
        let bytes = enc.into_bytes();

        let mut dec = Decoder::new(&bytes[..3]);
        assert_eq!(dec.read_string(), Err(DecodeError::UnexpectedEnd));
    }

    #[test]
    fn invalid_utf8() {
        let mut enc = Encoder::new();
        enc.write_bytes(&[0xff, 0xfe]);
        let bytes = enc.into_bytes();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_string(), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn trailing_bytes() {
        let bytes = [0x01, 0x02];
        let mut dec = Decoder::new(&bytes);
        dec.read_u8().unwrap();
        assert_eq!(dec.finish(), Err(DecodeError::TrailingBytes(1)));
    }
}
