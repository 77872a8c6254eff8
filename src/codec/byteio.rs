//! Little-endian byte reader/writer with Bitcoin varint support
//!
//! All multi-byte integers on the wire are little-endian; ports inside
//! network addresses are the one big-endian exception and are handled at
//! the call site.

use thiserror::Error;

/// Codec errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),
    #[error("invalid string data: {0}")]
    InvalidString(String),
}

/// Cursor-style reader over a byte slice
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current read offset
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEof(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_fixed::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.read_fixed()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.read_fixed()?))
    }

    /// Reads a Bitcoin variable-length integer.
    ///
    /// Values below 0xFD are a single byte; marker 0xFD is followed by a
    /// u16, 0xFE by a u32, and 0xFF by a u64, all little-endian.
    pub fn read_varint(&mut self) -> Result<u64, CodecError> {
        let marker = self.read_u8()?;
        match marker {
            0xFD => Ok(self.read_u16_le()? as u64),
            0xFE => Ok(self.read_u32_le()? as u64),
            0xFF => self.read_u64_le(),
            n => Ok(n as u64),
        }
    }

    /// Reads a varint-length-prefixed ASCII string
    pub fn read_var_str(&mut self) -> Result<String, CodecError> {
        let len = self.read_varint()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::InvalidString(e.to_string()))
    }
}

/// Growable little-endian byte writer
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u16_be(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a Bitcoin variable-length integer
    pub fn write_varint(&mut self, value: u64) {
        if value < 0xFD {
            self.write_u8(value as u8);
        } else if value <= 0xFFFF {
            self.write_u8(0xFD);
            self.write_u16_le(value as u16);
        } else if value <= 0xFFFF_FFFF {
            self.write_u8(0xFE);
            self.write_u32_le(value as u32);
        } else {
            self.write_u8(0xFF);
            self.write_u64_le(value);
        }
    }

    /// Writes a varint-length-prefixed string
    pub fn write_var_str(&mut self, value: &str) {
        self.write_varint(value.len() as u64);
        self.write_bytes(value.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_roundtrip(value: u64) -> usize {
        let mut writer = ByteWriter::new();
        writer.write_varint(value);
        let encoded = writer.into_inner();
        let mut reader = ByteReader::new(&encoded);
        assert_eq!(reader.read_varint().unwrap(), value);
        assert_eq!(reader.remaining(), 0);
        encoded.len()
    }

    #[test]
    fn test_varint_boundaries() {
        assert_eq!(varint_roundtrip(0), 1);
        assert_eq!(varint_roundtrip(0xFC), 1);
        assert_eq!(varint_roundtrip(0xFD), 3);
        assert_eq!(varint_roundtrip(0xFFFF), 3);
        assert_eq!(varint_roundtrip(0x10000), 5);
        assert_eq!(varint_roundtrip(0xFFFF_FFFF), 5);
        assert_eq!(varint_roundtrip(0x1_0000_0000), 9);
    }

    #[test]
    fn test_var_str_roundtrip() {
        let mut writer = ByteWriter::new();
        writer.write_var_str("/Satoshi:0.15.0/");
        let encoded = writer.into_inner();
        let mut reader = ByteReader::new(&encoded);
        assert_eq!(reader.read_var_str().unwrap(), "/Satoshi:0.15.0/");
    }

    #[test]
    fn test_eof_reported_at_offset() {
        let mut reader = ByteReader::new(&[1, 2]);
        reader.read_u8().unwrap();
        let err = reader.read_u32_le().unwrap_err();
        assert_eq!(err, CodecError::UnexpectedEof(1));
    }

    #[test]
    fn test_mixed_integers() {
        let mut writer = ByteWriter::new();
        writer.write_i32_le(-7);
        writer.write_u64_le(0xDEAD_BEEF);
        writer.write_u16_be(8333);
        let encoded = writer.into_inner();

        let mut reader = ByteReader::new(&encoded);
        assert_eq!(reader.read_i32_le().unwrap(), -7);
        assert_eq!(reader.read_u64_le().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_u16_be().unwrap(), 8333);
    }
}
