//! Block headers and the genesis constant
//!
//! A header's hash is the double SHA-256 of its fixed 80-byte serialization,
//! computed on first use and cached for the header's lifetime. The trailing
//! transaction-count varint seen on the wire is carried but excluded from
//! both the hash and the persisted form.

use crate::codec::hash::Hash256;
use crate::codec::{double_sha256, ByteReader, ByteWriter, CodecError};
use std::sync::OnceLock;

/// Size of the hashed header serialization
pub const HEADER_WIRE_LEN: usize = 80;

/// A block header as it appears on the wire
#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    /// Declared transaction count from the wire (zero in `headers` messages)
    pub tx_count: u64,
    /// Not yet flushed to the header log
    pub dirty: bool,
    hash: OnceLock<Hash256>,
}

impl BlockHeader {
    pub fn new(
        version: i32,
        prev_hash: Hash256,
        merkle_root: Hash256,
        timestamp: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self {
            version,
            prev_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
            tx_count: 0,
            dirty: false,
            hash: OnceLock::new(),
        }
    }

    /// The fixed genesis header, root of the canonical chain
    pub fn genesis() -> Self {
        let merkle_root: Hash256 = [
            0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76,
            0x8f, 0x61, 0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa,
            0x4b, 0x1e, 0x5e, 0x4a,
        ];
        Self::new(1, [0u8; 32], merkle_root, 1_231_006_505, 0x1D00_FFFF, 2_083_236_893)
    }

    /// Hash of the 80-byte serialization, cached after the first call
    pub fn hash(&self) -> Hash256 {
        *self.hash.get_or_init(|| {
            let mut writer = ByteWriter::with_capacity(HEADER_WIRE_LEN);
            self.write_fixed(&mut writer);
            double_sha256(&writer.into_inner())
        })
    }

    /// Reads the 80-byte form plus the trailing transaction-count varint
    pub fn read_wire(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let mut header = Self::read_fixed(reader)?;
        header.tx_count = reader.read_varint()?;
        Ok(header)
    }

    /// Writes the 80-byte form plus the trailing transaction-count varint
    pub fn write_wire(&self, writer: &mut ByteWriter) {
        self.write_fixed(writer);
        writer.write_varint(self.tx_count);
    }

    /// Reads the fixed 80-byte form, as persisted in the header log
    pub fn read_fixed(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let version = reader.read_i32_le()?;
        let prev_hash = reader.read_fixed::<32>()?;
        let merkle_root = reader.read_fixed::<32>()?;
        let timestamp = reader.read_u32_le()?;
        let bits = reader.read_u32_le()?;
        let nonce = reader.read_u32_le()?;
        Ok(Self::new(version, prev_hash, merkle_root, timestamp, bits, nonce))
    }

    /// Writes the fixed 80-byte form
    pub fn write_fixed(&self, writer: &mut ByteWriter) {
        writer.write_i32_le(self.version);
        writer.write_bytes(&self.prev_hash);
        writer.write_bytes(&self.merkle_root);
        writer.write_u32_le(self.timestamp);
        writer.write_u32_le(self.bits);
        writer.write_u32_le(self.nonce);
    }
}

/// Parses a `headers` payload: varint count, then each header followed by
/// its transaction-count varint (present even when zero).
pub fn parse_headers_payload(payload: &[u8]) -> Result<Vec<BlockHeader>, CodecError> {
    let mut reader = ByteReader::new(payload);
    let count = reader.read_varint()? as usize;
    let mut headers = Vec::with_capacity(count.min(2000));
    for _ in 0..count {
        headers.push(BlockHeader::read_wire(&mut reader)?);
    }
    Ok(headers)
}

/// Builds a `headers` payload from a slice of headers
pub fn build_headers_payload(headers: &[BlockHeader]) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    writer.write_varint(headers.len() as u64);
    for header in headers {
        header.write_wire(&mut writer);
    }
    writer.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::hash_to_hex;

    #[test]
    fn test_genesis_hash() {
        let genesis = BlockHeader::genesis();
        // Wire byte order of the well-known genesis hash.
        assert_eq!(
            hash_to_hex(&genesis.hash()),
            "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000"
        );
    }

    #[test]
    fn test_hash_is_stable() {
        let mut header = BlockHeader::genesis();
        let first = header.hash();
        // Mutating non-hashed state must not change the cached hash.
        header.dirty = true;
        header.tx_count = 99;
        assert_eq!(header.hash(), first);
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut header = BlockHeader::new(2, [5u8; 32], [6u8; 32], 1_400_000_000, 0x1B04_86E5, 77);
        header.tx_count = 300;

        let mut writer = ByteWriter::new();
        header.write_wire(&mut writer);
        let bytes = writer.into_inner();
        // 80 fixed bytes + 3-byte varint for 300
        assert_eq!(bytes.len(), HEADER_WIRE_LEN + 3);

        let mut reader = ByteReader::new(&bytes);
        let decoded = BlockHeader::read_wire(&mut reader).unwrap();
        assert_eq!(decoded.hash(), header.hash());
        assert_eq!(decoded.tx_count, 300);

        let mut rewritten = ByteWriter::new();
        decoded.write_wire(&mut rewritten);
        assert_eq!(rewritten.into_inner(), bytes);
    }

    #[test]
    fn test_headers_payload_roundtrip() {
        let headers = vec![BlockHeader::genesis(), BlockHeader::new(1, [1u8; 32], [2u8; 32], 3, 4, 5)];
        let payload = build_headers_payload(&headers);
        let decoded = parse_headers_payload(&payload).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].hash(), headers[0].hash());
        assert_eq!(decoded[1].hash(), headers[1].hash());
    }
}
