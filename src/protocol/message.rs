//! Wire frame codec and fixed message payloads
//!
//! Frame layout: `magic:4 | command:12 (ASCII, NUL-padded) | length:4 |
//! checksum:4 | payload`. The checksum is the first four bytes of the
//! double-SHA-256 of the payload.

use crate::codec::hash::Hash256;
use crate::codec::{double_sha256, ByteReader, ByteWriter, CodecError};
use crate::protocol::types::{InventoryType, NetAddress, ServiceFlags};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Main-network magic constant, little-endian on the wire
pub const MAGIC: u32 = 0xD9B4_BEF9;

/// Protocol version we speak
pub const PROTOCOL_VERSION: u32 = 70015;

/// Frame header size: magic + command + length + checksum
pub const FRAME_HEADER_LEN: usize = 24;

/// Upper bound on a single payload; anything larger is a corrupt frame
pub const MAX_PAYLOAD_LEN: usize = 4 * 1024 * 1024;

/// Frame-level errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("command name exceeds 12 bytes: {0}")]
    CommandTooLong(String),
}

/// One decoded wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub payload: Vec<u8>,
}

/// Builds a complete frame ready to write to a socket
pub fn build_frame(command: &str, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if command.len() > 12 {
        return Err(FrameError::CommandTooLong(command.to_string()));
    }
    let mut command_bytes = [0u8; 12];
    command_bytes[..command.len()].copy_from_slice(command.as_bytes());

    let mut writer = ByteWriter::with_capacity(FRAME_HEADER_LEN + payload.len());
    writer.write_u32_le(MAGIC);
    writer.write_bytes(&command_bytes);
    writer.write_u32_le(payload.len() as u32);
    let checksum = double_sha256(payload);
    writer.write_bytes(&checksum[..4]);
    writer.write_bytes(payload);
    Ok(writer.into_inner())
}

/// Attempts to extract one frame from the front of `buf`.
///
/// Resynchronizes by scanning for the magic and discarding everything ahead
/// of it. Frames with a bad checksum or an oversized length are consumed and
/// dropped without being returned. Returns `None` when the buffer does not
/// yet hold a complete frame; unconsumed bytes stay in place for the next
/// call.
pub fn extract_frame(buf: &mut Vec<u8>) -> Option<Frame> {
    loop {
        if !resync_to_magic(buf) {
            return None;
        }
        if buf.len() < FRAME_HEADER_LEN {
            return None;
        }

        let command = command_string(&buf[4..16]);
        let length = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
        if length > MAX_PAYLOAD_LEN {
            // Corrupt length field. Skip this magic and rescan.
            buf.drain(..4);
            continue;
        }
        if buf.len() < FRAME_HEADER_LEN + length {
            return None;
        }

        let checksum = [buf[20], buf[21], buf[22], buf[23]];
        let payload: Vec<u8> = buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length].to_vec();
        buf.drain(..FRAME_HEADER_LEN + length);

        let expected = double_sha256(&payload);
        if checksum != expected[..4] {
            log::debug!("dropping frame '{}' with bad checksum", command);
            continue;
        }

        return Some(Frame { command, payload });
    }
}

/// Discards bytes until the buffer starts with the magic. Returns false if
/// no magic is present, in which case the whole buffer is garbage and is
/// thrown away.
fn resync_to_magic(buf: &mut Vec<u8>) -> bool {
    if buf.len() < 4 {
        return false;
    }
    let magic = MAGIC.to_le_bytes();
    if buf[..4] == magic {
        return true;
    }
    match buf.windows(4).position(|window| window == magic) {
        Some(offset) => {
            buf.drain(..offset);
            true
        }
        None => {
            buf.clear();
            false
        }
    }
}

fn command_string(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect()
}

/// Remote peer identity captured from a `version` payload
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: u32,
    pub services: ServiceFlags,
    pub timestamp: u64,
    pub nonce: u64,
    pub sub_version: String,
    pub start_height: i32,
}

/// Builds our `version` payload
pub fn build_version_payload(nonce: u64, sub_version: &str, start_height: i32) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    writer.write_u32_le(PROTOCOL_VERSION);
    writer.write_u64_le(ServiceFlags::NODE_NETWORK.bits());
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    writer.write_u64_le(timestamp);
    NetAddress::unspecified(ServiceFlags::NODE_NETWORK).write(&mut writer, false);
    NetAddress::unspecified(ServiceFlags::empty()).write(&mut writer, false);
    writer.write_u64_le(nonce);
    writer.write_var_str(sub_version);
    writer.write_i32_le(start_height);
    writer.into_inner()
}

/// Parses a remote `version` payload
pub fn parse_version(payload: &[u8]) -> Result<VersionInfo, CodecError> {
    let mut reader = ByteReader::new(payload);
    let version = reader.read_u32_le()?;
    let services = ServiceFlags::from_bits_retain(reader.read_u64_le()?);
    let timestamp = reader.read_u64_le()?;
    NetAddress::read(&mut reader, false)?;
    NetAddress::read(&mut reader, false)?;
    let nonce = reader.read_u64_le()?;
    let sub_version = reader.read_var_str()?;
    let start_height = reader.read_i32_le()?;
    Ok(VersionInfo {
        version,
        services,
        timestamp,
        nonce,
        sub_version,
        start_height,
    })
}

/// Parses an `addr` payload into its address entries
pub fn parse_addr(payload: &[u8]) -> Result<Vec<NetAddress>, CodecError> {
    let mut reader = ByteReader::new(payload);
    let count = reader.read_varint()? as usize;
    let mut addrs = Vec::with_capacity(count.min(1000));
    for _ in 0..count {
        addrs.push(NetAddress::read(&mut reader, true)?);
    }
    Ok(addrs)
}

/// Parses an `inv` payload into typed entries
pub fn parse_inv(payload: &[u8]) -> Result<Vec<(InventoryType, Hash256)>, CodecError> {
    let mut reader = ByteReader::new(payload);
    let count = reader.read_varint()? as usize;
    let mut entries = Vec::with_capacity(count.min(50_000));
    for _ in 0..count {
        let kind = InventoryType::from_wire(reader.read_u32_le()?);
        let hash = reader.read_fixed::<32>()?;
        entries.push((kind, hash));
    }
    Ok(entries)
}

/// Builds a `getheaders` payload from a locator hash and a stop hash
pub fn build_getheaders_payload(locator: &Hash256, stop: &Hash256) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    writer.write_u32_le(PROTOCOL_VERSION);
    writer.write_varint(1);
    writer.write_bytes(locator);
    writer.write_bytes(stop);
    writer.into_inner()
}

/// Parses an inbound `getheaders` payload: locator hashes plus stop hash
pub fn parse_getheaders(payload: &[u8]) -> Result<(Vec<Hash256>, Hash256), CodecError> {
    let mut reader = ByteReader::new(payload);
    let _version = reader.read_u32_le()?;
    let count = reader.read_varint()? as usize;
    let mut hashes = Vec::with_capacity(count.min(101));
    for _ in 0..count {
        hashes.push(reader.read_fixed::<32>()?);
    }
    let stop = reader.read_fixed::<32>()?;
    Ok((hashes, stop))
}

/// Builds a `getdata` payload requesting full blocks
pub fn build_getdata_blocks(hashes: &[Hash256]) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    writer.write_varint(hashes.len() as u64);
    for hash in hashes {
        writer.write_u32_le(InventoryType::Block.to_wire());
        writer.write_bytes(hash);
    }
    writer.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let payload = b"hello".to_vec();
        let mut buf = build_frame("ping", &payload).unwrap();
        let frame = extract_frame(&mut buf).unwrap();
        assert_eq!(frame.command, "ping");
        assert_eq!(frame.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let full = build_frame("headers", &[1, 2, 3, 4]).unwrap();
        let mut buf = full[..full.len() - 2].to_vec();
        assert!(extract_frame(&mut buf).is_none());
        // Buffer untouched while waiting for the rest.
        assert_eq!(buf.len(), full.len() - 2);
    }

    #[test]
    fn test_checksum_mismatch_drops_frame() {
        let mut buf = build_frame("inv", &[9, 9, 9]).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(extract_frame(&mut buf).is_none());
        // The corrupt frame was consumed, not retained.
        assert!(buf.is_empty());
    }

    #[test]
    fn test_resync_skips_garbage() {
        let mut buf = vec![0xAB, 0xCD, 0xEF];
        buf.extend(build_frame("verack", &[]).unwrap());
        let frame = extract_frame(&mut buf).unwrap();
        assert_eq!(frame.command, "verack");
    }

    #[test]
    fn test_no_magic_discards_buffer() {
        let mut buf = vec![0u8; 64];
        assert!(extract_frame(&mut buf).is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = build_frame("ping", &[1]).unwrap();
        buf.extend(build_frame("pong", &[1]).unwrap());
        assert_eq!(extract_frame(&mut buf).unwrap().command, "ping");
        assert_eq!(extract_frame(&mut buf).unwrap().command, "pong");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_version_payload_roundtrip() {
        let payload = build_version_payload(42, "/chainspider:0.1.0/", 812_000);
        let info = parse_version(&payload).unwrap();
        assert_eq!(info.version, PROTOCOL_VERSION);
        assert_eq!(info.nonce, 42);
        assert_eq!(info.sub_version, "/chainspider:0.1.0/");
        assert_eq!(info.start_height, 812_000);
        assert!(info.services.contains(ServiceFlags::NODE_NETWORK));
    }

    #[test]
    fn test_getheaders_payload_roundtrip() {
        let locator = [7u8; 32];
        let stop = [0u8; 32];
        let payload = build_getheaders_payload(&locator, &stop);
        let (hashes, parsed_stop) = parse_getheaders(&payload).unwrap();
        assert_eq!(hashes, vec![locator]);
        assert_eq!(parsed_stop, stop);
    }

    #[test]
    fn test_getdata_blocks_layout() {
        let hashes = [[1u8; 32], [2u8; 32]];
        let payload = build_getdata_blocks(&hashes);
        let entries = parse_inv(&payload).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (InventoryType::Block, [1u8; 32]));
    }
}
