//! Shared wire types: network addresses, service flags, inventory kinds

use crate::codec::{ByteReader, ByteWriter, CodecError};
use bitflags::bitflags;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

bitflags! {
    /// Service bits advertised in `version` and `addr` entries
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServiceFlags: u64 {
        /// Full node able to serve the complete chain
        const NODE_NETWORK = 1;
        /// Segregated-witness capable (recognized, never interpreted)
        const NODE_WITNESS = 1 << 3;
    }
}

/// Inventory entry types carried in `inv` and `getdata`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryType {
    Transaction,
    Block,
    Other(u32),
}

impl InventoryType {
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => InventoryType::Transaction,
            2 => InventoryType::Block,
            other => InventoryType::Other(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            InventoryType::Transaction => 1,
            InventoryType::Block => 2,
            InventoryType::Other(other) => other,
        }
    }
}

/// A peer network address in the 16-byte IPv6-mapped wire form.
///
/// IPv4 peers use the mapped layout: ten zero bytes, 0xFFFF, then the four
/// IPv4 octets. The port travels big-endian, unlike every other integer on
/// the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddress {
    pub timestamp: u32,
    pub services: ServiceFlags,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    /// The zero address used in our own `version` message
    pub fn unspecified(services: ServiceFlags) -> Self {
        let mut ip = [0u8; 16];
        ip[10] = 0xFF;
        ip[11] = 0xFF;
        Self {
            timestamp: 0,
            services,
            ip,
            port: 0,
        }
    }

    pub fn from_ipv4(octets: [u8; 4], port: u16, services: ServiceFlags) -> Self {
        let mut ip = [0u8; 16];
        ip[10] = 0xFF;
        ip[11] = 0xFF;
        ip[12..].copy_from_slice(&octets);
        Self {
            timestamp: 0,
            services,
            ip,
            port,
        }
    }

    /// True when the address is in the IPv4-mapped range
    pub fn is_ipv4(&self) -> bool {
        self.ip[..10].iter().all(|b| *b == 0) && self.ip[10] == 0xFF && self.ip[11] == 0xFF
    }

    /// Reads an address, with the leading timestamp only present inside
    /// `addr` payloads.
    pub fn read(reader: &mut ByteReader<'_>, with_timestamp: bool) -> Result<Self, CodecError> {
        let timestamp = if with_timestamp {
            reader.read_u32_le()?
        } else {
            0
        };
        let services = ServiceFlags::from_bits_retain(reader.read_u64_le()?);
        let ip = reader.read_fixed::<16>()?;
        let port = reader.read_u16_be()?;
        Ok(Self {
            timestamp,
            services,
            ip,
            port,
        })
    }

    pub fn write(&self, writer: &mut ByteWriter, with_timestamp: bool) {
        if with_timestamp {
            writer.write_u32_le(self.timestamp);
        }
        writer.write_u64_le(self.services.bits());
        writer.write_bytes(&self.ip);
        writer.write_u16_be(self.port);
    }

    /// `host:port` form used as the discovery-queue key
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self, self.port)
    }

    /// Socket form for dialing
    pub fn socket_addr(&self) -> SocketAddr {
        if self.is_ipv4() {
            let ip = Ipv4Addr::new(self.ip[12], self.ip[13], self.ip[14], self.ip[15]);
            SocketAddr::from((ip, self.port))
        } else {
            SocketAddr::from((Ipv6Addr::from(self.ip), self.port))
        }
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv4() {
            write!(
                f,
                "{}.{}.{}.{}",
                self.ip[12], self.ip[13], self.ip[14], self.ip[15]
            )
        } else {
            let mut groups = [0u16; 8];
            for (i, group) in groups.iter_mut().enumerate() {
                *group = u16::from_be_bytes([self.ip[i * 2], self.ip[i * 2 + 1]]);
            }
            write!(
                f,
                "{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}",
                groups[0], groups[1], groups[2], groups[3], groups[4], groups[5], groups[6],
                groups[7]
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_mapped_layout() {
        let addr = NetAddress::from_ipv4([8, 8, 4, 4], 8333, ServiceFlags::NODE_NETWORK);
        assert!(addr.is_ipv4());
        assert_eq!(addr.to_string(), "8.8.4.4");
        assert_eq!(addr.endpoint(), "8.8.4.4:8333");
        assert_eq!(&addr.ip[..10], &[0u8; 10]);
        assert_eq!(&addr.ip[10..12], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_addr_roundtrip_with_timestamp() {
        let mut addr = NetAddress::from_ipv4([1, 2, 3, 4], 18333, ServiceFlags::NODE_NETWORK);
        addr.timestamp = 1_500_000_000;

        let mut writer = ByteWriter::new();
        addr.write(&mut writer, true);
        let bytes = writer.into_inner();
        // timestamp:4 + services:8 + ip:16 + port:2
        assert_eq!(bytes.len(), 30);

        let mut reader = ByteReader::new(&bytes);
        let decoded = NetAddress::read(&mut reader, true).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_port_is_big_endian() {
        let addr = NetAddress::from_ipv4([1, 1, 1, 1], 0x208D, ServiceFlags::NODE_NETWORK);
        let mut writer = ByteWriter::new();
        addr.write(&mut writer, false);
        let bytes = writer.into_inner();
        assert_eq!(&bytes[bytes.len() - 2..], &[0x20, 0x8D]);
    }

    #[test]
    fn test_inventory_type_mapping() {
        assert_eq!(InventoryType::from_wire(2), InventoryType::Block);
        assert_eq!(InventoryType::Block.to_wire(), 2);
        assert_eq!(InventoryType::from_wire(7), InventoryType::Other(7));
    }
}
