//! Cryptographic hashing utilities
//!
//! Double SHA-256 is used everywhere a hash appears on the wire: block
//! hashes, frame checksums, and inventory identifiers.

use sha2::{Digest, Sha256};

/// A 32-byte hash in wire byte order (little-endian when rendered by
/// block explorers).
pub type Hash256 = [u8; 32];

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
pub fn double_sha256(data: &[u8]) -> Hash256 {
    sha256(&sha256(data))
}

/// Renders a hash as lowercase hex in wire byte order
pub fn hash_to_hex(hash: &Hash256) -> String {
    hex::encode(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let hash = sha256(b"hello world");
        assert_eq!(
            hex::encode(hash),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_double_sha256() {
        // Checksum of an empty payload, as used in verack frames.
        let hash = double_sha256(&[]);
        assert_eq!(&hash[..4], &[0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_hash_to_hex() {
        let hash = [0u8; 32];
        assert_eq!(hash_to_hex(&hash).len(), 64);
    }
}
