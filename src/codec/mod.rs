//! Binary codec primitives shared by the wire protocol and disk formats

pub mod byteio;
pub mod hash;

pub use byteio::{ByteReader, ByteWriter, CodecError};
pub use hash::{double_sha256, hash_to_hex, sha256, Hash256};
