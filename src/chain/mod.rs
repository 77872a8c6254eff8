//! Header chain, block data, persistence, and archival

pub mod archive;
pub mod header;
pub mod request;
pub mod store;
pub mod transaction;

pub use header::{build_headers_payload, parse_headers_payload, BlockHeader};
pub use request::BlockRequest;
pub use store::{ChainHandle, HeaderChainStore, StoreError};
pub use transaction::{parse_block_payload, Transaction, TxIn, TxOut};
