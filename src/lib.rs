//! chainspider: a peer-to-peer blockchain crawler
//!
//! Discovers network peers, negotiates sessions over the binary wire
//! protocol, assembles the header chain from a fixed genesis, fetches full
//! blocks from capable peers, and compacts old blocks into per-bucket
//! compressed archives.
//!
//! The crate splits into four layers:
//! - [`codec`]: byte-level primitives and double-SHA-256 hashing
//! - [`protocol`]: wire framing and message payloads
//! - [`chain`]: the header chain store, block persistence, and archival
//! - [`network`]: peer sessions, discovery, and the connection pool
//!
//! [`crawler::Crawler`] wires the layers into one runnable instance.

pub mod chain;
pub mod codec;
pub mod config;
pub mod crawler;
pub mod diag;
pub mod network;
pub mod protocol;

pub use config::CrawlerConfig;
pub use crawler::{Crawler, CrawlerError};
pub use diag::DiagSink;
