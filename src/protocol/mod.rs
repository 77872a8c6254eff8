//! Bitcoin wire protocol: frame codec, payloads, and shared types

pub mod message;
pub mod types;

pub use message::{build_frame, extract_frame, Frame, FrameError, MAGIC, PROTOCOL_VERSION};
pub use types::{InventoryType, NetAddress, ServiceFlags};
