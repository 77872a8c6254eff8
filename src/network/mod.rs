//! Peer sessions, discovery, and the connection pool

pub mod event;
pub mod manager;
pub mod peer;

pub use event::{PeerEvent, PeerId};
pub use manager::{NetworkError, NetworkManager};
pub use peer::{BlockCapability, PeerConnection, PeerError, PeerState};
