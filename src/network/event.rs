//! Typed peer events
//!
//! Peers push typed values into an mpsc channel drained by the coordinator
//! loop instead of invoking callbacks on the emitting thread.

use crate::chain::{BlockHeader, Transaction};
use crate::codec::hash::Hash256;
use crate::protocol::{InventoryType, NetAddress};

/// Stable identifier for one peer session
pub type PeerId = u64;

/// Events flowing upward from a peer session
#[derive(Debug)]
pub enum PeerEvent {
    /// An `addr` entry naming another node
    AddressDiscovered(NetAddress),
    /// One header out of a `headers` message, already marked dirty
    HeaderReceived(BlockHeader),
    /// A full block: delivering session, header hash, parsed transactions
    BlockReceived {
        peer: PeerId,
        hash: Hash256,
        transactions: Vec<Transaction>,
    },
    /// A block-type inventory announcement
    Inventory(InventoryType, Hash256),
}
