//! In-flight block request bookkeeping

use crate::codec::hash::Hash256;
use std::collections::HashSet;
use std::time::Instant;

/// One in-flight batch of block fetches against a single peer.
///
/// Created when a batch is dispatched; hashes are cleared as matching
/// blocks arrive; the record is discarded once empty or abandoned after the
/// idle timeout.
#[derive(Debug)]
pub struct BlockRequest {
    /// Remote host the batch was dispatched to, for ban bookkeeping
    pub host: String,
    pub hashes: HashSet<Hash256>,
    pub requested_count: usize,
    pub last_activity: Instant,
}

impl BlockRequest {
    pub fn new(host: impl Into<String>, hashes: impl IntoIterator<Item = Hash256>) -> Self {
        let hashes: HashSet<Hash256> = hashes.into_iter().collect();
        let requested_count = hashes.len();
        Self {
            host: host.into(),
            hashes,
            requested_count,
            last_activity: Instant::now(),
        }
    }

    /// Marks a hash as satisfied; returns true if it belonged to this
    /// request.
    pub fn satisfy(&mut self, hash: &Hash256) -> bool {
        if self.hashes.remove(hash) {
            self.last_activity = Instant::now();
            true
        } else {
            false
        }
    }

    pub fn is_complete(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Number of hashes actually delivered so far
    pub fn satisfied_count(&self) -> usize {
        self.requested_count - self.hashes.len()
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satisfy_clears_hashes() {
        let mut request = BlockRequest::new("1.2.3.4", [[1u8; 32], [2u8; 32]]);
        assert_eq!(request.requested_count, 2);
        assert!(!request.is_complete());

        assert!(request.satisfy(&[1u8; 32]));
        assert!(!request.satisfy(&[9u8; 32]));
        assert_eq!(request.satisfied_count(), 1);

        assert!(request.satisfy(&[2u8; 32]));
        assert!(request.is_complete());
        assert_eq!(request.satisfied_count(), 2);
    }
}
