//! Top-level crawler context
//!
//! Owns the chain store, the network manager, and the chain thread that
//! routes peer events between them. Construction wires everything up
//! explicitly; no component reaches for global state, so independent
//! instances can coexist in one process.

use crate::chain::{HeaderChainStore, StoreError};
use crate::config::CrawlerConfig;
use crate::diag::DiagSink;
use crate::network::event::PeerEvent;
use crate::network::{NetworkError, NetworkManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Chain thread poll interval
const CHAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Crawler lifecycle errors
#[derive(Error, Debug)]
pub enum CrawlerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    /// Double start signals a programming error and is fatal
    #[error("crawler already started")]
    AlreadyStarted,
}

/// One crawler instance: chain store, network manager, chain thread
pub struct Crawler {
    store: Arc<HeaderChainStore>,
    manager: Arc<NetworkManager>,
    seeds: Vec<std::net::SocketAddr>,
    events: Mutex<Option<Receiver<PeerEvent>>>,
    shutdown: Arc<AtomicBool>,
    chain_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Crawler {
    /// Opens the store under the configured data directory and wires the
    /// subsystems together. Nothing runs until `start()`.
    pub fn open(config: CrawlerConfig, diag: DiagSink) -> Result<Self, CrawlerError> {
        let store = Arc::new(HeaderChainStore::open(&config.data_dir, diag.clone())?);
        let (tx, rx) = mpsc::channel();
        let manager = Arc::new(NetworkManager::new(
            store.handle(),
            tx,
            config.discovery_workers,
            config.max_connections,
            diag,
        ));
        Ok(Self {
            store,
            manager,
            seeds: config.seeds,
            events: Mutex::new(Some(rx)),
            shutdown: Arc::new(AtomicBool::new(false)),
            chain_thread: Mutex::new(None),
        })
    }

    /// Seeds discovery, starts the network manager, and spawns the chain
    /// thread. A second call is a programming error.
    pub fn start(&self) -> Result<(), CrawlerError> {
        let events = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or(CrawlerError::AlreadyStarted)?;

        for seed in &self.seeds {
            self.manager.add_seed(*seed);
        }
        self.manager.start()?;

        let store = self.store.clone();
        let manager = self.manager.clone();
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("chain".to_string())
            .spawn(move || chain_loop(store, manager, events, shutdown));
        if let Ok(handle) = handle {
            *self.chain_thread.lock().unwrap() = Some(handle);
        }
        Ok(())
    }

    /// Cooperative shutdown: flags every loop, then joins them
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.manager.shutdown();
        if let Some(handle) = self.chain_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    // Read-only counters for front ends.

    pub fn known_height(&self) -> u32 {
        self.store.known_height()
    }

    pub fn best_remote_height(&self) -> i32 {
        self.manager.best_remote_height()
    }

    pub fn connection_count(&self) -> usize {
        self.manager.connection_count()
    }

    pub fn discovery_queue_depth(&self) -> usize {
        self.manager.queue_depth()
    }

    pub fn known_block_count(&self) -> usize {
        self.store.known_block_count()
    }

    pub fn banned_peer_count(&self) -> usize {
        self.store.banned_count()
    }

    pub fn fragment_count(&self) -> usize {
        self.store.fragment_count()
    }
}

/// Routes peer events into the store and drives its maintenance cycle.
/// The only thread that mutates chain state.
fn chain_loop(
    store: Arc<HeaderChainStore>,
    manager: Arc<NetworkManager>,
    events: Receiver<PeerEvent>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        while let Ok(event) = events.try_recv() {
            match event {
                PeerEvent::AddressDiscovered(addr) => manager.report_address(&addr),
                PeerEvent::HeaderReceived(header) => {
                    store.add_header(header);
                }
                PeerEvent::BlockReceived {
                    peer,
                    hash,
                    transactions,
                } => store.buffer_block(peer, hash, transactions),
                PeerEvent::Inventory(kind, hash) => {
                    log::trace!("inventory {:?} {}", kind, crate::codec::hash_to_hex(&hash));
                }
            }
        }
        // The channel is drained; any headers batch that suspended the
        // coordinator's request pacing has been applied.
        manager.resume_header_sync();

        let commands = store.run_cycle(&manager.fetch_targets());
        if !commands.is_empty() {
            manager.dispatch_block_requests(commands);
        }
        thread::sleep(CHAIN_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BlockHeader;
    use crate::network::event::PeerEvent;

    fn config(dir: &std::path::Path) -> CrawlerConfig {
        CrawlerConfig {
            data_dir: dir.to_path_buf(),
            seeds: Vec::new(),
            discovery_workers: 1,
            max_connections: 4,
        }
    }

    #[test]
    fn test_two_instances_coexist() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let first = Crawler::open(config(a.path()), DiagSink::new(|_| {})).unwrap();
        let second = Crawler::open(config(b.path()), DiagSink::new(|_| {})).unwrap();
        assert_eq!(first.known_height(), 0);
        assert_eq!(second.known_height(), 0);
    }

    #[test]
    fn test_double_start_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let crawler = Crawler::open(config(dir.path()), DiagSink::new(|_| {})).unwrap();
        crawler.start().unwrap();
        assert!(matches!(crawler.start(), Err(CrawlerError::AlreadyStarted)));
        crawler.shutdown();
    }

    #[test]
    fn test_chain_loop_routes_events() {
        let dir = tempfile::tempdir().unwrap();
        let diag = DiagSink::new(|_| {});
        let store = Arc::new(HeaderChainStore::open(dir.path(), diag.clone()).unwrap());
        let (tx, rx) = mpsc::channel();
        let manager = Arc::new(NetworkManager::new(store.handle(), tx.clone(), 1, 4, diag));

        let child = BlockHeader::new(
            1,
            BlockHeader::genesis().hash(),
            [2u8; 32],
            1_300_000_000,
            0x1D00_FFFF,
            1,
        );
        tx.send(PeerEvent::HeaderReceived(child.clone())).unwrap();
        tx.send(PeerEvent::BlockReceived {
            peer: 9,
            hash: child.hash(),
            transactions: vec![],
        })
        .unwrap();
        tx.send(PeerEvent::AddressDiscovered(
            crate::protocol::NetAddress::from_ipv4(
                [10, 0, 0, 9],
                8333,
                crate::protocol::ServiceFlags::NODE_NETWORK,
            ),
        ))
        .unwrap();

        // A pending headers batch holds request pacing until the drain.
        manager.suspend_header_sync();

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let store = store.clone();
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || chain_loop(store, manager, rx, shutdown))
        };
        thread::sleep(Duration::from_millis(200));
        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();

        assert_eq!(store.known_height(), 1);
        assert_eq!(store.pending_block_count() + store.known_block_count(), 1);
        assert_eq!(manager.queue_depth(), 1);
        assert!(!manager.header_sync_suspended());
    }

    #[test]
    fn test_counters_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let crawler = Crawler::open(config(dir.path()), DiagSink::new(|_| {})).unwrap();
        assert_eq!(crawler.connection_count(), 0);
        assert_eq!(crawler.discovery_queue_depth(), 0);
        assert_eq!(crawler.known_block_count(), 0);
        assert_eq!(crawler.banned_peer_count(), 0);
        assert_eq!(crawler.fragment_count(), 0);
        assert_eq!(crawler.best_remote_height(), 0);
    }
}
