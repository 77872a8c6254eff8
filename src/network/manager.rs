//! Connection pool, peer discovery, and header-sync pacing
//!
//! Discovery workers drain a shared queue of candidate addresses and dial
//! them with a bounded timeout; successful sessions join the pool. One
//! coordinator thread polls every pooled session, evicts the dead, tracks
//! the best-known peer, and paces `getheaders` requests against it. The
//! pool and queue locks are held only for short, I/O-free sections.

use crate::chain::store::{ChainHandle, FetchTarget};
use crate::codec::hash::Hash256;
use crate::diag::DiagSink;
use crate::network::event::{PeerEvent, PeerId};
use crate::network::peer::PeerConnection;
use crate::protocol::NetAddress;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default number of parallel connection-attempt workers
pub const DEFAULT_DISCOVERY_WORKERS: usize = 25;

/// Default ceiling on pooled sessions
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;

/// Window in which a `getheaders` request must produce progress
const HEADER_REQUEST_WINDOW: Duration = Duration::from_secs(3);

/// Coordinator poll interval
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Worker sleep when the discovery queue is empty or the pool is full
const DISCOVERY_IDLE_SLEEP: Duration = Duration::from_millis(250);

/// Network manager errors
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Double start signals a programming error and is fatal
    #[error("network manager already started")]
    AlreadyStarted,
}

/// Outstanding `getheaders` request against the best peer
struct PendingHeaders {
    peer: PeerId,
    sent_at: Instant,
    height_at_send: u32,
}

/// Fate of an in-flight `getheaders` request
#[derive(Debug, PartialEq, Eq)]
enum HeaderSyncVerdict {
    /// Window still open, keep waiting
    Wait,
    /// The chain advanced past the request's snapshot
    Progressed,
    /// Window lapsed without progress; the peer pays for it
    TimedOut,
}

/// Judges an in-flight request from the current chain height and time
fn judge_pending(p: &PendingHeaders, height: u32, now: Instant) -> HeaderSyncVerdict {
    if height > p.height_at_send {
        HeaderSyncVerdict::Progressed
    } else if now.saturating_duration_since(p.sent_at) >= HEADER_REQUEST_WINDOW {
        HeaderSyncVerdict::TimedOut
    } else {
        HeaderSyncVerdict::Wait
    }
}

/// Owns the session pool, the discovery queue, and the coordinator
pub struct NetworkManager {
    pool: Arc<Mutex<Vec<PeerConnection>>>,
    queue: Arc<Mutex<VecDeque<SocketAddr>>>,
    bad: Arc<Mutex<HashSet<SocketAddr>>>,
    events: Sender<PeerEvent>,
    chain: ChainHandle,
    headers_busy: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    started: AtomicBool,
    next_peer_id: Arc<AtomicU64>,
    best_remote_height: Arc<AtomicI32>,
    discovery_workers: usize,
    max_connections: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    diag: DiagSink,
}

impl NetworkManager {
    pub fn new(
        chain: ChainHandle,
        events: Sender<PeerEvent>,
        discovery_workers: usize,
        max_connections: usize,
        diag: DiagSink,
    ) -> Self {
        Self {
            pool: Arc::new(Mutex::new(Vec::new())),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            bad: Arc::new(Mutex::new(HashSet::new())),
            events,
            chain,
            headers_busy: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            next_peer_id: Arc::new(AtomicU64::new(1)),
            best_remote_height: Arc::new(AtomicI32::new(0)),
            discovery_workers,
            max_connections,
            threads: Mutex::new(Vec::new()),
            diag,
        }
    }

    /// Spawns the discovery workers and the coordinator loop. A second
    /// call is a programming error.
    pub fn start(&self) -> Result<(), NetworkError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::AlreadyStarted);
        }

        let mut threads = self.threads.lock().unwrap();
        for i in 0..self.discovery_workers {
            let worker = DiscoveryWorker {
                pool: self.pool.clone(),
                queue: self.queue.clone(),
                bad: self.bad.clone(),
                events: self.events.clone(),
                chain: self.chain.clone(),
                headers_busy: self.headers_busy.clone(),
                shutdown: self.shutdown.clone(),
                next_peer_id: self.next_peer_id.clone(),
                max_connections: self.max_connections,
                diag: self.diag.clone(),
            };
            if let Ok(handle) = thread::Builder::new()
                .name(format!("discover-{}", i))
                .spawn(move || worker.run())
            {
                threads.push(handle);
            }
        }

        let coordinator = Coordinator {
            pool: self.pool.clone(),
            chain: self.chain.clone(),
            headers_busy: self.headers_busy.clone(),
            shutdown: self.shutdown.clone(),
            best_remote_height: self.best_remote_height.clone(),
            diag: self.diag.clone(),
        };
        if let Ok(handle) = thread::Builder::new()
            .name("coordinator".to_string())
            .spawn(move || coordinator.run())
        {
            threads.push(handle);
        }

        log::info!(
            "network manager started with {} discovery workers",
            self.discovery_workers
        );
        Ok(())
    }

    /// Enqueues a discovered address unless it is already connected,
    /// queued, or known bad.
    pub fn report_address(&self, addr: &NetAddress) {
        let socket = addr.socket_addr();
        if self.bad.lock().unwrap().contains(&socket) {
            return;
        }
        let host = socket.ip().to_string();
        if self.pool.lock().unwrap().iter().any(|p| p.host() == host) {
            return;
        }
        let mut queue = self.queue.lock().unwrap();
        if !queue.contains(&socket) {
            queue.push_back(socket);
        }
    }

    /// Seeds the discovery queue directly with a socket address
    pub fn add_seed(&self, socket: SocketAddr) {
        let mut queue = self.queue.lock().unwrap();
        if !queue.contains(&socket) {
            queue.push_back(socket);
        }
    }

    /// Snapshot of verified sessions for block-fetch scheduling
    pub fn fetch_targets(&self) -> Vec<FetchTarget> {
        self.pool
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.is_verified())
            .map(|p| FetchTarget {
                peer: p.id(),
                host: p.host().to_string(),
                capable: p.is_capable(),
            })
            .collect()
    }

    /// Sends each block-fetch batch to its assigned session
    pub fn dispatch_block_requests(&self, commands: Vec<(PeerId, Vec<Hash256>)>) {
        let mut pool = self.pool.lock().unwrap();
        for (id, hashes) in commands {
            if let Some(peer) = pool.iter_mut().find(|p| p.id() == id) {
                log::debug!("requesting {} blocks from {}", hashes.len(), peer.host());
                if let Err(e) = peer.request_blocks(&hashes) {
                    log::debug!("block request to {} failed: {}", peer.host(), e);
                }
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn bad_address_count(&self) -> usize {
        self.bad.lock().unwrap().len()
    }

    /// Greatest chain height any verified peer has advertised
    pub fn best_remote_height(&self) -> i32 {
        self.best_remote_height.load(Ordering::SeqCst)
    }

    /// True while a forwarded `headers` batch awaits the chain thread
    pub fn header_sync_suspended(&self) -> bool {
        self.headers_busy.load(Ordering::SeqCst)
    }

    /// Lowers the suspension flag; called by the chain thread after it
    /// drains the event channel.
    pub fn resume_header_sync(&self) {
        self.headers_busy.store(false, Ordering::SeqCst);
    }

    /// Test hook mirroring a peer forwarding a `headers` batch
    #[cfg(test)]
    pub(crate) fn suspend_header_sync(&self) {
        self.headers_busy.store(true, Ordering::SeqCst);
    }

    /// Signals every loop to stop and joins the worker threads
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

struct DiscoveryWorker {
    pool: Arc<Mutex<Vec<PeerConnection>>>,
    queue: Arc<Mutex<VecDeque<SocketAddr>>>,
    bad: Arc<Mutex<HashSet<SocketAddr>>>,
    events: Sender<PeerEvent>,
    chain: ChainHandle,
    headers_busy: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    next_peer_id: Arc<AtomicU64>,
    max_connections: usize,
    diag: DiagSink,
}

impl DiscoveryWorker {
    fn run(self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            if self.pool.lock().unwrap().len() >= self.max_connections {
                thread::sleep(DISCOVERY_IDLE_SLEEP);
                continue;
            }
            let candidate = self.queue.lock().unwrap().pop_front();
            let socket = match candidate {
                Some(socket) => socket,
                None => {
                    thread::sleep(DISCOVERY_IDLE_SLEEP);
                    continue;
                }
            };
            if self.bad.lock().unwrap().contains(&socket) {
                continue;
            }

            let id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);
            match PeerConnection::connect(
                id,
                socket,
                self.events.clone(),
                self.chain.clone(),
                self.headers_busy.clone(),
                self.diag.clone(),
            ) {
                Ok(peer) => {
                    log::debug!("connected to {}", peer.host());
                    self.pool.lock().unwrap().push(peer);
                }
                Err(e) => {
                    log::trace!("connect to {} failed: {}", socket, e);
                    self.bad.lock().unwrap().insert(socket);
                }
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

struct Coordinator {
    pool: Arc<Mutex<Vec<PeerConnection>>>,
    chain: ChainHandle,
    headers_busy: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    best_remote_height: Arc<AtomicI32>,
    diag: DiagSink,
}

impl Coordinator {
    fn run(mut self) {
        let mut pending: Option<PendingHeaders> = None;
        while !self.shutdown.load(Ordering::SeqCst) {
            let best = self.update_pool();

            if let Some(height) = best.as_ref().map(|b| b.1) {
                let previous = self.best_remote_height.load(Ordering::SeqCst);
                if height > previous {
                    self.best_remote_height.store(height, Ordering::SeqCst);
                    self.diag.publish(format!("best remote height {}", height));
                }
            }

            self.pace_header_sync(&mut pending, best);
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Polls every session, evicts the dead, and returns the best peer as
    /// `(id, advertised height)`.
    fn update_pool(&mut self) -> Option<(PeerId, i32)> {
        let mut pool = self.pool.lock().unwrap();
        pool.retain_mut(|peer| {
            let alive = peer.update();
            if !alive {
                log::debug!("evicting {}", peer.host());
            }
            alive
        });

        let candidates: Vec<(PeerId, i32, i32)> = pool
            .iter()
            .filter(|p| p.is_verified())
            .map(|p| (p.id(), p.start_height(), p.score()))
            .collect();
        select_best(&candidates).map(|i| (candidates[i].0, candidates[i].1))
    }

    /// At most one `getheaders` in flight; a request that produces no
    /// height progress within the window fails and costs the peer a point.
    fn pace_header_sync(
        &self,
        pending: &mut Option<PendingHeaders>,
        best: Option<(PeerId, i32)>,
    ) {
        if self.headers_busy.load(Ordering::SeqCst) {
            return;
        }

        if let Some(p) = pending.as_ref() {
            let target = p.peer;
            match judge_pending(p, self.chain.height(), Instant::now()) {
                HeaderSyncVerdict::Wait => return,
                HeaderSyncVerdict::Progressed => *pending = None,
                HeaderSyncVerdict::TimedOut => {
                    let mut pool = self.pool.lock().unwrap();
                    if let Some(peer) = pool.iter_mut().find(|c| c.id() == target) {
                        peer.add_score(-1);
                        log::debug!("header request to {} timed out", peer.host());
                    }
                    *pending = None;
                }
            }
        }

        let (best_id, best_height) = match best {
            Some(best) => best,
            None => return,
        };
        let our_height = self.chain.height();
        if (our_height as i64) >= best_height as i64 {
            return;
        }

        let locator = self.chain.tip_hash();
        let stop = [0u8; 32];
        let mut pool = self.pool.lock().unwrap();
        if let Some(peer) = pool.iter_mut().find(|c| c.id() == best_id) {
            match peer.request_headers(&locator, &stop) {
                Ok(()) => {
                    *pending = Some(PendingHeaders {
                        peer: best_id,
                        sent_at: Instant::now(),
                        height_at_send: our_height,
                    });
                }
                Err(e) => log::debug!("getheaders to {} failed: {}", peer.host(), e),
            }
        }
    }
}

/// Picks the best peer index: greatest advertised height, score breaking
/// ties. Entries are `(id, height, score)`.
fn select_best(candidates: &[(PeerId, i32, i32)]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .max_by_key(|(_, (_, height, score))| (*height, *score))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::HeaderChainStore;
    use std::sync::mpsc;

    fn manager(dir: &std::path::Path) -> NetworkManager {
        let store = HeaderChainStore::open(dir, DiagSink::new(|_| {})).unwrap();
        let (tx, _rx) = mpsc::channel();
        NetworkManager::new(store.handle(), tx, 2, 8, DiagSink::new(|_| {}))
    }

    #[test]
    fn test_best_peer_prefers_height_then_score() {
        // Two peers at height 500, scores 2 and 0: the scored one wins.
        let tied = [(1, 500, 2), (2, 500, 0)];
        assert_eq!(select_best(&tied), Some(0));

        let taller = [(1, 500, 9), (2, 501, 0)];
        assert_eq!(select_best(&taller), Some(1));

        assert_eq!(select_best(&[]), None);
    }

    #[test]
    fn test_pending_header_request_verdicts() {
        let now = Instant::now();
        let p = PendingHeaders {
            peer: 7,
            sent_at: now,
            height_at_send: 40,
        };
        assert_eq!(judge_pending(&p, 40, now), HeaderSyncVerdict::Wait);
        assert_eq!(judge_pending(&p, 41, now), HeaderSyncVerdict::Progressed);

        let lapsed = now + HEADER_REQUEST_WINDOW;
        assert_eq!(judge_pending(&p, 40, lapsed), HeaderSyncVerdict::TimedOut);
        // Progress beats age when both hold.
        assert_eq!(judge_pending(&p, 41, lapsed), HeaderSyncVerdict::Progressed);
    }

    #[test]
    fn test_double_start_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.start().unwrap();
        assert!(matches!(mgr.start(), Err(NetworkError::AlreadyStarted)));
        mgr.shutdown();
    }

    #[test]
    fn test_report_address_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        let addr = NetAddress::from_ipv4(
            [10, 1, 1, 1],
            8333,
            crate::protocol::ServiceFlags::NODE_NETWORK,
        );
        mgr.report_address(&addr);
        mgr.report_address(&addr);
        assert_eq!(mgr.queue_depth(), 1);

        // Known-bad addresses never re-enter the queue.
        mgr.bad.lock().unwrap().insert(addr.socket_addr());
        mgr.queue.lock().unwrap().clear();
        mgr.report_address(&addr);
        assert_eq!(mgr.queue_depth(), 0);
    }

    #[test]
    fn test_discovery_marks_unreachable_bad() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        // Reserved TEST-NET-1 address, guaranteed unreachable.
        mgr.add_seed("192.0.2.1:8333".parse().unwrap());
        mgr.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while mgr.bad_address_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        mgr.shutdown();

        assert_eq!(mgr.bad_address_count(), 1);
        assert_eq!(mgr.connection_count(), 0);
        assert_eq!(mgr.queue_depth(), 0);
    }
}
