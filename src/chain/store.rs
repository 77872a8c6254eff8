//! Canonical header chain, block persistence, and fetch scheduling
//!
//! Headers live in an arena addressed by stable indices; the canonical
//! chain and the fragment set are views over the same arena. A header is
//! either reachable from genesis (canonical) or an orphan fragment, never
//! both. The store also owns the on-disk header log, the known-blocks set,
//! in-flight block requests with peer banning, and the archive worker.

use crate::chain::archive::{block_file_path, ArchiveError, BlockArchiver};
use crate::chain::header::{BlockHeader, HEADER_WIRE_LEN};
use crate::chain::request::BlockRequest;
use crate::chain::transaction::{serialize_transactions, Transaction};
use crate::codec::hash::Hash256;
use crate::codec::{hash_to_hex, ByteReader, ByteWriter, CodecError};
use crate::diag::DiagSink;
use crate::network::event::PeerId;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Minimum live connections before block fetching starts
const MIN_FETCH_CONNECTIONS: usize = 5;

/// Pause between missing-block scans
const FETCH_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Blocks requested from one peer in a single batch
const FETCH_BATCH_SIZE: usize = 500;

/// Idle window after which an in-flight request is abandoned
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Ban-list reset threshold: fraction of current connections banned
const BAN_CLEAR_FRACTION: f64 = 0.9;

/// Pause between archive passes
const ARCHIVE_INTERVAL: Duration = Duration::from_secs(300);

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
}

/// Result of inserting one header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Attached to the canonical chain; carries the new known height
    Extended(u32),
    /// Parent unknown or non-canonical; parked in the fragment set
    Orphaned,
    /// Hash already present, nothing changed
    Duplicate,
    /// A different child already claims this header's parent
    ForkIgnored,
}

struct Slot {
    header: BlockHeader,
    parent: Option<usize>,
    /// First-linked forward pointer; later conflicting children are ignored
    child: Option<usize>,
    canonical: bool,
    height: u32,
}

/// Header arena plus the canonical/fragment bookkeeping
pub struct ChainState {
    slots: Vec<Slot>,
    by_hash: HashMap<Hash256, usize>,
    /// Parentless fragments keyed by the hash they are waiting for
    waiting_by_prev: HashMap<Hash256, Vec<usize>>,
    tip: usize,
    height: u32,
    diag: DiagSink,
}

impl ChainState {
    fn new(diag: DiagSink) -> Self {
        let genesis = BlockHeader::genesis();
        let genesis_hash = genesis.hash();
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis_hash, 0);
        Self {
            slots: vec![Slot {
                header: genesis,
                parent: None,
                child: None,
                canonical: true,
                height: 0,
            }],
            by_hash,
            waiting_by_prev: HashMap::new(),
            tip: 0,
            height: 0,
            diag,
        }
    }

    /// Inserts one header, linking fragments and extending the canonical
    /// chain where possible.
    pub fn add_header(&mut self, header: BlockHeader) -> AddOutcome {
        let hash = header.hash();
        if self.by_hash.contains_key(&hash) {
            return AddOutcome::Duplicate;
        }

        let prev_hash = header.prev_hash;
        let idx = self.slots.len();
        self.slots.push(Slot {
            header,
            parent: None,
            child: None,
            canonical: false,
            height: 0,
        });
        self.by_hash.insert(hash, idx);

        // Link backward to a known parent, first-linked child winning.
        let mut forked = false;
        if let Some(&parent) = self.by_hash.get(&prev_hash) {
            match self.slots[parent].child {
                None => {
                    self.slots[parent].child = Some(idx);
                    self.slots[idx].parent = Some(parent);
                }
                Some(_) => {
                    self.diag.publish(format!(
                        "conflicting fork at {}: second child ignored",
                        hash_to_hex(&prev_hash)
                    ));
                    forked = true;
                }
            }
        }

        // Adopt any fragment that was waiting for this header.
        if let Some(waiting) = self.waiting_by_prev.remove(&hash) {
            let mut rest = Vec::new();
            for child in waiting {
                if self.slots[idx].child.is_none() {
                    self.slots[idx].child = Some(child);
                    self.slots[child].parent = Some(idx);
                } else {
                    self.diag.publish(format!(
                        "conflicting fork at {}: extra waiting child ignored",
                        hash_to_hex(&hash)
                    ));
                    rest.push(child);
                }
            }
            if !rest.is_empty() {
                self.waiting_by_prev.insert(hash, rest);
            }
        }

        if forked {
            self.waiting_by_prev.entry(prev_hash).or_default().push(idx);
            return AddOutcome::ForkIgnored;
        }

        // Extend the canonical chain when the parent is the current tip,
        // then walk forward in case fragment merges extended it further.
        if self.slots[idx].parent == Some(self.tip) {
            let mut cursor = idx;
            let mut height = self.slots[self.tip].height;
            loop {
                height += 1;
                self.slots[cursor].canonical = true;
                self.slots[cursor].height = height;
                self.tip = cursor;
                self.height = height;
                match self.slots[cursor].child {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
            return AddOutcome::Extended(self.height);
        }

        if self.slots[idx].parent.is_none() {
            self.waiting_by_prev.entry(prev_hash).or_default().push(idx);
        }
        AddOutcome::Orphaned
    }

    /// Height of the canonical tip
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.slots[self.tip].header.hash()
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.slots[0].header.hash()
    }

    /// True when the hash names a canonical header
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash
            .get(hash)
            .map(|&idx| self.slots[idx].canonical)
            .unwrap_or(false)
    }

    /// Headers not reachable from genesis
    pub fn fragment_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.canonical).count()
    }

    /// Serves a `getheaders` request: finds the first locally-known
    /// locator and returns up to `max` successors, halting at `stop`.
    pub fn find_successors(
        &self,
        locators: &[Hash256],
        stop: &Hash256,
        max: usize,
    ) -> Vec<BlockHeader> {
        let mut cursor = None;
        for locator in locators {
            if let Some(&idx) = self.by_hash.get(locator) {
                if self.slots[idx].canonical {
                    cursor = Some(idx);
                    break;
                }
            }
        }

        let mut headers = Vec::new();
        let mut idx = match cursor {
            Some(idx) => idx,
            None => return headers,
        };
        while headers.len() < max {
            match self.slots[idx].child {
                Some(next) => {
                    if self.slots[next].header.hash() == *stop {
                        break;
                    }
                    headers.push(self.slots[next].header.clone());
                    idx = next;
                }
                None => break,
            }
        }
        headers
    }

    /// Canonical hashes from genesis to tip, in chain order
    fn canonical_hashes(&self) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(self.height as usize + 1);
        let mut idx = 0;
        loop {
            hashes.push(self.slots[idx].header.hash());
            match self.slots[idx].child {
                Some(next) => idx = next,
                None => break,
            }
        }
        hashes
    }
}

/// Cloneable read-only view of the chain, handed to peers and UIs
#[derive(Clone)]
pub struct ChainHandle {
    state: Arc<Mutex<ChainState>>,
}

impl ChainHandle {
    pub fn height(&self) -> u32 {
        self.state.lock().unwrap().height()
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.state.lock().unwrap().tip_hash()
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.state.lock().unwrap().genesis_hash()
    }

    pub fn find_successors(
        &self,
        locators: &[Hash256],
        stop: &Hash256,
        max: usize,
    ) -> Vec<BlockHeader> {
        self.state
            .lock()
            .unwrap()
            .find_successors(locators, stop, max)
    }
}

/// A block buffered between arrival and the next processing pass
pub struct PendingBlock {
    pub peer: PeerId,
    pub transactions: Vec<Transaction>,
}

/// A peer eligible for block-fetch scheduling
#[derive(Debug, Clone)]
pub struct FetchTarget {
    pub peer: PeerId,
    pub host: String,
    pub capable: bool,
}

/// The header-chain store: canonical chain, fragments, disk, scheduling
pub struct HeaderChainStore {
    state: Arc<Mutex<ChainState>>,
    log_path: PathBuf,
    blocks_dir: PathBuf,
    known_blocks: Mutex<HashSet<Hash256>>,
    pending: Mutex<HashMap<Hash256, PendingBlock>>,
    requests: Mutex<HashMap<PeerId, BlockRequest>>,
    banned: Mutex<HashSet<String>>,
    archiver: Arc<BlockArchiver>,
    archive_running: Arc<AtomicBool>,
    last_fetch_check: Mutex<Option<Instant>>,
    last_archive: Mutex<Instant>,
    diag: DiagSink,
}

impl HeaderChainStore {
    /// Opens the store under `data_dir`, replaying the header log and the
    /// on-disk block set.
    pub fn open(data_dir: &Path, diag: DiagSink) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let blocks_dir = data_dir.join("blocks");
        fs::create_dir_all(&blocks_dir)?;
        let log_path = data_dir.join("headers.dat");

        let store = Self {
            state: Arc::new(Mutex::new(ChainState::new(diag.clone()))),
            log_path,
            blocks_dir: blocks_dir.clone(),
            known_blocks: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            banned: Mutex::new(HashSet::new()),
            archiver: Arc::new(BlockArchiver::new(&blocks_dir)),
            archive_running: Arc::new(AtomicBool::new(false)),
            last_fetch_check: Mutex::new(None),
            last_archive: Mutex::new(Instant::now()),
            diag,
        };
        store.load_headers()?;
        store.load_known_blocks()?;
        Ok(store)
    }

    /// Cloneable read view for peers and front ends
    pub fn handle(&self) -> ChainHandle {
        ChainHandle {
            state: self.state.clone(),
        }
    }

    /// Inserts a header received from the network
    pub fn add_header(&self, header: BlockHeader) -> AddOutcome {
        self.state.lock().unwrap().add_header(header)
    }

    /// Buffers an arriving block until the next processing pass.
    /// A duplicate arrival for the same hash is logged and dropped.
    pub fn buffer_block(&self, peer: PeerId, hash: Hash256, transactions: Vec<Transaction>) {
        let mut pending = self.pending.lock().unwrap();
        if pending.contains_key(&hash) {
            self.diag
                .publish(format!("duplicate block arrival: {}", hash_to_hex(&hash)));
            return;
        }
        pending.insert(hash, PendingBlock { peer, transactions });
    }

    /// One maintenance cycle: flush dirty headers, drain pending blocks or
    /// expire requests, and compute block-fetch commands for the given
    /// targets. Returns batches to dispatch per peer.
    pub fn run_cycle(&self, targets: &[FetchTarget]) -> Vec<(PeerId, Vec<Hash256>)> {
        if let Err(e) = self.sync_headers_to_disk() {
            log::error!("header log sync failed: {}", e);
        }
        self.process_pending();
        let commands = self.schedule_fetches(targets);
        self.maybe_archive();
        commands
    }

    // ------------------------------------------------------------------
    // Header log
    // ------------------------------------------------------------------

    fn load_headers(&self) -> Result<(), StoreError> {
        if !self.log_path.exists() {
            return Ok(());
        }
        let mut raw = Vec::new();
        File::open(&self.log_path)?.read_to_end(&mut raw)?;

        let mut loaded = 0usize;
        let mut reader = ByteReader::new(&raw);
        while reader.remaining() >= HEADER_WIRE_LEN {
            let header = BlockHeader::read_fixed(&mut reader)?;
            self.add_header(header);
            loaded += 1;
        }
        if loaded > 0 {
            self.diag.publish(format!(
                "loaded {} headers, height {}",
                loaded,
                self.known_height()
            ));
        }
        Ok(())
    }

    /// Rewrites the header log from the first dirty record to the tip.
    ///
    /// Records are the fixed 80-byte header form at offset
    /// `80 * (height - 1)`, so the seek is exact.
    fn sync_headers_to_disk(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();

        // First dirty canonical header after genesis.
        let mut first_dirty = None;
        let mut idx = state.slots[0].child;
        while let Some(i) = idx {
            if state.slots[i].header.dirty {
                first_dirty = Some(i);
                break;
            }
            idx = state.slots[i].child;
        }
        let start = match first_dirty {
            Some(start) => start,
            None => return Ok(()),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.log_path)?;
        let offset = (state.slots[start].height as u64 - 1) * HEADER_WIRE_LEN as u64;
        file.seek(SeekFrom::Start(offset))?;

        let mut written = 0usize;
        let mut idx = Some(start);
        while let Some(i) = idx {
            let mut writer = ByteWriter::with_capacity(HEADER_WIRE_LEN);
            state.slots[i].header.write_fixed(&mut writer);
            file.write_all(&writer.into_inner())?;
            state.slots[i].header.dirty = false;
            written += 1;
            idx = state.slots[i].child;
        }
        file.flush()?;
        log::debug!("flushed {} headers to log", written);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    fn load_known_blocks(&self) -> Result<(), StoreError> {
        let mut known = self.known_blocks.lock().unwrap();
        for entry in fs::read_dir(&self.blocks_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(hash_hex) = name.strip_suffix(".block") {
                if let Ok(bytes) = hex::decode(hash_hex) {
                    if bytes.len() == 32 {
                        let mut hash = [0u8; 32];
                        hash.copy_from_slice(&bytes);
                        known.insert(hash);
                    }
                }
            }
        }
        known.extend(self.archiver.load_known_hashes()?);
        if !known.is_empty() {
            self.diag
                .publish(format!("{} blocks known on disk", known.len()));
        }
        Ok(())
    }

    /// Drains buffered blocks, or, when there are none, expires idle
    /// requests and bans peers that delivered nothing.
    fn process_pending(&self) {
        let drained: Vec<(Hash256, PendingBlock)> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };

        if !drained.is_empty() {
            for (hash, block) in drained {
                {
                    let mut requests = self.requests.lock().unwrap();
                    if let Some(request) = requests.get_mut(&block.peer) {
                        request.satisfy(&hash);
                        if request.is_complete() {
                            requests.remove(&block.peer);
                        }
                    }
                }
                if let Err(e) = self.persist_block(&hash, &block.transactions) {
                    log::error!("failed to persist block {}: {}", hash_to_hex(&hash), e);
                }
            }
            return;
        }

        let mut expired = Vec::new();
        {
            let mut requests = self.requests.lock().unwrap();
            requests.retain(|peer, request| {
                if request.idle_for() > REQUEST_TIMEOUT {
                    expired.push((*peer, request.host.clone(), request.satisfied_count()));
                    false
                } else {
                    true
                }
            });
        }
        for (peer, host, satisfied) in expired {
            if satisfied == 0 {
                self.banned.lock().unwrap().insert(host.clone());
                self.diag
                    .publish(format!("peer banned for dead request: {}", host));
            } else {
                log::debug!("request to peer {} timed out after {} blocks", peer, satisfied);
            }
        }
    }

    fn persist_block(&self, hash: &Hash256, transactions: &[Transaction]) -> Result<(), StoreError> {
        let path = block_file_path(&self.blocks_dir, hash);
        fs::write(path, serialize_transactions(transactions))?;
        self.known_blocks.lock().unwrap().insert(*hash);
        Ok(())
    }

    /// Computes block-fetch batches for capable, unbanned, idle peers.
    fn schedule_fetches(&self, targets: &[FetchTarget]) -> Vec<(PeerId, Vec<Hash256>)> {
        if targets.len() <= MIN_FETCH_CONNECTIONS {
            return Vec::new();
        }
        {
            let mut last = self.last_fetch_check.lock().unwrap();
            if let Some(at) = *last {
                if at.elapsed() < FETCH_CHECK_INTERVAL {
                    return Vec::new();
                }
            }
            *last = Some(Instant::now());
        }

        let height = self.known_height() as usize;
        let known_count = self.known_blocks.lock().unwrap().len();
        if known_count > height {
            return Vec::new();
        }

        // A nearly fully banned pool means we judged too harshly; start over.
        {
            let mut banned = self.banned.lock().unwrap();
            let banned_connected = targets.iter().filter(|t| banned.contains(&t.host)).count();
            if !targets.is_empty()
                && banned_connected as f64 / targets.len() as f64 > BAN_CLEAR_FRACTION
            {
                self.diag
                    .publish(format!("clearing ban list ({} entries)", banned.len()));
                banned.clear();
            }
        }

        let missing = self.missing_block_hashes();
        if missing.is_empty() {
            return Vec::new();
        }

        let banned = self.banned.lock().unwrap();
        let mut requests = self.requests.lock().unwrap();
        let mut commands = Vec::new();
        let mut cursor = 0usize;
        for target in targets {
            if cursor >= missing.len() {
                break;
            }
            if !target.capable
                || banned.contains(&target.host)
                || requests.contains_key(&target.peer)
            {
                continue;
            }
            let end = (cursor + FETCH_BATCH_SIZE).min(missing.len());
            let batch: Vec<Hash256> = missing[cursor..end].to_vec();
            cursor = end;
            requests.insert(
                target.peer,
                BlockRequest::new(target.host.clone(), batch.iter().copied()),
            );
            commands.push((target.peer, batch));
        }
        commands
    }

    /// Canonical hashes with no block on disk, in flight, or pending
    fn missing_block_hashes(&self) -> Vec<Hash256> {
        let canonical = self.state.lock().unwrap().canonical_hashes();
        let known = self.known_blocks.lock().unwrap();
        let pending = self.pending.lock().unwrap();
        let requests = self.requests.lock().unwrap();
        let in_flight: HashSet<Hash256> = requests
            .values()
            .flat_map(|r| r.hashes.iter().copied())
            .collect();
        canonical
            .into_iter()
            .filter(|h| !known.contains(h) && !pending.contains_key(h) && !in_flight.contains(h))
            .collect()
    }

    // ------------------------------------------------------------------
    // Archival
    // ------------------------------------------------------------------

    /// Kicks off an archive pass on its own worker, at most one at a time.
    /// The load-then-store guard leaves a narrow window where two cycles
    /// could both start a worker; accepted, the pass is idempotent.
    fn maybe_archive(&self) {
        {
            let mut last = self.last_archive.lock().unwrap();
            if last.elapsed() < ARCHIVE_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        if self.archive_running.load(Ordering::SeqCst) {
            return;
        }
        self.archive_running.store(true, Ordering::SeqCst);

        let archiver = self.archiver.clone();
        let running = self.archive_running.clone();
        let diag = self.diag.clone();
        std::thread::Builder::new()
            .name("archive".to_string())
            .spawn(move || {
                match archiver.run_pass() {
                    Ok(stats) if stats.blocks_archived > 0 => diag.publish(format!(
                        "archived {} blocks into {} buckets",
                        stats.blocks_archived, stats.buckets_touched
                    )),
                    Ok(_) => {}
                    Err(e) => log::error!("archive pass failed: {}", e),
                }
                running.store(false, Ordering::SeqCst);
            })
            .ok();
    }

    // ------------------------------------------------------------------
    // Read-only counters
    // ------------------------------------------------------------------

    pub fn known_height(&self) -> u32 {
        self.state.lock().unwrap().height()
    }

    pub fn fragment_count(&self) -> usize {
        self.state.lock().unwrap().fragment_count()
    }

    pub fn known_block_count(&self) -> usize {
        self.known_blocks.lock().unwrap().len()
    }

    pub fn pending_block_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn banned_count(&self) -> usize {
        self.banned.lock().unwrap().len()
    }

    pub fn open_request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    #[cfg(test)]
    fn expire_request_now(&self, peer: PeerId) {
        let mut requests = self.requests.lock().unwrap();
        if let Some(request) = requests.get_mut(&peer) {
            request.last_activity = Instant::now() - REQUEST_TIMEOUT - Duration::from_secs(1);
        }
    }

    #[cfg(test)]
    fn force_fetch_check(&self) {
        *self.last_fetch_check.lock().unwrap() = None;
    }
}
