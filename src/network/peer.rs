//! One outbound peer session
//!
//! A `PeerConnection` owns a non-blocking TCP stream, its inbound byte
//! buffer, and the handshake state machine. `update()` is called from the
//! coordinator loop only; nothing here is touched by other threads, so the
//! session needs no internal locking. Parsed protocol events are pushed
//! into the manager's channel rather than handled in place.

use crate::chain::store::ChainHandle;
use crate::chain::{build_headers_payload, parse_block_payload, parse_headers_payload};
use crate::codec::hash::Hash256;
use crate::diag::DiagSink;
use crate::network::event::{PeerEvent, PeerId};
use crate::protocol::message::{
    build_frame, build_getdata_blocks, build_getheaders_payload, build_version_payload,
    extract_frame, parse_addr, parse_getheaders, parse_inv, parse_version, Frame, FrameError,
    VersionInfo,
};
use crate::protocol::InventoryType;
use rand::Rng;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Bound on one outbound connection attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Window for the genesis-block capability probe
const CAPABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Most headers served in response to one `getheaders`
const MAX_SERVED_HEADERS: usize = 2000;

/// Sub-version string advertised in our `version` message
const USER_AGENT: &str = "/chainspider:0.1.0/";

const READ_CHUNK: usize = 64 * 1024;

/// Bound on retrying a write that would block
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer session errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("event channel closed")]
    ChannelClosed,
}

/// Handshake progress for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Handshaking,
    Verified,
    Closed,
}

/// Whether the peer serves full block contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCapability {
    Unknown,
    /// Probe dispatched, timer armed
    Probing,
    Capable,
    Incapable,
}

/// One outbound session: socket, framing buffer, handshake state, metadata
pub struct PeerConnection {
    id: PeerId,
    host: String,
    stream: TcpStream,
    state: PeerState,
    buffer: Vec<u8>,
    remote: Option<VersionInfo>,
    score: i32,
    capability: BlockCapability,
    probe_deadline: Option<Instant>,
    events: Sender<PeerEvent>,
    chain: ChainHandle,
    /// Raised when a `headers` batch is forwarded, lowered by the chain
    /// thread after draining it; the coordinator holds off new header
    /// requests while it is up.
    headers_busy: Arc<AtomicBool>,
    diag: DiagSink,
}

impl PeerConnection {
    /// Dials the address within the connect timeout and sends our
    /// `version` message. The stream is non-blocking from then on.
    pub fn connect(
        id: PeerId,
        addr: SocketAddr,
        events: Sender<PeerEvent>,
        chain: ChainHandle,
        headers_busy: Arc<AtomicBool>,
        diag: DiagSink,
    ) -> Result<Self, PeerError> {
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let mut peer = Self {
            id,
            host: addr.ip().to_string(),
            stream,
            state: PeerState::Handshaking,
            buffer: Vec::new(),
            remote: None,
            score: 0,
            capability: BlockCapability::Unknown,
            probe_deadline: None,
            events,
            chain,
            headers_busy,
            diag,
        };
        peer.send_version()?;
        Ok(peer)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_verified(&self) -> bool {
        self.state == PeerState::Verified
    }

    pub fn score(&self) -> i32 {
        self.score
    }

    pub fn add_score(&mut self, delta: i32) {
        self.score += delta;
    }

    /// Chain height the peer advertised during the handshake
    pub fn start_height(&self) -> i32 {
        self.remote.as_ref().map(|v| v.start_height).unwrap_or(0)
    }

    pub fn sub_version(&self) -> &str {
        self.remote.as_ref().map(|v| v.sub_version.as_str()).unwrap_or("")
    }

    pub fn capability(&self) -> BlockCapability {
        self.capability
    }

    pub fn is_capable(&self) -> bool {
        self.capability == BlockCapability::Capable
    }

    /// Pulls available bytes, extracts and dispatches complete frames, and
    /// expires the capability probe. Returns false once the session is
    /// closed and should be evicted.
    pub fn update(&mut self) -> bool {
        if self.state == PeerState::Closed {
            return false;
        }

        if let Err(e) = self.fill_buffer() {
            log::debug!("peer {} read failed: {}", self.host, e);
            self.state = PeerState::Closed;
            return false;
        }

        while let Some(frame) = extract_frame(&mut self.buffer) {
            if let Err(e) = self.dispatch(frame) {
                log::debug!("peer {} dispatch failed: {}", self.host, e);
                self.state = PeerState::Closed;
                return false;
            }
            if self.state == PeerState::Closed {
                return false;
            }
        }

        if self.capability == BlockCapability::Probing {
            if let Some(deadline) = self.probe_deadline {
                if Instant::now() >= deadline {
                    self.capability = BlockCapability::Incapable;
                    self.probe_deadline = None;
                    log::debug!("peer {} serves no blocks", self.host);
                }
            }
        }
        true
    }

    fn fill_buffer(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(io::Error::from(ErrorKind::UnexpectedEof)),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), PeerError> {
        match frame.command.as_str() {
            "version" => self.on_version(&frame.payload),
            "verack" => self.on_verack(),
            "addr" => self.on_addr(&frame.payload),
            "ping" => self.send_frame("pong", &frame.payload),
            "getheaders" => self.on_getheaders(&frame.payload),
            "headers" => self.on_headers(&frame.payload),
            "inv" => self.on_inv(&frame.payload),
            "block" => self.on_block(&frame.payload),
            "encinit" => {
                self.diag
                    .publish(format!("peer {} wants encryption, closing", self.host));
                self.state = PeerState::Closed;
                Ok(())
            }
            other => {
                log::debug!("peer {} sent unhandled '{}'", self.host, other);
                Ok(())
            }
        }
    }

    fn on_version(&mut self, payload: &[u8]) -> Result<(), PeerError> {
        match parse_version(payload) {
            Ok(info) => {
                log::debug!(
                    "peer {} is {} at height {}",
                    self.host,
                    info.sub_version,
                    info.start_height
                );
                self.remote = Some(info);
                self.send_frame("verack", &[])
            }
            Err(e) => {
                log::debug!("peer {} sent bad version: {}", self.host, e);
                self.state = PeerState::Closed;
                Ok(())
            }
        }
    }

    /// Handshake complete: ask for addresses and probe block capability by
    /// requesting the genesis block.
    fn on_verack(&mut self) -> Result<(), PeerError> {
        if self.state != PeerState::Handshaking {
            return Ok(());
        }
        self.state = PeerState::Verified;
        self.send_frame("getaddr", &[])?;
        let genesis = self.chain.genesis_hash();
        self.request_blocks(&[genesis])
    }

    fn on_addr(&mut self, payload: &[u8]) -> Result<(), PeerError> {
        let addrs = match parse_addr(payload) {
            Ok(addrs) => addrs,
            Err(e) => {
                log::debug!("peer {} sent bad addr: {}", self.host, e);
                return Ok(());
            }
        };
        for addr in addrs {
            self.emit(PeerEvent::AddressDiscovered(addr))?;
        }
        Ok(())
    }

    /// Serves a header range out of our own chain
    fn on_getheaders(&mut self, payload: &[u8]) -> Result<(), PeerError> {
        let (locators, stop) = match parse_getheaders(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("peer {} sent bad getheaders: {}", self.host, e);
                return Ok(());
            }
        };
        let headers = self.chain.find_successors(&locators, &stop, MAX_SERVED_HEADERS);
        self.send_frame("headers", &build_headers_payload(&headers))
    }

    fn on_headers(&mut self, payload: &[u8]) -> Result<(), PeerError> {
        let headers = match parse_headers_payload(payload) {
            Ok(headers) => headers,
            Err(e) => {
                log::debug!("peer {} sent bad headers: {}", self.host, e);
                return Ok(());
            }
        };
        if headers.is_empty() {
            return Ok(());
        }
        self.score += 1;
        // Raised here, lowered by the chain thread once it has drained the
        // event channel. Until then the coordinator sends no new
        // `getheaders`, or every batch would trigger a request storm
        // against a chain height that has not caught up yet.
        self.headers_busy.store(true, Ordering::SeqCst);
        for mut header in headers {
            header.dirty = true;
            self.emit(PeerEvent::HeaderReceived(header))?;
        }
        Ok(())
    }

    fn on_inv(&mut self, payload: &[u8]) -> Result<(), PeerError> {
        let entries = match parse_inv(payload) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("peer {} sent bad inv: {}", self.host, e);
                return Ok(());
            }
        };
        for (kind, hash) in entries {
            if kind == InventoryType::Block {
                self.emit(PeerEvent::Inventory(kind, hash))?;
            }
        }
        Ok(())
    }

    fn on_block(&mut self, payload: &[u8]) -> Result<(), PeerError> {
        let (header, transactions) = match parse_block_payload(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("peer {} sent bad block: {}", self.host, e);
                return Ok(());
            }
        };
        self.capability = BlockCapability::Capable;
        self.probe_deadline = None;
        self.emit(PeerEvent::BlockReceived {
            peer: self.id,
            hash: header.hash(),
            transactions,
        })
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn send_version(&mut self) -> Result<(), PeerError> {
        let nonce: u64 = rand::thread_rng().gen();
        let height = self.chain.height() as i32;
        let payload = build_version_payload(nonce, USER_AGENT, height);
        self.send_frame("version", &payload)
    }

    /// Requests headers after `locator`, up to `stop`
    pub fn request_headers(&mut self, locator: &Hash256, stop: &Hash256) -> Result<(), PeerError> {
        self.send_frame("getheaders", &build_getheaders_payload(locator, stop))
    }

    /// Requests full blocks and arms the capability timer if the peer has
    /// not proven itself yet.
    pub fn request_blocks(&mut self, hashes: &[Hash256]) -> Result<(), PeerError> {
        if self.capability != BlockCapability::Capable {
            self.capability = BlockCapability::Probing;
            self.probe_deadline = Some(Instant::now() + CAPABILITY_PROBE_TIMEOUT);
        }
        self.send_frame("getdata", &build_getdata_blocks(hashes))
    }

    /// Test hook: backdates the capability probe so the next `update`
    /// expires it.
    #[cfg(test)]
    fn expire_probe_now(&mut self) {
        self.probe_deadline = Some(Instant::now() - Duration::from_secs(1));
    }

    fn send_frame(&mut self, command: &str, payload: &[u8]) -> Result<(), PeerError> {
        let bytes = build_frame(command, payload)?;
        self.write_all(&bytes)?;
        Ok(())
    }

    /// Blocking-ish write over the non-blocking socket: short sleeps on
    /// `WouldBlock`, bounded by the stall timeout. Frames are small, so
    /// this rarely loops at all.
    fn write_all(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        let deadline = Instant::now() + WRITE_STALL_TIMEOUT;
        while !bytes.is_empty() {
            match self.stream.write(bytes) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::from(ErrorKind::TimedOut));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn emit(&self, event: PeerEvent) -> Result<(), PeerError> {
        self.events.send(event).map_err(|_| PeerError::ChannelClosed)
    }
}
