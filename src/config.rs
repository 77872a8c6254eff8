//! Crawler configuration

use crate::network::manager::{DEFAULT_DISCOVERY_WORKERS, DEFAULT_MAX_CONNECTIONS};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Settings for one crawler instance
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Root directory for the header log and block files
    pub data_dir: PathBuf,
    /// Addresses used to bootstrap discovery
    pub seeds: Vec<SocketAddr>,
    /// Parallel connection-attempt workers
    pub discovery_workers: usize,
    /// Ceiling on simultaneous peer sessions
    pub max_connections: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".chainspider_data"),
            seeds: Vec::new(),
            discovery_workers: DEFAULT_DISCOVERY_WORKERS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}
