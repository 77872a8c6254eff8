//! chainspider command-line entry point

use chainspider::{Crawler, CrawlerConfig, DiagSink};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "chainspider")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer blockchain crawler", long_about = None)]
struct Cli {
    /// Data directory for headers, blocks, and archives
    #[arg(short, long, default_value = ".chainspider_data")]
    data_dir: PathBuf,

    /// Seed addresses (host:port), repeatable
    #[arg(short, long = "seed")]
    seeds: Vec<SocketAddr>,

    /// Parallel connection-attempt workers
    #[arg(long, default_value_t = 25)]
    workers: usize,

    /// Ceiling on simultaneous peer sessions
    #[arg(long, default_value_t = 50)]
    max_connections: usize,

    /// Seconds between status lines
    #[arg(long, default_value_t = 10)]
    status_interval: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if cli.seeds.is_empty() {
        eprintln!("no seed addresses given; pass at least one --seed host:port");
        std::process::exit(1);
    }

    let config = CrawlerConfig {
        data_dir: cli.data_dir,
        seeds: cli.seeds,
        discovery_workers: cli.workers,
        max_connections: cli.max_connections,
    };

    let crawler = Crawler::open(config, DiagSink::to_log())?;
    crawler.start()?;
    log::info!("crawler started at height {}", crawler.known_height());

    loop {
        thread::sleep(Duration::from_secs(cli.status_interval));
        println!(
            "peers {:3}  queue {:6}  height {:7}/{:7}  blocks {:7}  fragments {:5}  banned {:3}",
            crawler.connection_count(),
            crawler.discovery_queue_depth(),
            crawler.known_height(),
            crawler.best_remote_height(),
            crawler.known_block_count(),
            crawler.fragment_count(),
            crawler.banned_peer_count(),
        );
    }
}
