//! Peermesh node
//!
//! Runs a standalone gossip-mesh node: listens for inbound peers, dials
//! bootstrap addresses, and keeps the mesh alive until interrupted.

use clap::Parser;
use peermesh::{FilePeerStore, PeerAddress, PeerManager, Settings, StaticDomain};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "peermesh")]
#[command(version)]
#[command(about = "Gossip-mesh networking node", long_about = None)]
struct Cli {
    /// Address to listen on for inbound peers
    #[arg(short, long, default_value = "0.0.0.0:9784")]
    listen: String,

    /// Bootstrap peer to dial at startup (host:port, repeatable)
    #[arg(short, long = "peer")]
    peers: Vec<String>,

    /// Data directory for the known-peer store
    #[arg(long, default_value = ".peermesh_data")]
    data_dir: PathBuf,

    /// Keep dialing while fewer peers than this are connected
    #[arg(long, default_value_t = 3)]
    min_peers: usize,

    /// Refuse inbound connections past this many live peers
    #[arg(long, default_value_t = 8)]
    max_peers: usize,

    /// Proof-of-work difficulty in leading zero bytes
    #[arg(long, default_value_t = 2)]
    difficulty: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let cli = Cli::parse();

    let listen = PeerAddress::parse(&cli.listen)?;
    let bind_address: IpAddr = listen.host().parse()?;

    let settings = Settings {
        bind_address,
        listen_port: listen.port(),
        min_peers: cli.min_peers,
        max_peers: cli.max_peers,
        pow_difficulty: cli.difficulty,
        ..Settings::default()
    };

    let store = Arc::new(FilePeerStore::open(&cli.data_dir)?);
    let domain = Arc::new(StaticDomain::genesis());
    let manager = PeerManager::new(settings, domain, store);

    let local = manager.start().await?;
    log::info!("node up on {}", local);

    for peer in &cli.peers {
        let address = PeerAddress::parse(peer)?;
        if let Err(e) = manager.connect(&address).await {
            log::warn!("bootstrap dial {} failed: {}", address, e);
        }
    }

    tokio::signal::ctrl_c().await?;
    manager.shutdown().await;
    Ok(())
}
