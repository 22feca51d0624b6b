//! Farthing demo node: the P2P core with a null protocol handler
//!
//! Exercises listen, dialing, bans and the sync scheduler against an
//! in-memory chain stub. A real node supplies its own codec and chain.

use clap::Parser;
use farthing::net::{
    AddrBook, ChainView, Config, NetEvent, Network, NullHandler,
};
use farthing::types::Hash;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "farthing", version, about = "Farthing P2P node")]
struct Args {
    /// Listen port
    #[arg(short, long, default_value = "9556")]
    port: u16,

    /// Data directory (peers.dat lives here)
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Maximum total connections
    #[arg(long, default_value = "125")]
    max_connections: usize,

    /// Maximum outbound connections
    #[arg(long, default_value = "8")]
    max_outbound: usize,

    /// Connect only to these destinations (repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// Keep these destinations connected (repeatable)
    #[arg(long)]
    addnode: Vec<String>,

    /// Misbehavior threshold before banning
    #[arg(long, default_value = "100")]
    banscore: u32,

    /// Ban duration in seconds
    #[arg(long, default_value = "86400")]
    bantime: i64,

    /// Disable inbound listening
    #[arg(long)]
    no_listen: bool,

    /// Disable DNS seeding
    #[arg(long)]
    no_dnsseed: bool,
}

/// Chain stub: height zero forever, never in initial download.
struct StubChain;

impl ChainView for StubChain {
    fn is_initial_block_download(&self) -> bool {
        false
    }
    fn best_height(&self) -> u32 {
        0
    }
    fn has_block(&self, _hash: &Hash) -> bool {
        false
    }
    fn has_orphan(&self, _hash: &Hash) -> bool {
        false
    }
    fn set_best_chain(&self, _hash: &Hash) -> bool {
        false
    }
    fn accept_orphan(&self, _hash: &Hash) -> bool {
        false
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("farthing=info")),
        )
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.data_dir)?;

    let config = Config {
        max_connections: args.max_connections,
        max_outbound: args.max_outbound,
        port: args.port,
        listen: !args.no_listen,
        connect: args.connect,
        add_nodes: args.addnode,
        dns_seed: !args.no_dnsseed,
        ban_score: args.banscore,
        ban_time: args.bantime,
        hardened_sync_points: BTreeMap::new(),
        ..Config::default()
    };

    let book = Arc::new(AddrBook::open(args.data_dir.join("peers.dat")));
    let (net, mut events) = Network::new(config, book, Arc::new(StubChain));

    if net.config.listen {
        let bind: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
        net.bind(bind)?;
    }

    let handles = net.start(Arc::new(NullHandler));
    info!("farthing node running on port {}", args.port);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(NetEvent::Connected { endpoint, inbound }) => {
                        info!("peer connected: {} (inbound: {})", endpoint, inbound);
                    }
                    Some(NetEvent::Disconnected { endpoint }) => {
                        info!("peer disconnected: {}", endpoint);
                    }
                    Some(NetEvent::Banned { addr }) => {
                        info!("peer banned: {}", addr);
                    }
                    Some(NetEvent::CountChanged(count)) => {
                        info!("connection count: {}", count);
                    }
                    None => break,
                }
            }
        }
    }

    net.stop(handles).await;
    Ok(())
}
