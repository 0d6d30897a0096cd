use anyhow::Context;
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use forge_node::chain::{MemoryChain, MemoryPool};
use forge_node::clock::SystemClock;
use forge_node::config::load_node_config;
use forge_node::p2p::{Collaborators, Network, PeerStore, SystemResolver};
use forge_node::version::{APPLICATION, VERSION};

#[derive(Debug, Parser)]
#[command(name = "forge-node", version, about = "Forge peer-to-peer node")]
struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Overrides data_dir from the configuration
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Overrides network.peer_port from the configuration
    #[arg(long)]
    peer_port: Option<u16>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %format!("{e:#}"), "Forge node failed");
        eprintln!("forge-node: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_node_config(args.config.as_deref())?;

    // init tracing from FORGE_LOG, RUST_LOG, then the configured filter
    let filter = std::env::var("FORGE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| config.log_filter.clone());
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    info!(application = APPLICATION, version = VERSION, "Forge node starting up");

    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(port) = args.peer_port {
        config.network.peer_port = port;
        config.network.validate()?;
    }

    let store = if config.network.save_peers {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
        let db = sled::open(config.data_dir.join("peers.db")).context("opening peer database")?;
        let store = PeerStore::open(&db)?;
        info!(saved = store.count(), "[PEER STORE] Opened peer table");
        Some(store)
    } else {
        None
    };

    let port = config.network.default_peer_port();
    let net = Network::new(
        config.network,
        Collaborators {
            chain: Arc::new(MemoryChain::new()),
            pool: Arc::new(MemoryPool::new()),
            clock: Arc::new(SystemClock),
            resolver: Arc::new(SystemResolver),
            store,
        },
    )?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding peer port {addr}"))?;
    let local = net.start(listener).await?;
    info!(listen = %local, "Forge node listening");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown requested");
    net.shutdown().await;
    Ok(())
}
