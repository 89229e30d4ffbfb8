//! cairn — content-addressed p2p node.

use cairn::{repo_path, Config, Node, NodeMode, NodeOptions};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "cairn", version, about = "cairn: content-addressed p2p node")]
struct Args {
    /// Repo directory (default: $CAIRN_PATH, then ~/.cairn)
    #[arg(short, long)]
    repo: Option<PathBuf>,

    /// Initialize a new repo and exit
    #[arg(long)]
    init: bool,

    /// Run without joining the network
    #[arg(long)]
    offline: bool,

    /// Override the swarm listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Extra bootstrap multiaddresses (comma-separated)
    #[arg(short, long)]
    bootstrap: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cairn=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();
    let repo = repo_path(args.repo.clone());

    if args.init {
        match Config::init(&repo) {
            Ok((_, identity)) => {
                info!("peer id: {}", identity.peer_id());
            }
            Err(e) => error!("init failed: {e}"),
        }
        return;
    }

    let mut config = match Config::load(&repo) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    if let Some(port) = args.port {
        config.addresses.swarm = format!("/ip4/0.0.0.0/tcp/{port}");
    }
    if let Some(extra) = &args.bootstrap {
        config
            .bootstrap
            .extend(extra.split(',').map(|s| s.trim().to_string()));
    }

    let mode = if args.offline { NodeMode::Offline } else { NodeMode::Online };
    let opts = match NodeOptions::from_config(&config, repo, mode) {
        Ok(o) => o,
        Err(e) => {
            error!("bad config: {e}");
            return;
        }
    };

    info!("cairn v{VERSION} starting, mode {mode:?}");
    let node = match Node::start(opts).await {
        Ok(n) => n,
        Err(e) => {
            error!("failed to start node: {e}");
            return;
        }
    };

    // periodic status line
    let status_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let peers = status_node.peerstore.connected_peers().await.len();
            let keys = status_node.providerstore.key_count().await;
            info!("status: {peers} connected peer(s), {keys} provided key(s)");
        }
    });

    if let Some(addr) = node.swarm.announce_addr() {
        info!("swarm address: {addr}");
    }
    info!("node running, ctrl-c to stop");

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    node.shutdown().await;
}
