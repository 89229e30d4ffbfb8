//! Node assembly: identity, stores, swarm, routing, protocol handlers.

use crate::config::{Config, ConfigError};
use crate::crypto::{Identity, PeerId};
use crate::dht::{DhtHandler, OfflineRouting, OnlineRouting, Routing, RoutingError};
use crate::exchange::{BlockRequestHandler, Exchange, ExchangeError, SwarmExchange};
use crate::identify::IdentifyHandler;
use crate::journal::{JournalHandler, JournalReplicator, SYNC_INTERVAL_SECS};
use crate::net::multiaddr::Multiaddr;
use crate::net::swarm::{Swarm, PROTO_BITSWAP, PROTO_IDENTIFY, PROTO_JOURNAL, PROTO_KAD};
use crate::net::NetError;
use crate::store::datastore::DatastoreRecord;
use crate::store::{
    Blockstore, Datastore, MemoryBlockstore, MemoryDatastore, Peerstore, Providerstore,
    SledBlockstore, SledDatastore, StoreError,
};
use crate::types::{Block, Cid, Codec};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("net: {0}")]
    Net(#[from] NetError),

    #[error("routing: {0}")]
    Routing(#[from] RoutingError),

    #[error("exchange: {0}")]
    Exchange(#[from] ExchangeError),
}

/// How much of the network stack to bring up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// Local stores only.
    Offline,
    /// Local stores plus the API surface, no swarm.
    ApiAvailable,
    /// Full swarm, DHT routing and replication.
    Online,
}

pub struct NodeOptions {
    pub identity: Identity,
    pub mode: NodeMode,
    /// Swarm listen address; `None` disables the listener.
    pub listen: Option<Multiaddr>,
    pub bootstrap: Vec<Multiaddr>,
    pub replication_peers: Vec<Multiaddr>,
    pub replication_interval_secs: u64,
    /// Repo directory for persistent stores; `None` keeps everything in memory.
    pub repo: Option<PathBuf>,
}

impl NodeOptions {
    /// Ephemeral in-memory node, the shape tests use.
    pub fn memory(identity: Identity, mode: NodeMode) -> Self {
        Self {
            identity,
            mode,
            listen: None,
            bootstrap: Vec::new(),
            replication_peers: Vec::new(),
            replication_interval_secs: SYNC_INTERVAL_SECS,
            repo: None,
        }
    }

    /// Options for a configured repo.
    pub fn from_config(config: &Config, repo: PathBuf, mode: NodeMode) -> Result<Self, ConfigError> {
        Ok(Self {
            identity: config.identity()?,
            mode,
            listen: Some(config.swarm_addr()?),
            bootstrap: config.bootstrap_addrs()?,
            replication_peers: config.replication_addrs()?,
            replication_interval_secs: config.replication.interval_secs.max(1),
            repo: Some(repo),
        })
    }
}

pub struct Node {
    pub identity: Arc<Identity>,
    pub mode: NodeMode,
    pub peerstore: Arc<Peerstore>,
    pub providerstore: Arc<Providerstore>,
    pub datastore: Arc<dyn Datastore>,
    pub blockstore: Arc<dyn Blockstore>,
    pub swarm: Arc<Swarm>,
    pub routing: Arc<dyn Routing>,
    pub exchange: Arc<dyn Exchange>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    pub async fn start(opts: NodeOptions) -> Result<Arc<Self>, NodeError> {
        let identity = Arc::new(opts.identity);

        let (datastore, blockstore): (Arc<dyn Datastore>, Arc<dyn Blockstore>) = match &opts.repo {
            Some(repo) => {
                let db = sled::open(repo.join("store")).map_err(StoreError::from)?;
                (
                    Arc::new(SledDatastore::open(&db)?),
                    Arc::new(SledBlockstore::open(&db)?),
                )
            }
            None => (
                Arc::new(MemoryDatastore::new()),
                Arc::new(MemoryBlockstore::new()),
            ),
        };

        let peerstore = Arc::new(Peerstore::new(identity.peer_id().clone(), Vec::new()));
        let providerstore = Arc::new(Providerstore::new());
        let swarm = Swarm::new(identity.clone(), peerstore.clone());

        let routing: Arc<dyn Routing> = match opts.mode {
            NodeMode::Online => Arc::new(OnlineRouting::new(
                swarm.clone(),
                peerstore.clone(),
                providerstore.clone(),
                datastore.clone(),
                identity.clone(),
                opts.bootstrap.clone(),
            )),
            NodeMode::Offline | NodeMode::ApiAvailable => Arc::new(OfflineRouting::new(
                peerstore.clone(),
                providerstore.clone(),
                datastore.clone(),
                blockstore.clone(),
            )),
        };

        let exchange: Arc<dyn Exchange> =
            Arc::new(SwarmExchange::new(swarm.clone(), routing.clone(), blockstore.clone()));

        // handler registration order is dispatch order
        let protocols: Vec<String> = [PROTO_IDENTIFY, PROTO_KAD, PROTO_JOURNAL, PROTO_BITSWAP]
            .iter()
            .map(|s| s.to_string())
            .collect();
        swarm.register_handler(Arc::new(IdentifyHandler::new(
            identity.clone(),
            swarm.clone(),
            protocols,
        )));
        swarm.register_handler(Arc::new(DhtHandler::new(
            peerstore.clone(),
            providerstore.clone(),
            datastore.clone(),
            blockstore.clone(),
        )));
        swarm.register_handler(Arc::new(JournalHandler::new(
            datastore.clone(),
            exchange.clone(),
        )));
        swarm.register_handler(Arc::new(BlockRequestHandler::new(blockstore.clone())));

        let (shutdown, shutdown_rx) = watch::channel(false);

        if opts.mode == NodeMode::Online {
            if let Some(listen) = &opts.listen {
                let actual = swarm.listen(listen).await?;
                let announce = actual.with_peer(identity.peer_id());
                peerstore
                    .get_or_add(identity.peer_id(), std::slice::from_ref(&announce))
                    .await;
            }

            routing.bootstrap().await?;

            let mut replication_ids: Vec<PeerId> = Vec::new();
            for addr in &opts.replication_peers {
                match addr.peer_id() {
                    Some(id) => {
                        peerstore.get_or_add(&id, std::slice::from_ref(addr)).await;
                        replication_ids.push(id);
                    }
                    None => warn!("replication peer {addr} has no peer id, skipping"),
                }
            }
            JournalReplicator::new(
                swarm.clone(),
                datastore.clone(),
                replication_ids,
                opts.replication_interval_secs,
            )
            .spawn(shutdown_rx);
        }

        info!("node {} up, mode {:?}", identity.peer_id(), opts.mode);
        Ok(Arc::new(Self {
            identity,
            mode: opts.mode,
            peerstore,
            providerstore,
            datastore,
            blockstore,
            swarm,
            routing,
            exchange,
            shutdown,
        }))
    }

    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    /// Store a block, journal it, and announce it to the network when online.
    pub async fn put_block(&self, data: Vec<u8>) -> Result<Cid, NodeError> {
        let block = Block::new(Codec::DagProtobuf, data);
        self.blockstore.put(&block).await?;
        self.datastore
            .put(DatastoreRecord::new(block.cid().hash.clone(), Vec::new()))
            .await?;

        if self.mode == NodeMode::Online {
            if let Err(e) = self.routing.provide(&block.cid().hash).await {
                warn!("provide for {} failed: {e}", block.cid());
            }
        }
        Ok(block.cid().clone())
    }

    /// Local blockstore, then the exchange.
    pub async fn get_block(&self, cid: &Cid) -> Result<Option<Block>, NodeError> {
        Ok(self.exchange.get_block(cid).await?)
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.swarm.shutdown().await;
        info!("node {} stopped", self.peer_id());
    }
}
