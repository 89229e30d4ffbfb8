pub mod config;
pub mod crypto;
pub mod dht;
pub mod exchange;
pub mod identify;
pub mod journal;
pub mod net;
pub mod node;
pub mod store;
pub mod types;
pub mod wire;

pub use config::{repo_path, Config, ConfigError, REPO_ENV};
pub use crypto::{Identity, PeerId};
pub use dht::{OfflineRouting, OnlineRouting, Routing, RoutingError};
pub use exchange::{Exchange, ExchangeError};
pub use journal::{JournalHandler, JournalReplicator};
pub use net::{Multiaddr, NetError, Swarm};
pub use node::{Node, NodeError, NodeMode, NodeOptions};
pub use store::{Blockstore, Datastore, Peerstore, Providerstore};
pub use types::{now, Block, Cid, Codec};
