//! Local state: peers, provider claims, records, blocks.

pub mod blockstore;
pub mod datastore;
pub mod peerstore;
pub mod providerstore;

pub use blockstore::{Blockstore, MemoryBlockstore, SledBlockstore};
pub use datastore::{Cursor, Datastore, DatastoreRecord, MemoryDatastore, SledDatastore};
pub use peerstore::{ConnectionState, Peer, Peerstore, SessionHandle};
pub use providerstore::{ProviderEntry, Providerstore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage engine: {0}")]
    Sled(#[from] sled::Error),

    #[error("record encoding: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("corrupt stored block for {0}")]
    CorruptBlock(String),
}
