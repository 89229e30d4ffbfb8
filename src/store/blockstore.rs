//! Content-addressed block storage.

use super::StoreError;
use crate::types::{Block, Cid};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;

#[async_trait]
pub trait Blockstore: Send + Sync {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>, StoreError>;

    /// Store a block, returning the number of payload bytes written.
    async fn put(&self, block: &Block) -> Result<usize, StoreError>;

    async fn has(&self, cid: &Cid) -> Result<bool, StoreError>;
}

pub struct MemoryBlockstore {
    blocks: Mutex<HashMap<Vec<u8>, Block>>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self { blocks: Mutex::new(HashMap::new()) }
    }
}

impl Default for MemoryBlockstore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Blockstore for MemoryBlockstore {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>, StoreError> {
        Ok(self.blocks.lock().await.get(&cid.hash).cloned())
    }

    async fn put(&self, block: &Block) -> Result<usize, StoreError> {
        let len = block.data().len();
        self.blocks
            .lock()
            .await
            .insert(block.cid().hash.clone(), block.clone());
        Ok(len)
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StoreError> {
        Ok(self.blocks.lock().await.contains_key(&cid.hash))
    }
}

/// Persistent blocks keyed by multihash. The payload is stored bare; the CID
/// is reconstructed from the caller's request and re-verified on read.
pub struct SledBlockstore {
    blocks: sled::Tree,
}

impl SledBlockstore {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self { blocks: db.open_tree("blocks")? })
    }

    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::open(&db)
    }
}

#[async_trait]
impl Blockstore for SledBlockstore {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>, StoreError> {
        match self.blocks.get(&cid.hash)? {
            Some(raw) => {
                let block = Block::with_cid(cid.clone(), raw.to_vec())
                    .map_err(|_| StoreError::CorruptBlock(cid.to_base58()))?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, block: &Block) -> Result<usize, StoreError> {
        self.blocks.insert(block.cid().hash.clone(), block.data())?;
        Ok(block.data().len())
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StoreError> {
        Ok(self.blocks.contains_key(&cid.hash)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Codec;

    #[tokio::test]
    async fn memory_put_get_has() {
        let store = MemoryBlockstore::new();
        let block = Block::new(Codec::Raw, b"block data".to_vec());

        assert!(!store.has(block.cid()).await.unwrap());
        assert_eq!(store.put(&block).await.unwrap(), 10);
        assert!(store.has(block.cid()).await.unwrap());

        let got = store.get(block.cid()).await.unwrap().unwrap();
        assert_eq!(got.data(), b"block data");
    }

    #[tokio::test]
    async fn sled_round_trip_verifies_digest() {
        let dir = std::env::temp_dir().join(format!("cairn_bs_test_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        {
            let store = SledBlockstore::open_path(&dir).unwrap();
            let block = Block::new(Codec::DagProtobuf, b"persisted".to_vec());
            store.put(&block).await.unwrap();
            let got = store.get(block.cid()).await.unwrap().unwrap();
            assert_eq!(got.data(), b"persisted");

            let missing = Block::new(Codec::Raw, b"other".to_vec());
            assert!(store.get(missing.cid()).await.unwrap().is_none());
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}
