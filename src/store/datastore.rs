//! Key-value record store with an insertion-ordered cursor.
//!
//! Records carry key, value and a timestamp in epoch seconds. The journal
//! depends on cursor traversal: last record first, walking `previous`.
//! Updating a record in place keeps its original position in the order.

use super::StoreError;
use crate::types::now;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: u64,
}

impl DatastoreRecord {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value, timestamp: now() }
    }

    pub fn with_timestamp(key: Vec<u8>, value: Vec<u8>, timestamp: u64) -> Self {
        Self { key, value, timestamp }
    }
}

/// Snapshot cursor over the store in insertion order.
pub struct Cursor {
    records: Vec<DatastoreRecord>,
    pos: Option<usize>,
}

impl Cursor {
    fn new(records: Vec<DatastoreRecord>) -> Self {
        Self { records, pos: None }
    }

    pub fn first(&mut self) -> Option<&DatastoreRecord> {
        if self.records.is_empty() {
            return None;
        }
        self.pos = Some(0);
        self.records.first()
    }

    pub fn last(&mut self) -> Option<&DatastoreRecord> {
        if self.records.is_empty() {
            return None;
        }
        let idx = self.records.len() - 1;
        self.pos = Some(idx);
        self.records.get(idx)
    }

    pub fn next(&mut self) -> Option<&DatastoreRecord> {
        let next = match self.pos {
            Some(p) if p + 1 < self.records.len() => p + 1,
            Some(_) => return None,
            None => 0,
        };
        self.pos = Some(next);
        self.records.get(next)
    }

    pub fn previous(&mut self) -> Option<&DatastoreRecord> {
        let prev = match self.pos {
            Some(0) | None => return None,
            Some(p) => p - 1,
        };
        self.pos = Some(prev);
        self.records.get(prev)
    }
}

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<DatastoreRecord>, StoreError>;

    async fn put(&self, record: DatastoreRecord) -> Result<(), StoreError>;

    async fn cursor(&self) -> Result<Cursor, StoreError>;
}

// =============================================================================
// MEMORY BACKEND
// =============================================================================

struct MemoryInner {
    order: Vec<Vec<u8>>,
    map: HashMap<Vec<u8>, DatastoreRecord>,
}

pub struct MemoryDatastore {
    inner: Mutex<MemoryInner>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(MemoryInner { order: Vec::new(), map: HashMap::new() }) }
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &[u8]) -> Result<Option<DatastoreRecord>, StoreError> {
        Ok(self.inner.lock().await.map.get(key).cloned())
    }

    async fn put(&self, record: DatastoreRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.map.contains_key(&record.key) {
            inner.order.push(record.key.clone());
        }
        inner.map.insert(record.key.clone(), record);
        Ok(())
    }

    async fn cursor(&self) -> Result<Cursor, StoreError> {
        let inner = self.inner.lock().await;
        let records = inner
            .order
            .iter()
            .filter_map(|k| inner.map.get(k).cloned())
            .collect();
        Ok(Cursor::new(records))
    }
}

// =============================================================================
// SLED BACKEND
// =============================================================================

/// Persistent datastore: `records` holds key -> bincode(record), `order`
/// holds a big-endian sequence number -> key so cursor order survives
/// restarts, `index` maps key -> sequence to keep updates in place.
pub struct SledDatastore {
    records: sled::Tree,
    order: sled::Tree,
    index: sled::Tree,
}

impl SledDatastore {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            records: db.open_tree("datastore_records")?,
            order: db.open_tree("datastore_order")?,
            index: db.open_tree("datastore_index")?,
        })
    }

    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::open(&db)
    }

    fn next_seq(&self) -> Result<u64, StoreError> {
        Ok(match self.order.last()? {
            Some((key, _)) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key);
                u64::from_be_bytes(buf) + 1
            }
            None => 0,
        })
    }
}

#[async_trait]
impl Datastore for SledDatastore {
    async fn get(&self, key: &[u8]) -> Result<Option<DatastoreRecord>, StoreError> {
        match self.records.get(key)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, record: DatastoreRecord) -> Result<(), StoreError> {
        if self.index.get(&record.key)?.is_none() {
            let seq = self.next_seq()?;
            self.order.insert(seq.to_be_bytes(), record.key.clone())?;
            self.index.insert(record.key.clone(), seq.to_be_bytes().to_vec())?;
        }
        self.records.insert(record.key.clone(), bincode::serialize(&record)?)?;
        Ok(())
    }

    async fn cursor(&self) -> Result<Cursor, StoreError> {
        let mut records = Vec::new();
        for entry in self.order.iter() {
            let (_, key) = entry?;
            if let Some(raw) = self.records.get(&key)? {
                records.push(bincode::deserialize(&raw)?);
            }
        }
        Ok(Cursor::new(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn check_cursor_behavior(store: &dyn Datastore) {
        for i in 0..5u8 {
            store
                .put(DatastoreRecord::with_timestamp(vec![i], vec![i, i], 100 + u64::from(i)))
                .await
                .unwrap();
        }

        let mut cursor = store.cursor().await.unwrap();
        assert_eq!(cursor.first().unwrap().key, vec![0]);
        assert_eq!(cursor.next().unwrap().key, vec![1]);
        assert_eq!(cursor.last().unwrap().key, vec![4]);
        assert_eq!(cursor.previous().unwrap().key, vec![3]);
        assert_eq!(cursor.previous().unwrap().key, vec![2]);

        // walking off the front stops cleanly
        cursor.first();
        assert!(cursor.previous().is_none());
    }

    #[tokio::test]
    async fn memory_cursor_traversal() {
        let store = MemoryDatastore::new();
        check_cursor_behavior(&store).await;
    }

    #[tokio::test]
    async fn memory_update_keeps_position() {
        let store = MemoryDatastore::new();
        store.put(DatastoreRecord::with_timestamp(b"a".to_vec(), b"1".to_vec(), 1)).await.unwrap();
        store.put(DatastoreRecord::with_timestamp(b"b".to_vec(), b"2".to_vec(), 2)).await.unwrap();
        store.put(DatastoreRecord::with_timestamp(b"a".to_vec(), b"9".to_vec(), 9)).await.unwrap();

        let mut cursor = store.cursor().await.unwrap();
        let first = cursor.first().unwrap();
        assert_eq!(first.key, b"a".to_vec());
        assert_eq!(first.value, b"9".to_vec());
    }

    #[tokio::test]
    async fn sled_round_trip() {
        let dir = std::env::temp_dir().join(format!("cairn_ds_test_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        {
            let store = SledDatastore::open_path(&dir).unwrap();
            check_cursor_behavior(&store).await;

            let got = store.get(&[2]).await.unwrap().unwrap();
            assert_eq!(got.value, vec![2, 2]);
            assert!(store.get(b"missing").await.unwrap().is_none());
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}
