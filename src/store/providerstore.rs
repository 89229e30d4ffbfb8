//! Content-key to provider-claim mapping.
//!
//! A claim means either a local blockstore hit or a remote peer announcing
//! the key via ADD_PROVIDER; each claim remembers when it was made so stale
//! entries can be swept.

use crate::crypto::PeerId;
use crate::types::now;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEntry {
    pub peer: PeerId,
    pub added_at: u64,
}

/// Thread-safe provider index.
pub struct Providerstore {
    inner: Mutex<HashMap<Vec<u8>, Vec<ProviderEntry>>>,
}

impl Providerstore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    /// Record that `peer` claims to provide `key`. Re-announcing refreshes
    /// the claim timestamp.
    pub async fn add(&self, key: &[u8], peer: &PeerId) {
        let mut inner = self.inner.lock().await;
        let entries = inner.entry(key.to_vec()).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.peer == *peer) {
            existing.added_at = now();
            return;
        }
        entries.push(ProviderEntry { peer: peer.clone(), added_at: now() });
    }

    /// All peers claiming this key, oldest claim first.
    pub async fn get(&self, key: &[u8]) -> Vec<PeerId> {
        self.inner
            .lock()
            .await
            .get(key)
            .map(|entries| entries.iter().map(|e| e.peer.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn contains(&self, key: &[u8]) -> bool {
        self.inner.lock().await.contains_key(key)
    }

    pub async fn key_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Default for Providerstore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        PeerId::from_string(s.to_string())
    }

    #[tokio::test]
    async fn add_and_get_claims() {
        let store = Providerstore::new();
        store.add(b"key1", &id("QmA")).await;
        store.add(b"key1", &id("QmB")).await;
        store.add(b"key2", &id("QmA")).await;

        assert_eq!(store.get(b"key1").await, vec![id("QmA"), id("QmB")]);
        assert_eq!(store.get(b"key2").await, vec![id("QmA")]);
        assert!(store.get(b"missing").await.is_empty());
    }

    #[tokio::test]
    async fn reannounce_does_not_duplicate() {
        let store = Providerstore::new();
        store.add(b"key", &id("QmA")).await;
        store.add(b"key", &id("QmA")).await;
        assert_eq!(store.get(b"key").await.len(), 1);
    }
}
