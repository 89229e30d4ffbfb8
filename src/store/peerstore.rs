//! In-memory peer index with insertion-order iteration.
//!
//! `get_or_add` merges by identity: addresses union, never replace. A peer is
//! created on first learn (bootstrap, remote announce, store query) and kept
//! for the life of the node; only its connection state and session change.

use super::StoreError;
use crate::crypto::PeerId;
use crate::net::multiaddr::Multiaddr;
use crate::net::yamux::YamuxSession;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    NotConnected,
    Connecting,
    Connected,
    CannotConnect,
}

/// Live context attached to a connected peer: one secio channel, one yamux
/// session.
pub struct SessionHandle {
    pub remote_addr: Option<Multiaddr>,
    pub session: Arc<YamuxSession>,
}

#[derive(Clone)]
pub struct Peer {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub state: ConnectionState,
    /// DER public key, learned from the secio handshake.
    pub public_key: Option<Vec<u8>>,
    pub is_local: bool,
    pub session: Option<Arc<SessionHandle>>,
}

impl Peer {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            addrs: Vec::new(),
            state: ConnectionState::NotConnected,
            public_key: None,
            is_local: false,
            session: None,
        }
    }

    pub fn with_addrs(id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        let mut peer = Self::new(id);
        peer.addrs = addrs;
        peer
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.session.is_some()
    }

    /// First dialable address.
    pub fn dial_addr(&self) -> Option<&Multiaddr> {
        self.addrs.iter().find(|a| a.is_ip())
    }
}

struct Inner {
    order: Vec<PeerId>,
    peers: HashMap<PeerId, Peer>,
}

/// Thread-safe peer collection, read-mostly.
pub struct Peerstore {
    local: PeerId,
    inner: Mutex<Inner>,
}

impl Peerstore {
    /// Create a store seeded with the local peer itself.
    pub fn new(local: PeerId, listen_addrs: Vec<Multiaddr>) -> Self {
        let mut local_peer = Peer::with_addrs(local.clone(), listen_addrs);
        local_peer.is_local = true;
        let mut peers = HashMap::new();
        let order = vec![local.clone()];
        peers.insert(local.clone(), local_peer);
        Self { local, inner: Mutex::new(Inner { order, peers }) }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub async fn local_peer(&self) -> Peer {
        let inner = self.inner.lock().await;
        inner.peers[&self.local].clone()
    }

    /// Insert or merge: existing entries keep their identity and union their
    /// addresses; new entries join at the end of the iteration order.
    pub async fn get_or_add(&self, id: &PeerId, addrs: &[Multiaddr]) -> Peer {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.peers.get_mut(id) {
            for addr in addrs {
                if !existing.addrs.contains(addr) {
                    existing.addrs.push(addr.clone());
                }
            }
            return existing.clone();
        }
        debug!("peerstore learned {id}");
        let peer = Peer::with_addrs(id.clone(), addrs.to_vec());
        inner.order.push(id.clone());
        inner.peers.insert(id.clone(), peer.clone());
        peer
    }

    pub async fn add_peer(&self, peer: Peer) -> Result<(), StoreError> {
        let merged = self.get_or_add(&peer.id, &peer.addrs).await;
        if peer.public_key.is_some() && merged.public_key.is_none() {
            self.set_public_key(&peer.id, peer.public_key.unwrap_or_default()).await;
        }
        Ok(())
    }

    pub async fn get(&self, id: &PeerId) -> Option<Peer> {
        self.inner.lock().await.peers.get(id).cloned()
    }

    pub async fn contains(&self, id: &PeerId) -> bool {
        self.inner.lock().await.peers.contains_key(id)
    }

    pub async fn set_state(&self, id: &PeerId, state: ConnectionState) {
        let mut inner = self.inner.lock().await;
        if let Some(peer) = inner.peers.get_mut(id) {
            peer.state = state;
        }
    }

    /// Attach a session on connect; `None` clears it on disconnect. A peer
    /// parked in `CannotConnect` stays there until something reconnects it.
    pub async fn set_session(&self, id: &PeerId, session: Option<Arc<SessionHandle>>) {
        let mut inner = self.inner.lock().await;
        if let Some(peer) = inner.peers.get_mut(id) {
            peer.state = match (&session, peer.state) {
                (Some(_), _) => ConnectionState::Connected,
                (None, ConnectionState::CannotConnect) => ConnectionState::CannotConnect,
                (None, _) => ConnectionState::NotConnected,
            };
            peer.session = session;
        }
    }

    pub async fn set_public_key(&self, id: &PeerId, der: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        if let Some(peer) = inner.peers.get_mut(id) {
            peer.public_key = Some(der);
        }
    }

    /// Snapshot of all peers in insertion order.
    pub async fn peers(&self) -> Vec<Peer> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.peers.get(id).cloned())
            .collect()
    }

    /// Snapshot of connected remote peers, insertion order.
    pub async fn connected_peers(&self) -> Vec<Peer> {
        self.peers()
            .await
            .into_iter()
            .filter(|p| !p.is_local && p.is_connected())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        PeerId::from_string(s.to_string())
    }

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn get_or_add_merges_addresses() {
        let store = Peerstore::new(id("QmLocal"), vec![ma("/ip4/127.0.0.1/tcp/4001")]);

        store.get_or_add(&id("QmA"), &[ma("/ip4/1.1.1.1/tcp/4001")]).await;
        let merged = store
            .get_or_add(&id("QmA"), &[ma("/ip4/1.1.1.1/tcp/4001"), ma("/ip4/2.2.2.2/tcp/4001")])
            .await;

        assert_eq!(merged.addrs.len(), 2);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn iteration_keeps_insertion_order() {
        let store = Peerstore::new(id("QmLocal"), vec![]);
        store.get_or_add(&id("QmB"), &[]).await;
        store.get_or_add(&id("QmA"), &[]).await;
        store.get_or_add(&id("QmC"), &[]).await;

        let names: Vec<String> = store
            .peers()
            .await
            .into_iter()
            .map(|p| p.id.as_str().to_string())
            .collect();
        assert_eq!(names, vec!["QmLocal", "QmB", "QmA", "QmC"]);
    }

    #[tokio::test]
    async fn local_peer_is_marked() {
        let store = Peerstore::new(id("QmLocal"), vec![]);
        assert!(store.local_peer().await.is_local);
        assert!(!store.get_or_add(&id("QmA"), &[]).await.is_local);
    }
}
