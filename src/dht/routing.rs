//! Routing facade: the public lookup/announce operations.
//!
//! Two implementations behind one contract. Offline touches only local
//! stores. Online runs the Kademlia fan-out: local answer first, then
//! connected peers in XOR-distance order, concurrently where the operation
//! allows an early exit.

use super::distance::rank_by_distance;
use super::handler::from_wire_peer;
use crate::crypto::{CryptoError, Identity, PeerId};
use crate::net::multiaddr::Multiaddr;
use crate::net::stream::with_deadline;
use crate::net::swarm::{Swarm, PROTO_KAD};
use crate::net::{NetError, PHASE_TIMEOUT_SECS};
use crate::store::datastore::{Datastore, DatastoreRecord};
use crate::store::peerstore::{Peer, Peerstore};
use crate::store::{Blockstore, Providerstore, StoreError};
use crate::types::{now, Cid, Codec};
use crate::wire::{KadMessage, MessageType, Record, WireConnection, WireError, WirePeer};
use async_trait::async_trait;
use rand::RngCore;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("net: {0}")]
    Net(#[from] NetError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("node is offline")]
    Offline,

    #[error("peer {0} not found")]
    PeerNotFound(PeerId),
}

#[async_trait]
pub trait Routing: Send + Sync {
    async fn put_value(&self, key: &[u8], value: &[u8]) -> Result<(), RoutingError>;

    async fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, RoutingError>;

    async fn find_providers(&self, key: &[u8]) -> Result<Vec<Peer>, RoutingError>;

    async fn find_peer(&self, id: &PeerId) -> Result<Option<Peer>, RoutingError>;

    async fn provide(&self, key: &[u8]) -> Result<(), RoutingError>;

    async fn ping(&self, id: &PeerId) -> Result<bool, RoutingError>;

    async fn bootstrap(&self) -> Result<(), RoutingError>;
}

// =============================================================================
// OFFLINE
// =============================================================================

/// Local stores only: `find_providers` returns self iff local has the key.
pub struct OfflineRouting {
    peerstore: Arc<Peerstore>,
    providerstore: Arc<Providerstore>,
    datastore: Arc<dyn Datastore>,
    blockstore: Arc<dyn Blockstore>,
}

impl OfflineRouting {
    pub fn new(
        peerstore: Arc<Peerstore>,
        providerstore: Arc<Providerstore>,
        datastore: Arc<dyn Datastore>,
        blockstore: Arc<dyn Blockstore>,
    ) -> Self {
        Self { peerstore, providerstore, datastore, blockstore }
    }

    async fn has_local(&self, key: &[u8]) -> Result<bool, RoutingError> {
        if self.datastore.get(key).await?.is_some() {
            return Ok(true);
        }
        if let Ok(cid) = Cid::new(Codec::DagProtobuf, key.to_vec()) {
            return Ok(self.blockstore.has(&cid).await?);
        }
        Ok(false)
    }
}

#[async_trait]
impl Routing for OfflineRouting {
    async fn put_value(&self, key: &[u8], value: &[u8]) -> Result<(), RoutingError> {
        self.datastore
            .put(DatastoreRecord::new(key.to_vec(), value.to_vec()))
            .await?;
        Ok(())
    }

    async fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, RoutingError> {
        Ok(self.datastore.get(key).await?.map(|r| r.value))
    }

    async fn find_providers(&self, key: &[u8]) -> Result<Vec<Peer>, RoutingError> {
        if self.has_local(key).await? {
            return Ok(vec![self.peerstore.local_peer().await]);
        }
        Ok(Vec::new())
    }

    async fn find_peer(&self, id: &PeerId) -> Result<Option<Peer>, RoutingError> {
        Ok(self.peerstore.get(id).await)
    }

    async fn provide(&self, key: &[u8]) -> Result<(), RoutingError> {
        self.providerstore.add(key, self.peerstore.local_id()).await;
        Ok(())
    }

    async fn ping(&self, _id: &PeerId) -> Result<bool, RoutingError> {
        Err(RoutingError::Offline)
    }

    async fn bootstrap(&self) -> Result<(), RoutingError> {
        Ok(())
    }
}

// =============================================================================
// ONLINE
// =============================================================================

/// DHT-backed routing over the swarm.
pub struct OnlineRouting {
    swarm: Arc<Swarm>,
    peerstore: Arc<Peerstore>,
    providerstore: Arc<Providerstore>,
    datastore: Arc<dyn Datastore>,
    identity: Arc<Identity>,
    bootstrap_addrs: Vec<Multiaddr>,
}

/// One request/reply exchange on a fresh kad channel.
async fn send_receive(swarm: Arc<Swarm>, peer: PeerId, msg: KadMessage) -> Result<KadMessage, RoutingError> {
    let mut channel = swarm.open_channel(&peer, PROTO_KAD).await?;
    channel.write_framed(&msg.encode()).await?;
    let reply = with_deadline(PHASE_TIMEOUT_SECS, channel.read_framed()).await?;
    let _ = channel.close().await;
    Ok(KadMessage::decode(&reply)?)
}

/// Fire-and-forget for messages that have no reply (PUT_VALUE).
async fn send_only(swarm: Arc<Swarm>, peer: PeerId, msg: KadMessage) -> Result<(), RoutingError> {
    let mut channel = swarm.open_channel(&peer, PROTO_KAD).await?;
    channel.write_framed(&msg.encode()).await?;
    let _ = channel.close().await;
    Ok(())
}

impl OnlineRouting {
    pub fn new(
        swarm: Arc<Swarm>,
        peerstore: Arc<Peerstore>,
        providerstore: Arc<Providerstore>,
        datastore: Arc<dyn Datastore>,
        identity: Arc<Identity>,
        bootstrap_addrs: Vec<Multiaddr>,
    ) -> Self {
        Self { swarm, peerstore, providerstore, datastore, identity, bootstrap_addrs }
    }

    /// Learn every peer a reply mentions; return the provider entries.
    async fn absorb_reply(&self, reply: &KadMessage) -> Vec<Peer> {
        for wire in &reply.closer_peers {
            if let Some((id, addrs)) = from_wire_peer(wire) {
                if id != *self.peerstore.local_id() {
                    self.peerstore.get_or_add(&id, &addrs).await;
                }
            }
        }
        let mut providers = Vec::new();
        for wire in &reply.provider_peers {
            if let Some((id, addrs)) = from_wire_peer(wire) {
                providers.push(self.peerstore.get_or_add(&id, &addrs).await);
            }
        }
        providers
    }

    /// Ask connected peers for providers concurrently, nearest first, early
    /// exit on the first non-empty answer.
    async fn find_remote_providers(&self, key: &[u8]) -> Result<Vec<Peer>, RoutingError> {
        let candidates = rank_by_distance(self.peerstore.connected_peers().await, key);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let msg = KadMessage::with_key(MessageType::GetProviders, key.to_vec());

        let mut set = JoinSet::new();
        for peer in candidates {
            let swarm = self.swarm.clone();
            let msg = msg.clone();
            set.spawn(async move { send_receive(swarm, peer.id, msg).await });
        }

        while let Some(joined) = set.join_next().await {
            let reply = match joined {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    debug!("get_providers query failed: {e}");
                    continue;
                }
                Err(_) => continue,
            };
            let providers = self.absorb_reply(&reply).await;
            if !providers.is_empty() {
                set.abort_all();
                return Ok(providers);
            }
        }
        Ok(Vec::new())
    }

    async fn get_peer_value(&self, id: &PeerId, key: &[u8]) -> Option<Vec<u8>> {
        let msg = KadMessage::with_key(MessageType::GetValue, key.to_vec());
        match send_receive(self.swarm.clone(), id.clone(), msg).await {
            Ok(reply) => reply.record.filter(|r| !r.value.is_empty()).map(|r| r.value),
            Err(e) => {
                debug!("get_value from {id} failed: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl Routing for OnlineRouting {
    /// Sign, store locally, then best-effort replicate to connected peers.
    async fn put_value(&self, key: &[u8], value: &[u8]) -> Result<(), RoutingError> {
        let time = now();
        let mut record = Record {
            key: key.to_vec(),
            value: value.to_vec(),
            author: self.identity.peer_id().as_bytes().to_vec(),
            signature: Vec::new(),
            time,
        };
        record.signature = self.identity.sign(&record.signed_payload());

        self.datastore
            .put(DatastoreRecord::with_timestamp(key.to_vec(), value.to_vec(), time))
            .await?;

        let mut msg = KadMessage::with_key(MessageType::PutValue, key.to_vec());
        msg.record = Some(record);
        for peer in self.peerstore.connected_peers().await {
            if let Err(e) = send_only(self.swarm.clone(), peer.id.clone(), msg.clone()).await {
                debug!("put_value to {} failed: {e}", peer.id);
            }
        }
        Ok(())
    }

    /// Providers first; when the search only surfaced closer peers, fall back
    /// to asking them directly, nearest first.
    async fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, RoutingError> {
        if let Some(record) = self.datastore.get(key).await? {
            return Ok(Some(record.value));
        }

        let providers = self.find_providers(key).await?;
        let mut asked: Vec<PeerId> = Vec::new();
        for peer in &providers {
            if peer.is_local {
                if let Some(record) = self.datastore.get(key).await? {
                    return Ok(Some(record.value));
                }
                continue;
            }
            asked.push(peer.id.clone());
            if let Some(value) = self.get_peer_value(&peer.id, key).await {
                return Ok(Some(value));
            }
        }

        let fallback: Vec<Peer> = self
            .peerstore
            .peers()
            .await
            .into_iter()
            .filter(|p| !p.is_local && !asked.contains(&p.id))
            .collect();
        for peer in rank_by_distance(fallback, key) {
            if let Some(value) = self.get_peer_value(&peer.id, key).await {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    async fn find_providers(&self, key: &[u8]) -> Result<Vec<Peer>, RoutingError> {
        let mut local = Vec::new();
        for id in self.providerstore.get(key).await {
            if let Some(peer) = self.peerstore.get(&id).await {
                local.push(peer);
            }
        }
        if !local.is_empty() {
            return Ok(local);
        }
        self.find_remote_providers(key).await
    }

    async fn find_peer(&self, id: &PeerId) -> Result<Option<Peer>, RoutingError> {
        if let Some(peer) = self.peerstore.get(id).await {
            return Ok(Some(peer));
        }

        let msg = KadMessage::with_key(MessageType::FindNode, id.as_bytes().to_vec());
        for candidate in rank_by_distance(self.peerstore.connected_peers().await, id.as_bytes()) {
            match send_receive(self.swarm.clone(), candidate.id.clone(), msg.clone()).await {
                Ok(reply) if !reply.provider_peers.is_empty() => {
                    let found = self.absorb_reply(&reply).await;
                    if let Some(peer) = found.into_iter().find(|p| p.id == *id) {
                        return Ok(Some(peer));
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("find_node via {} failed: {e}", candidate.id),
            }
        }
        Ok(None)
    }

    /// Announce ourselves as provider of `key` to every connected peer.
    async fn provide(&self, key: &[u8]) -> Result<(), RoutingError> {
        self.providerstore.add(key, self.peerstore.local_id()).await;

        let Some(announce) = self.swarm.announce_addr() else {
            warn!("provide: not listening, nothing to announce");
            return Ok(());
        };
        let local = WirePeer {
            id: self.peerstore.local_id().as_bytes().to_vec(),
            addrs: vec![announce.to_string()],
            connection: WireConnection::Connected,
        };
        let mut msg = KadMessage::with_key(MessageType::AddProvider, key.to_vec());
        msg.provider_peers.push(local);

        for peer in self.peerstore.connected_peers().await {
            if let Err(e) = send_receive(self.swarm.clone(), peer.id.clone(), msg.clone()).await {
                debug!("provide to {} failed: {e}", peer.id);
            }
        }
        Ok(())
    }

    /// Kademlia ping: a random key must come back byte-identical.
    async fn ping(&self, id: &PeerId) -> Result<bool, RoutingError> {
        if self.peerstore.get(id).await.is_none() {
            return Err(RoutingError::PeerNotFound(id.clone()));
        }
        let mut token = vec![0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut token);
        let msg = KadMessage::with_key(MessageType::Ping, token.clone());

        let reply = send_receive(self.swarm.clone(), id.clone(), msg).await?;
        Ok(reply.message_type == MessageType::Ping && reply.key == token)
    }

    /// Learn and dial every configured bootstrap address. Idempotent: peers
    /// merge by identity and live sessions are reused.
    async fn bootstrap(&self) -> Result<(), RoutingError> {
        for addr in &self.bootstrap_addrs {
            let Some(id) = addr.peer_id() else {
                warn!("bootstrap address {addr} has no peer id, skipping");
                continue;
            };
            if id == *self.peerstore.local_id() {
                continue;
            }
            self.peerstore.get_or_add(&id, std::slice::from_ref(addr)).await;
            if let Err(e) = self.swarm.connect(&id).await {
                debug!("bootstrap dial {addr} failed: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBlockstore, MemoryDatastore};
    use crate::types::Block;

    fn id(s: &str) -> PeerId {
        PeerId::from_string(s.to_string())
    }

    fn offline() -> OfflineRouting {
        OfflineRouting::new(
            Arc::new(Peerstore::new(id("QmLocal"), vec![])),
            Arc::new(Providerstore::new()),
            Arc::new(MemoryDatastore::new()),
            Arc::new(MemoryBlockstore::new()),
        )
    }

    #[tokio::test]
    async fn offline_put_get_round_trip() {
        let routing = offline();
        routing.put_value(b"k", b"v").await.unwrap();
        assert_eq!(routing.get_value(b"k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(routing.get_value(b"other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn offline_find_providers_is_self_iff_local() {
        let peerstore = Arc::new(Peerstore::new(id("QmLocal"), vec![]));
        let blockstore = Arc::new(MemoryBlockstore::new());
        let routing = OfflineRouting::new(
            peerstore,
            Arc::new(Providerstore::new()),
            Arc::new(MemoryDatastore::new()),
            blockstore.clone(),
        );

        let block = Block::new(Codec::DagProtobuf, b"data".to_vec());
        assert!(routing.find_providers(&block.cid().hash).await.unwrap().is_empty());

        blockstore.put(&block).await.unwrap();
        let providers = routing.find_providers(&block.cid().hash).await.unwrap();
        assert_eq!(providers.len(), 1);
        assert!(providers[0].is_local);
    }

    #[tokio::test]
    async fn offline_ping_is_an_error() {
        let routing = offline();
        assert!(matches!(routing.ping(&id("QmX")).await, Err(RoutingError::Offline)));
    }
}
