//! Inbound Kademlia message handling.
//!
//! One handler instance serves every kad channel. Replies echo the request
//! message with the answer fields filled in, which is what remote nodes
//! expect; PUT_VALUE is the only silent operation.

use super::distance::{closest_peers, CLOSER_PEER_COUNT};
use crate::crypto::{self, PeerId};
use crate::net::registry::{HandlerContext, ProtocolHandler, Verdict};
use crate::net::stream::Stream;
use crate::net::NetError;
use crate::store::datastore::{Datastore, DatastoreRecord};
use crate::store::peerstore::Peer;
use crate::store::{Blockstore, Peerstore, Providerstore};
use crate::types::{now, Cid, Codec};
use crate::wire::{KadMessage, MessageType, Record, WireConnection, WirePeer};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Convert a stored peer into its wire form.
pub(crate) fn to_wire_peer(peer: &Peer) -> WirePeer {
    WirePeer {
        id: peer.id.as_bytes().to_vec(),
        addrs: peer.addrs.iter().map(|a| a.to_string()).collect(),
        connection: if peer.is_connected() || peer.is_local {
            WireConnection::Connected
        } else {
            WireConnection::NotConnected
        },
    }
}

/// Parse a wire peer, dropping unparseable addresses.
pub(crate) fn from_wire_peer(wire: &WirePeer) -> Option<(PeerId, Vec<crate::net::Multiaddr>)> {
    let id = PeerId::from_bytes(&wire.id).ok()?;
    let addrs = wire
        .addrs
        .iter()
        .filter_map(|a| a.parse().ok())
        .collect();
    Some((id, addrs))
}

pub struct DhtHandler {
    peerstore: Arc<Peerstore>,
    providerstore: Arc<Providerstore>,
    datastore: Arc<dyn Datastore>,
    blockstore: Arc<dyn Blockstore>,
}

impl DhtHandler {
    pub fn new(
        peerstore: Arc<Peerstore>,
        providerstore: Arc<Providerstore>,
        datastore: Arc<dyn Datastore>,
        blockstore: Arc<dyn Blockstore>,
    ) -> Self {
        Self { peerstore, providerstore, datastore, blockstore }
    }

    /// Up to 20 peers nearest to `key`, the local peer excluded.
    async fn closer_peers(&self, key: &[u8]) -> Vec<WirePeer> {
        let peers: Vec<Peer> = self
            .peerstore
            .peers()
            .await
            .into_iter()
            .filter(|p| !p.is_local)
            .collect();
        closest_peers(peers, key, CLOSER_PEER_COUNT)
            .iter()
            .map(to_wire_peer)
            .collect()
    }

    /// Validate the record signature against the author's known public key,
    /// then persist. Unknown authors are rejected: a record we cannot verify
    /// is a record we do not store.
    async fn handle_put_value(&self, msg: &KadMessage, ctx: &HandlerContext) -> Result<(), NetError> {
        let Some(record) = &msg.record else {
            return Err(NetError::Protocol("put_value without record".into()));
        };
        let author = PeerId::from_bytes(&record.author)
            .map_err(|_| NetError::Protocol("put_value author is not a peer id".into()))?;

        let author_key = match self.peerstore.get(&author).await.and_then(|p| p.public_key) {
            Some(key) => key,
            None => {
                warn!("put_value from {}: author {} has no known key, dropping", ctx.remote_peer, author);
                return Ok(());
            }
        };
        if crypto::verify_signature(&author_key, &record.signed_payload(), &record.signature).is_err() {
            warn!("put_value from {}: bad record signature, dropping", ctx.remote_peer);
            return Ok(());
        }

        let timestamp = if record.time != 0 { record.time } else { now() };
        self.datastore
            .put(DatastoreRecord::with_timestamp(record.key.clone(), record.value.clone(), timestamp))
            .await
            .map_err(|e| NetError::Protocol(e.to_string()))?;
        debug!("stored record from {} ({} bytes)", author, record.value.len());
        Ok(())
    }

    /// Local hit: echo with the record filled in. Miss: closer peers only.
    async fn handle_get_value(&self, msg: &KadMessage) -> Result<KadMessage, NetError> {
        let mut reply = msg.clone();
        match self
            .datastore
            .get(&msg.key)
            .await
            .map_err(|e| NetError::Protocol(e.to_string()))?
        {
            Some(stored) => {
                reply.record = Some(Record {
                    key: stored.key,
                    value: stored.value,
                    author: Vec::new(),
                    signature: Vec::new(),
                    time: stored.timestamp,
                });
            }
            None => {
                reply.closer_peers = self.closer_peers(&msg.key).await;
            }
        }
        Ok(reply)
    }

    /// Verify each announced peer's id against its addresses, then record the
    /// claim.
    async fn handle_add_provider(&self, msg: &KadMessage, ctx: &HandlerContext) -> Result<KadMessage, NetError> {
        if msg.provider_peers.is_empty() {
            return Err(NetError::Protocol("add_provider without peers".into()));
        }
        for wire in &msg.provider_peers {
            let Some((id, addrs)) = from_wire_peer(wire) else {
                warn!("add_provider from {}: unparseable peer, skipping", ctx.remote_peer);
                continue;
            };
            // the claimed id must match the /ipfs component of its addresses
            let id_matches = addrs
                .iter()
                .filter_map(|a| a.peer_id())
                .all(|addr_id| addr_id == id);
            if !id_matches {
                warn!("add_provider from {}: id does not match addresses, skipping {}", ctx.remote_peer, id);
                continue;
            }
            self.peerstore.get_or_add(&id, &addrs).await;
            self.providerstore.add(&msg.key, &id).await;
            debug!("{} announced as provider by {}", id, ctx.remote_peer);
        }
        Ok(msg.clone())
    }

    /// Local blockstore hit puts the local peer first; announced providers
    /// follow; closer peers are always appended.
    async fn handle_get_providers(&self, msg: &KadMessage) -> Result<KadMessage, NetError> {
        let mut reply = msg.clone();
        reply.provider_peers.clear();

        if let Ok(cid) = Cid::new(Codec::DagProtobuf, msg.key.clone()) {
            let has_local = self
                .blockstore
                .has(&cid)
                .await
                .map_err(|e| NetError::Protocol(e.to_string()))?;
            if has_local {
                let local = self.peerstore.local_peer().await;
                reply.provider_peers.push(to_wire_peer(&local));
            }
        }

        for provider in self.providerstore.get(&msg.key).await {
            if let Some(peer) = self.peerstore.get(&provider).await {
                if !peer.is_local {
                    reply.provider_peers.push(to_wire_peer(&peer));
                }
            }
        }

        reply.closer_peers = self.closer_peers(&msg.key).await;
        Ok(reply)
    }

    /// Exact peerstore hit beats the closer-peer fallback.
    async fn handle_find_node(&self, msg: &KadMessage) -> Result<KadMessage, NetError> {
        let mut reply = msg.clone();
        let wanted = PeerId::from_bytes(&msg.key)
            .map_err(|_| NetError::Protocol("find_node key is not a peer id".into()))?;
        match self.peerstore.get(&wanted).await {
            Some(peer) => reply.provider_peers = vec![to_wire_peer(&peer)],
            None => reply.closer_peers = self.closer_peers(&msg.key).await,
        }
        Ok(reply)
    }
}

#[async_trait]
impl ProtocolHandler for DhtHandler {
    fn id(&self) -> &'static str {
        crate::net::PROTO_KAD
    }

    async fn handle(
        &self,
        msg: Vec<u8>,
        stream: &mut Stream,
        ctx: &HandlerContext,
    ) -> Result<Verdict, NetError> {
        let kad = KadMessage::decode(&msg)?;
        debug!("kad {:?} from {}", kad.message_type, ctx.remote_peer);

        let reply = match kad.message_type {
            MessageType::PutValue => {
                self.handle_put_value(&kad, ctx).await?;
                None
            }
            MessageType::GetValue => Some(self.handle_get_value(&kad).await?),
            MessageType::AddProvider => Some(self.handle_add_provider(&kad, ctx).await?),
            MessageType::GetProviders => Some(self.handle_get_providers(&kad).await?),
            MessageType::FindNode => Some(self.handle_find_node(&kad).await?),
            MessageType::Ping => Some(kad),
        };

        if let Some(reply) = reply {
            stream.write_framed(&reply.encode()).await?;
        }
        Ok(Verdict::Ok)
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

    struct Fixture {
        handler: DhtHandler,
        peerstore: Arc<Peerstore>,
        providerstore: Arc<Providerstore>,
        datastore: Arc<MemoryDatastore>,
        blockstore: Arc<MemoryBlockstore>,
    }

    fn fixture() -> Fixture {
        let peerstore = Arc::new(Peerstore::new(
            id("QmLocal"),
            vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
        ));
        let providerstore = Arc::new(Providerstore::new());
        let datastore = Arc::new(MemoryDatastore::new());
        let blockstore = Arc::new(MemoryBlockstore::new());
        let handler = DhtHandler::new(
            peerstore.clone(),
            providerstore.clone(),
            datastore.clone(),
            blockstore.clone(),
        );
        Fixture { handler, peerstore, providerstore, datastore, blockstore }
    }

    #[tokio::test]
    async fn get_providers_includes_self_only_on_local_hit() {
        let f = fixture();
        let block = Block::new(Codec::DagProtobuf, b"content".to_vec());
        let key = block.cid().hash.clone();

        let msg = KadMessage::with_key(MessageType::GetProviders, key.clone());
        let reply = f.handler.handle_get_providers(&msg).await.unwrap();
        assert!(reply.provider_peers.is_empty());

        f.blockstore.put(&block).await.unwrap();
        let reply = f.handler.handle_get_providers(&msg).await.unwrap();
        assert_eq!(reply.provider_peers.len(), 1);
        assert_eq!(reply.provider_peers[0].id, b"QmLocal".to_vec());
    }

    #[tokio::test]
    async fn get_providers_appends_announced_claims_and_closer_peers() {
        let f = fixture();
        f.peerstore.get_or_add(&id("QmProvider"), &[]).await;
        f.peerstore.get_or_add(&id("QmOther"), &[]).await;
        f.providerstore.add(b"the-key", &id("QmProvider")).await;

        let msg = KadMessage::with_key(MessageType::GetProviders, b"the-key".to_vec());
        let reply = f.handler.handle_get_providers(&msg).await.unwrap();

        assert_eq!(reply.provider_peers.len(), 1);
        assert_eq!(reply.provider_peers[0].id, b"QmProvider".to_vec());
        // closer peers never include the local peer
        assert!(!reply.closer_peers.is_empty());
        assert!(reply.closer_peers.iter().all(|p| p.id != b"QmLocal".to_vec()));
    }

    #[tokio::test]
    async fn add_provider_rejects_mismatched_identity() {
        let f = fixture();
        let ctx = HandlerContext { remote_peer: id("QmSender") };

        let mut msg = KadMessage::with_key(MessageType::AddProvider, b"key".to_vec());
        msg.provider_peers.push(WirePeer {
            id: b"QmClaimed".to_vec(),
            addrs: vec!["/ip4/9.9.9.9/tcp/4001/ipfs/QmSomeoneElse".to_string()],
            connection: WireConnection::Connected,
        });
        f.handler.handle_add_provider(&msg, &ctx).await.unwrap();
        assert!(f.providerstore.get(b"key").await.is_empty());

        // matching identity is accepted
        let mut ok = KadMessage::with_key(MessageType::AddProvider, b"key".to_vec());
        ok.provider_peers.push(WirePeer {
            id: b"QmClaimed".to_vec(),
            addrs: vec!["/ip4/9.9.9.9/tcp/4001/ipfs/QmClaimed".to_string()],
            connection: WireConnection::Connected,
        });
        f.handler.handle_add_provider(&ok, &ctx).await.unwrap();
        assert_eq!(f.providerstore.get(b"key").await, vec![id("QmClaimed")]);
    }

    #[tokio::test]
    async fn get_value_hits_and_misses() {
        let f = fixture();
        f.peerstore.get_or_add(&id("QmSomeone"), &[]).await;
        f.datastore
            .put(DatastoreRecord::with_timestamp(b"k".to_vec(), b"v".to_vec(), 42))
            .await
            .unwrap();

        let hit = f
            .handler
            .handle_get_value(&KadMessage::with_key(MessageType::GetValue, b"k".to_vec()))
            .await
            .unwrap();
        assert_eq!(hit.record.unwrap().value, b"v".to_vec());

        let miss = f
            .handler
            .handle_get_value(&KadMessage::with_key(MessageType::GetValue, b"absent".to_vec()))
            .await
            .unwrap();
        assert!(miss.record.is_none());
        assert!(!miss.closer_peers.is_empty());
    }

    #[tokio::test]
    async fn find_node_exact_hit() {
        let f = fixture();
        f.peerstore
            .get_or_add(&id("QmTarget"), &["/ip4/5.5.5.5/tcp/4001".parse().unwrap()])
            .await;

        let reply = f
            .handler
            .handle_find_node(&KadMessage::with_key(MessageType::FindNode, b"QmTarget".to_vec()))
            .await
            .unwrap();
        assert_eq!(reply.provider_peers.len(), 1);
        assert_eq!(reply.provider_peers[0].id, b"QmTarget".to_vec());
    }

    #[tokio::test]
    async fn put_value_rejects_unknown_author() {
        let f = fixture();
        let ctx = HandlerContext { remote_peer: id("QmSender") };
        let mut msg = KadMessage::with_key(MessageType::PutValue, b"k".to_vec());
        msg.record = Some(Record {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            author: b"QmNobody".to_vec(),
            signature: vec![0; 16],
            time: 1,
        });
        f.handler.handle_put_value(&msg, &ctx).await.unwrap();
        assert!(f.datastore.get(b"k").await.unwrap().is_none());
    }
}
