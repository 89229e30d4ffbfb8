//! Minimal block exchange over `/ipfs/bitswap/1.0.0`.
//!
//! Request: one framed message holding the wanted multihash. Reply: the block
//! payload, or an empty frame when the responder does not have it. Want-lists
//! and credit accounting are deliberately absent; this is the block-fetch path
//! the journal and `get_block` need, nothing more.

use crate::dht::routing::{Routing, RoutingError};
use crate::net::registry::{HandlerContext, ProtocolHandler, Verdict};
use crate::net::stream::{with_deadline, Stream};
use crate::net::swarm::{Swarm, PROTO_BITSWAP};
use crate::net::{NetError, PHASE_TIMEOUT_SECS};
use crate::store::{Blockstore, StoreError};
use crate::types::{Block, Cid, CidError, Codec};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("net: {0}")]
    Net(#[from] NetError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("routing: {0}")]
    Routing(#[from] RoutingError),

    #[error("cid: {0}")]
    Cid(#[from] CidError),
}

/// The seam the journal fetches blocks through.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Block>, ExchangeError>;
}

/// Serves block requests from the local blockstore.
pub struct BlockRequestHandler {
    blockstore: Arc<dyn Blockstore>,
}

impl BlockRequestHandler {
    pub fn new(blockstore: Arc<dyn Blockstore>) -> Self {
        Self { blockstore }
    }
}

#[async_trait]
impl ProtocolHandler for BlockRequestHandler {
    fn id(&self) -> &'static str {
        PROTO_BITSWAP
    }

    async fn handle(
        &self,
        msg: Vec<u8>,
        stream: &mut Stream,
        ctx: &HandlerContext,
    ) -> Result<Verdict, NetError> {
        let reply = match Cid::new(Codec::DagProtobuf, msg) {
            Ok(cid) => {
                let found = self
                    .blockstore
                    .get(&cid)
                    .await
                    .map_err(|e| NetError::Protocol(e.to_string()))?;
                match found {
                    Some(block) => {
                        debug!("serving block {} to {}", cid, ctx.remote_peer);
                        block.into_data()
                    }
                    None => Vec::new(),
                }
            }
            // not a multihash we understand; an empty reply says "don't have"
            Err(_) => Vec::new(),
        };
        stream.write_framed(&reply).await?;
        Ok(Verdict::Ok)
    }
}

/// Fetches blocks from providers found through routing, caching them locally.
pub struct SwarmExchange {
    swarm: Arc<Swarm>,
    routing: Arc<dyn Routing>,
    blockstore: Arc<dyn Blockstore>,
}

impl SwarmExchange {
    pub fn new(swarm: Arc<Swarm>, routing: Arc<dyn Routing>, blockstore: Arc<dyn Blockstore>) -> Self {
        Self { swarm, routing, blockstore }
    }

    async fn fetch_from(&self, peer: &crate::crypto::PeerId, cid: &Cid) -> Option<Block> {
        let mut channel = match self.swarm.open_channel(peer, PROTO_BITSWAP).await {
            Ok(ch) => ch,
            Err(e) => {
                debug!("bitswap channel to {peer} failed: {e}");
                return None;
            }
        };
        let result = async {
            channel.write_framed(&cid.hash).await?;
            with_deadline(PHASE_TIMEOUT_SECS, channel.read_framed()).await
        }
        .await;
        let _ = channel.close().await;

        match result {
            Ok(data) if !data.is_empty() => match Block::with_cid(cid.clone(), data) {
                Ok(block) => Some(block),
                Err(_) => {
                    debug!("{peer} returned data not matching {cid}");
                    None
                }
            },
            Ok(_) => None,
            Err(e) => {
                debug!("bitswap fetch from {peer} failed: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl Exchange for SwarmExchange {
    async fn get_block(&self, cid: &Cid) -> Result<Option<Block>, ExchangeError> {
        if let Some(block) = self.blockstore.get(cid).await? {
            return Ok(Some(block));
        }

        for provider in self.routing.find_providers(&cid.hash).await? {
            if provider.is_local {
                continue;
            }
            if let Some(block) = self.fetch_from(&provider.id, cid).await {
                self.blockstore.put(&block).await?;
                return Ok(Some(block));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PeerId;
    use crate::net::stream::testing::pair;
    use crate::store::MemoryBlockstore;

    #[tokio::test]
    async fn request_handler_serves_known_blocks() {
        let blockstore = Arc::new(MemoryBlockstore::new());
        let block = Block::new(Codec::DagProtobuf, b"wanted".to_vec());
        blockstore.put(&block).await.unwrap();

        let handler = BlockRequestHandler::new(blockstore);
        let ctx = HandlerContext { remote_peer: PeerId::from_string("QmAsker".into()) };

        let (mut requester, mut responder) = pair();
        let verdict = handler
            .handle(block.cid().hash.clone(), &mut responder, &ctx)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Ok);
        assert_eq!(requester.read_framed().await.unwrap(), b"wanted");

        // unknown block yields an empty frame
        let missing = Block::new(Codec::Raw, b"absent".to_vec());
        handler
            .handle(missing.cid().hash.clone(), &mut responder, &ctx)
            .await
            .unwrap();
        assert!(requester.read_framed().await.unwrap().is_empty());
    }
}
