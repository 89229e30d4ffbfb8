//! Journal replication: periodic anti-entropy between approved peers.
//!
//! Each cycle sends the last few datastore records as a timestamped digest
//! over `/ipfs/journalio/1.0.0`. The receiver drops digests from badly skewed
//! clocks, fetches entries it is missing through the block exchange, and
//! adopts the earlier timestamp when both sides know a hash. The reply is an
//! entry-less digest whose end epoch marks how far the receiver has seen.

use crate::exchange::Exchange;
use crate::net::registry::{HandlerContext, ProtocolHandler, Verdict};
use crate::net::stream::{with_deadline, Stream};
use crate::net::swarm::{Swarm, PROTO_JOURNAL};
use crate::net::{NetError, PHASE_TIMEOUT_SECS};
use crate::store::datastore::{Datastore, DatastoreRecord};
use crate::store::StoreError;
use crate::types::{now, Cid, Codec};
use crate::wire::{JournalEntry, JournalMessage, WireError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Digest size: how many records each sync round carries.
pub const DIGEST_LEN: usize = 10;

/// Digests whose clock differs from ours by more than this are dropped.
pub const CLOCK_SKEW_LIMIT_SECS: u64 = 300;

/// Default replication cadence.
pub const SYNC_INTERVAL_SECS: u64 = 60;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("net: {0}")]
    Net(#[from] NetError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

/// Build the outbound digest: the last `n` records by insertion order,
/// walking the cursor backwards from the end.
pub async fn build_digest(datastore: &dyn Datastore, n: usize) -> Result<JournalMessage, JournalError> {
    let mut message = JournalMessage { current_epoch: now(), ..Default::default() };

    let mut cursor = datastore.cursor().await?;
    let mut record = cursor.last().cloned();
    let mut taken = 0;
    while let Some(rec) = record {
        if taken >= n {
            break;
        }
        if message.end_epoch == 0 || rec.timestamp > message.end_epoch {
            message.end_epoch = rec.timestamp;
        }
        if message.start_epoch == 0 || rec.timestamp < message.start_epoch {
            message.start_epoch = rec.timestamp;
        }
        message.entries.push(JournalEntry {
            timestamp: rec.timestamp,
            hash: rec.key.clone(),
            pin: true,
        });
        taken += 1;
        record = cursor.previous().cloned();
    }
    Ok(message)
}

enum Todo {
    /// We have never seen this hash; fetch the block.
    EntryNeeded { hash: Vec<u8>, remote_timestamp: u64 },
    /// Both sides know the hash but the remote's timestamp is earlier.
    TimeAdjust { hash: Vec<u8>, remote_timestamp: u64 },
}

/// Inbound digest handling.
pub struct JournalHandler {
    datastore: Arc<dyn Datastore>,
    exchange: Arc<dyn Exchange>,
}

impl JournalHandler {
    pub fn new(datastore: Arc<dyn Datastore>, exchange: Arc<dyn Exchange>) -> Self {
        Self { datastore, exchange }
    }

    async fn build_todo(&self, incoming: &JournalMessage) -> Result<Vec<Todo>, JournalError> {
        let mut todos = Vec::new();
        for entry in &incoming.entries {
            match self.datastore.get(&entry.hash).await? {
                None => todos.push(Todo::EntryNeeded {
                    hash: entry.hash.clone(),
                    remote_timestamp: entry.timestamp,
                }),
                Some(local) => {
                    let remote_earlier = entry.timestamp != 0
                        && (local.timestamp == 0 || entry.timestamp < local.timestamp);
                    if remote_earlier {
                        todos.push(Todo::TimeAdjust {
                            hash: entry.hash.clone(),
                            remote_timestamp: entry.timestamp,
                        });
                    }
                    // entry newer than local: keep local
                }
            }
        }
        Ok(todos)
    }

    async fn adjust_time(&self, hash: &[u8], remote_timestamp: u64) -> Result<(), JournalError> {
        let Some(mut record) = self.datastore.get(hash).await? else {
            warn!("time adjust for a hash that vanished");
            return Ok(());
        };
        if remote_timestamp != 0 && (record.timestamp == 0 || record.timestamp > remote_timestamp) {
            record.timestamp = remote_timestamp;
            self.datastore.put(record).await?;
        }
        Ok(())
    }

    async fn process(&self, incoming: &JournalMessage, ctx: &HandlerContext) -> Result<(), JournalError> {
        for todo in self.build_todo(incoming).await? {
            match todo {
                Todo::EntryNeeded { hash, remote_timestamp } => {
                    let Ok(cid) = Cid::new(Codec::DagProtobuf, hash.clone()) else {
                        warn!("journal entry from {} is not a multihash", ctx.remote_peer);
                        continue;
                    };
                    match self.exchange.get_block(&cid).await {
                        Ok(Some(_block)) => {
                            self.datastore
                                .put(DatastoreRecord::with_timestamp(hash, Vec::new(), remote_timestamp))
                                .await?;
                            debug!("journal fetched {} from the network", cid);
                        }
                        Ok(None) => debug!("journal entry {} not fetchable yet", cid),
                        Err(e) => debug!("journal fetch of {} failed: {e}", cid),
                    }
                }
                Todo::TimeAdjust { hash, remote_timestamp } => {
                    self.adjust_time(&hash, remote_timestamp).await?;
                }
            }
        }
        Ok(())
    }

    /// The newest record timestamp we hold, as the reply's progress marker.
    async fn newest_timestamp(&self) -> Result<u64, JournalError> {
        let mut cursor = self.datastore.cursor().await?;
        let mut newest = 0;
        let mut record = cursor.first().cloned();
        while let Some(rec) = record {
            newest = newest.max(rec.timestamp);
            record = cursor.next().cloned();
        }
        Ok(newest)
    }
}

#[async_trait]
impl ProtocolHandler for JournalHandler {
    fn id(&self) -> &'static str {
        PROTO_JOURNAL
    }

    async fn handle(
        &self,
        msg: Vec<u8>,
        stream: &mut Stream,
        ctx: &HandlerContext,
    ) -> Result<Verdict, NetError> {
        let incoming = JournalMessage::decode(&msg)?;

        let skew = now().abs_diff(incoming.current_epoch);
        if skew > CLOCK_SKEW_LIMIT_SECS {
            warn!(
                "dropping journal digest from {}: clock skew {skew}s",
                ctx.remote_peer
            );
            return Ok(Verdict::Stop);
        }

        self.process(&incoming, ctx)
            .await
            .map_err(|e| NetError::Protocol(e.to_string()))?;

        let reply = JournalMessage {
            start_epoch: 0,
            end_epoch: self
                .newest_timestamp()
                .await
                .map_err(|e| NetError::Protocol(e.to_string()))?,
            current_epoch: now(),
            entries: Vec::new(),
        };
        stream.write_framed(&reply.encode()).await?;
        Ok(Verdict::Ok)
    }
}

/// Periodic outbound sync to the approved replication peers.
pub struct JournalReplicator {
    swarm: Arc<Swarm>,
    datastore: Arc<dyn Datastore>,
    peers: Vec<crate::crypto::PeerId>,
    interval_secs: u64,
}

impl JournalReplicator {
    pub fn new(
        swarm: Arc<Swarm>,
        datastore: Arc<dyn Datastore>,
        peers: Vec<crate::crypto::PeerId>,
        interval_secs: u64,
    ) -> Self {
        Self { swarm, datastore, peers, interval_secs }
    }

    /// Run until `shutdown` flips. One digest per peer per cycle, best effort.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) {
        if self.peers.is_empty() {
            return;
        }
        tokio::spawn(async move {
            let period = Duration::from_secs(self.interval_secs.max(1));
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            info!("journal replication to {} peer(s) every {:?}", self.peers.len(), period);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = interval.tick() => {}
                }
                for peer in &self.peers {
                    if let Err(e) = self.sync_peer(peer).await {
                        debug!("journal sync with {peer} failed: {e}");
                    }
                }
            }
        });
    }

    async fn sync_peer(&self, peer: &crate::crypto::PeerId) -> Result<(), JournalError> {
        let digest = build_digest(self.datastore.as_ref(), DIGEST_LEN).await?;
        if digest.entries.is_empty() {
            return Ok(());
        }

        let mut channel = self.swarm.open_channel(peer, PROTO_JOURNAL).await?;
        channel.write_framed(&digest.encode()).await?;

        // the reply's end epoch tells us how far the remote has seen
        match with_deadline(PHASE_TIMEOUT_SECS, channel.read_framed()).await {
            Ok(reply) => {
                if let Ok(reply) = JournalMessage::decode(&reply) {
                    debug!("{peer} has journal state through {}", reply.end_epoch);
                }
            }
            Err(e) => debug!("no journal reply from {peer}: {e}"),
        }
        let _ = channel.close().await;
        Ok(())
    }
}
