//! `/ipfs/id/1.0.0`: tell a peer who we are.
//!
//! The requester sends one empty frame to solicit the reply; the responder
//! answers with its public key, listen addresses and supported protocols.

use crate::crypto::Identity;
use crate::net::registry::{HandlerContext, ProtocolHandler, Verdict};
use crate::net::stream::Stream;
use crate::net::swarm::{Swarm, PROTO_IDENTIFY};
use crate::net::NetError;
use crate::wire::pb::{Reader, WireType, Writer};
use crate::wire::WireError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// What a node says about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentifyInfo {
    pub public_key: Vec<u8>,
    pub listen_addrs: Vec<String>,
    pub protocols: Vec<String>,
    pub agent: String,
}

impl IdentifyInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(1, &self.public_key);
        for addr in &self.listen_addrs {
            w.string(2, addr);
        }
        for proto in &self.protocols {
            w.string(3, proto);
        }
        w.string(6, &self.agent);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut info = IdentifyInfo::default();
        let mut r = Reader::new(buf);
        while !r.done() {
            let (field, wire) = r.next_field()?;
            match (field, wire) {
                (1, WireType::LengthDelimited) => info.public_key = r.bytes()?.to_vec(),
                (2, WireType::LengthDelimited) => {
                    info.listen_addrs.push(String::from_utf8_lossy(r.bytes()?).into_owned())
                }
                (3, WireType::LengthDelimited) => {
                    info.protocols.push(String::from_utf8_lossy(r.bytes()?).into_owned())
                }
                (6, WireType::LengthDelimited) => {
                    info.agent = String::from_utf8_lossy(r.bytes()?).into_owned()
                }
                _ => r.skip(wire)?,
            }
        }
        Ok(info)
    }
}

pub struct IdentifyHandler {
    identity: Arc<Identity>,
    swarm: Arc<Swarm>,
    protocols: Vec<String>,
}

impl IdentifyHandler {
    pub fn new(identity: Arc<Identity>, swarm: Arc<Swarm>, protocols: Vec<String>) -> Self {
        Self { identity, swarm, protocols }
    }
}

#[async_trait]
impl ProtocolHandler for IdentifyHandler {
    fn id(&self) -> &'static str {
        PROTO_IDENTIFY
    }

    async fn handle(
        &self,
        _msg: Vec<u8>,
        stream: &mut Stream,
        ctx: &HandlerContext,
    ) -> Result<Verdict, NetError> {
        let info = IdentifyInfo {
            public_key: self.identity.public_envelope().encode(),
            listen_addrs: self
                .swarm
                .announce_addr()
                .map(|a| vec![a.to_string()])
                .unwrap_or_default(),
            protocols: self.protocols.clone(),
            agent: format!("cairn/{}", env!("CARGO_PKG_VERSION")),
        };
        debug!("identifying ourselves to {}", ctx.remote_peer);
        stream.write_framed(&info.encode()).await?;
        Ok(Verdict::Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_info_round_trip() {
        let info = IdentifyInfo {
            public_key: vec![1, 2, 3],
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/4001/ipfs/QmSelf".into()],
            protocols: vec!["/ipfs/kad/1.0.0".into(), "/ipfs/id/1.0.0".into()],
            agent: "cairn/0.1.0".into(),
        };
        assert_eq!(IdentifyInfo::decode(&info.encode()).unwrap(), info);
    }
}
