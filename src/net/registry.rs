//! Protocol handler registry.
//!
//! Handlers advertise an id and a byte-prefix predicate; the registry is an
//! ordered list and dispatch picks the first handler whose predicate matches.
//! The per-channel selector negotiates against `ids()` first, answering `na`
//! for ids no handler advertises, and the negotiated id is what dispatch
//! matches on — so unknown protocols never reach a handler.

use super::stream::Stream;
use super::NetError;
use crate::crypto::PeerId;
use async_trait::async_trait;
use std::sync::Arc;

/// What a handler tells the channel loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Message handled; keep reading this channel.
    Ok,
    /// Message handled; stop the loop in an orderly way.
    Stop,
}

/// Per-channel context handed to handlers.
#[derive(Clone)]
pub struct HandlerContext {
    /// The authenticated identity on the other end of the session.
    pub remote_peer: PeerId,
}

#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Protocol id, e.g. `/ipfs/kad/1.0.0`.
    fn id(&self) -> &'static str;

    /// Whether a raw message belongs to this protocol (id-prefix match).
    fn can_handle(&self, msg: &[u8]) -> bool {
        msg.starts_with(self.id().as_bytes())
    }

    /// Handle one message. The stream is available for replies and follow-up
    /// reads; errors tear the whole session down.
    async fn handle(
        &self,
        msg: Vec<u8>,
        stream: &mut Stream,
        ctx: &HandlerContext,
    ) -> Result<Verdict, NetError>;

    /// Idempotent shutdown notification.
    async fn shutdown(&self) {}
}

/// Ordered collection of protocol handlers.
#[derive(Default, Clone)]
pub struct ProtocolRegistry {
    handlers: Vec<Arc<dyn ProtocolHandler>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.push(handler);
    }

    /// Protocol ids in registration order, for the channel selector.
    pub fn ids(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.id()).collect()
    }

    /// First handler whose predicate matches the message.
    pub fn dispatch(&self, msg: &[u8]) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.iter().find(|h| h.can_handle(msg)).cloned()
    }

    pub async fn shutdown_all(&self) {
        for handler in &self.handlers {
            handler.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler(&'static str);

    #[async_trait]
    impl ProtocolHandler for EchoHandler {
        fn id(&self) -> &'static str {
            self.0
        }

        async fn handle(
            &self,
            _msg: Vec<u8>,
            _stream: &mut Stream,
            _ctx: &HandlerContext,
        ) -> Result<Verdict, NetError> {
            Ok(Verdict::Ok)
        }
    }

    #[test]
    fn dispatch_matches_prefix_in_order() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(EchoHandler("/ipfs/kad/1.0.0")));
        registry.register(Arc::new(EchoHandler("/ipfs/id/1.0.0")));

        let found = registry.dispatch(b"/ipfs/kad/1.0.0\nrest").unwrap();
        assert_eq!(found.id(), "/ipfs/kad/1.0.0");
        assert!(registry.dispatch(b"/ipfs/bitswap/1.0.0\n").is_none());
        assert_eq!(registry.ids(), vec!["/ipfs/kad/1.0.0", "/ipfs/id/1.0.0"]);
    }
}
