//! Raw byte-stream transports, pluggable by address family.

use super::multiaddr::Multiaddr;
use super::stream::{with_deadline, Stream};
use super::{NetError, PHASE_TIMEOUT_SECS};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Opens raw byte streams to multiaddresses it understands.
#[async_trait]
pub trait Transport: Send + Sync {
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    async fn dial(&self, addr: &Multiaddr) -> Result<Stream, NetError>;
}

/// The only transport this node ships: `/ip4|ip6/../tcp/..`.
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    fn can_dial(&self, addr: &Multiaddr) -> bool {
        addr.is_ip()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<Stream, NetError> {
        let socket = addr
            .socket_addr()
            .ok_or_else(|| NetError::Protocol(format!("{addr} has no tcp endpoint")))?;
        debug!("dialing {socket}");
        let tcp = with_deadline(PHASE_TIMEOUT_SECS, async {
            Ok(TcpStream::connect(socket).await?)
        })
        .await?;
        tcp.set_nodelay(true)?;
        Ok(Stream::tcp(tcp))
    }
}

/// Ordered set of transports; the first that understands an address dials it.
pub struct Dialer {
    transports: Vec<Box<dyn Transport>>,
}

impl Dialer {
    pub fn new() -> Self {
        Self { transports: vec![Box::new(TcpTransport)] }
    }

    pub fn with_transports(transports: Vec<Box<dyn Transport>>) -> Self {
        Self { transports }
    }

    pub async fn dial(&self, addr: &Multiaddr) -> Result<Stream, NetError> {
        for transport in &self.transports {
            if transport.can_dial(addr) {
                return transport.dial(addr).await;
            }
        }
        Err(NetError::Protocol(format!("no transport for {addr}")))
    }
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new()
    }
}
