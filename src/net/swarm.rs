//! Swarm: per-peer session lifecycle.
//!
//! Accept side: raw TCP -> multistream -> secio -> multistream -> yamux, then
//! a channel-accept loop that hands every remotely-opened stream to the
//! protocol registry. Dial side runs the same ladder in the other direction.
//! A failed phase closes the stream and marks the peer `cannot-connect`.

use super::multiaddr::Multiaddr;
use super::multistream;
use super::registry::{HandlerContext, ProtocolHandler, ProtocolRegistry, Verdict};
use super::secio::{self, SecioError};
use super::stream::{with_deadline, Stream};
use super::transport::Dialer;
use super::yamux::{Role, YamuxError, YamuxSession};
use super::{NetError, DIAL_TIMEOUT_SECS, PHASE_TIMEOUT_SECS};
use crate::crypto::{Identity, PeerId};
use crate::store::peerstore::{ConnectionState, Peerstore, SessionHandle};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const PROTO_SECIO: &str = "/secio/1.0.0";
pub const PROTO_YAMUX: &str = "/yamux/1.0.0";
pub const PROTO_IDENTIFY: &str = "/ipfs/id/1.0.0";
pub const PROTO_KAD: &str = "/ipfs/kad/1.0.0";
pub const PROTO_JOURNAL: &str = "/ipfs/journalio/1.0.0";
pub const PROTO_BITSWAP: &str = "/ipfs/bitswap/1.0.0";

fn secio_net(e: SecioError) -> NetError {
    match e {
        SecioError::Net(inner) => inner,
        other => NetError::Protocol(other.to_string()),
    }
}

fn yamux_net(e: YamuxError) -> NetError {
    match e {
        YamuxError::Net(inner) => inner,
        YamuxError::SessionClosed => NetError::Closed,
        other => NetError::Protocol(other.to_string()),
    }
}

pub struct Swarm {
    identity: Arc<Identity>,
    peerstore: Arc<Peerstore>,
    registry: RwLock<ProtocolRegistry>,
    dialer: Dialer,
    listen_addr: StdMutex<Option<Multiaddr>>,
    shutdown: watch::Sender<bool>,
    /// Serializes dials so a peer ends up with exactly one session.
    dial_lock: tokio::sync::Mutex<()>,
}

impl Swarm {
    pub fn new(identity: Arc<Identity>, peerstore: Arc<Peerstore>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            identity,
            peerstore,
            registry: RwLock::new(ProtocolRegistry::new()),
            dialer: Dialer::new(),
            listen_addr: StdMutex::new(None),
            shutdown,
            dial_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn peerstore(&self) -> &Arc<Peerstore> {
        &self.peerstore
    }

    pub fn local_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    /// Register before `listen`: channels opened by remote peers only see
    /// handlers present at negotiation time.
    pub fn register_handler(&self, handler: Arc<dyn ProtocolHandler>) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(handler);
    }

    fn registry_snapshot(&self) -> ProtocolRegistry {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The address we actually bound, once listening.
    pub fn listen_addr(&self) -> Option<Multiaddr> {
        self.listen_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The bound address with our peer id appended, the form other nodes dial.
    pub fn announce_addr(&self) -> Option<Multiaddr> {
        self.listen_addr().map(|a| a.with_peer(self.local_id()))
    }

    /// Bind and start accepting. Returns the bound address (resolves port 0).
    pub async fn listen(self: &Arc<Self>, addr: &Multiaddr) -> Result<Multiaddr, NetError> {
        let socket = addr
            .socket_addr()
            .ok_or_else(|| NetError::Protocol(format!("cannot listen on {addr}")))?;
        let listener = TcpListener::bind(socket).await?;
        let actual = Multiaddr::tcp(socket.ip(), listener.local_addr()?.port());
        *self.listen_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(actual.clone());
        info!("listening on {actual} as {}", self.local_id());

        tokio::spawn(accept_loop(self.clone(), listener));
        Ok(actual)
    }

    /// Ensure a live session to `id`, dialing its known addresses if needed.
    pub async fn connect(self: &Arc<Self>, id: &PeerId) -> Result<Arc<SessionHandle>, NetError> {
        let _guard = self.dial_lock.lock().await;

        let peer = self
            .peerstore
            .get(id)
            .await
            .ok_or_else(|| NetError::Protocol(format!("unknown peer {id}")))?;
        if let Some(handle) = &peer.session {
            if !handle.session.is_closed() {
                return Ok(handle.clone());
            }
        }
        let Some(addr) = peer.dial_addr().cloned() else {
            self.peerstore.set_state(id, ConnectionState::CannotConnect).await;
            return Err(NetError::Protocol(format!("no dialable address for {id}")));
        };

        self.peerstore.set_state(id, ConnectionState::Connecting).await;
        match with_deadline(DIAL_TIMEOUT_SECS, self.dial_and_upgrade(&addr, Some(id))).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.peerstore.set_state(id, ConnectionState::CannotConnect).await;
                Err(e)
            }
        }
    }

    /// Dial an address without requiring a known peer id (bootstrap helper).
    pub async fn connect_addr(self: &Arc<Self>, addr: &Multiaddr) -> Result<Arc<SessionHandle>, NetError> {
        let _guard = self.dial_lock.lock().await;
        let expected = addr.peer_id();
        with_deadline(DIAL_TIMEOUT_SECS, self.dial_and_upgrade(addr, expected.as_ref())).await
    }

    async fn dial_and_upgrade(
        self: &Arc<Self>,
        addr: &Multiaddr,
        expected: Option<&PeerId>,
    ) -> Result<Arc<SessionHandle>, NetError> {
        let mut stream = self.dialer.dial(addr).await?;
        with_deadline(PHASE_TIMEOUT_SECS, multistream::dial(&mut stream, PROTO_SECIO)).await?;

        let identity = self.identity.clone();
        let session = with_deadline(PHASE_TIMEOUT_SECS, async {
            secio::handshake(stream, &identity).await.map_err(secio_net)
        })
        .await?;

        if let Some(want) = expected {
            if session.remote_peer != *want {
                return Err(NetError::Protocol(format!(
                    "dialed {want} but found {}",
                    session.remote_peer
                )));
            }
        }
        let remote_peer = session.remote_peer.clone();
        let remote_key = session.remote_public_key.clone();
        let mut stream = session.stream;

        with_deadline(PHASE_TIMEOUT_SECS, multistream::dial(&mut stream, PROTO_YAMUX)).await?;

        let (yamux, accept_rx) = YamuxSession::start(stream, Role::Client);
        Ok(self
            .install_session(remote_peer, remote_key, Some(addr.clone()), yamux, accept_rx)
            .await)
    }

    /// Open a channel on the peer's session and negotiate `protocol` on it.
    pub async fn open_channel(self: &Arc<Self>, id: &PeerId, protocol: &str) -> Result<Stream, NetError> {
        let handle = self.connect(id).await?;
        let mut channel = handle.session.open_stream().await.map_err(yamux_net)?;
        with_deadline(PHASE_TIMEOUT_SECS, multistream::dial(&mut channel, protocol)).await?;
        Ok(channel)
    }

    async fn install_session(
        self: &Arc<Self>,
        peer: PeerId,
        public_key: Vec<u8>,
        remote_addr: Option<Multiaddr>,
        session: Arc<YamuxSession>,
        accept_rx: mpsc::Receiver<Stream>,
    ) -> Arc<SessionHandle> {
        let addrs: Vec<Multiaddr> = remote_addr.clone().into_iter().collect();
        self.peerstore.get_or_add(&peer, &addrs).await;
        self.peerstore.set_public_key(&peer, public_key).await;

        let handle = Arc::new(SessionHandle { remote_addr, session: session.clone() });
        self.peerstore.set_session(&peer, Some(handle.clone())).await;
        info!("peer {peer} connected");

        tokio::spawn(channel_accept_loop(self.clone(), peer, session, accept_rx));
        handle
    }

    /// Close every session and stop accepting.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        for peer in self.peerstore.peers().await {
            if let Some(handle) = peer.session {
                handle.session.close().await;
            }
        }
        self.registry_snapshot().shutdown_all().await;
        info!("swarm shut down");
    }
}

async fn accept_loop(swarm: Arc<Swarm>, listener: TcpListener) {
    let mut shutdown_rx = swarm.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((tcp, addr)) => {
                    tokio::spawn(inbound_session(swarm.clone(), tcp, addr));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            }
        }
    }
}

/// Upgrade one inbound TCP stream through the full negotiation ladder.
async fn inbound_session(swarm: Arc<Swarm>, tcp: TcpStream, addr: SocketAddr) {
    debug!("inbound connection from {addr}");
    let mut stream = match tcp.set_nodelay(true) {
        Ok(()) => Stream::tcp(tcp),
        Err(e) => {
            debug!("socket setup failed for {addr}: {e}");
            return;
        }
    };

    if let Err(e) = with_deadline(
        PHASE_TIMEOUT_SECS,
        multistream::accept(&mut stream, &[PROTO_SECIO]),
    )
    .await
    {
        debug!("selector with {addr} failed: {e}");
        return;
    }

    let identity = swarm.identity.clone();
    let session = match with_deadline(PHASE_TIMEOUT_SECS, async {
        secio::handshake(stream, &identity).await.map_err(secio_net)
    })
    .await
    {
        Ok(s) => s,
        Err(e) => {
            debug!("secio with {addr} failed: {e}");
            return;
        }
    };
    let remote_peer = session.remote_peer.clone();
    let remote_key = session.remote_public_key.clone();
    let mut stream = session.stream;

    if let Err(e) = with_deadline(
        PHASE_TIMEOUT_SECS,
        multistream::accept(&mut stream, &[PROTO_YAMUX]),
    )
    .await
    {
        debug!("muxer selection with {addr} failed: {e}");
        return;
    }

    let (yamux, accept_rx) = YamuxSession::start(stream, Role::Server);
    swarm
        .install_session(remote_peer, remote_key, None, yamux, accept_rx)
        .await;
}

/// Drain remotely-opened channels for one session; when the queue closes the
/// session is gone and the peer leaves `connected`.
async fn channel_accept_loop(
    swarm: Arc<Swarm>,
    peer: PeerId,
    session: Arc<YamuxSession>,
    mut accept_rx: mpsc::Receiver<Stream>,
) {
    let ctx = HandlerContext { remote_peer: peer.clone() };
    while let Some(channel) = accept_rx.recv().await {
        tokio::spawn(serve_channel(swarm.clone(), channel, ctx.clone(), session.clone()));
    }
    swarm.peerstore.set_session(&peer, None).await;
    info!("peer {peer} disconnected");
}

/// One inbound channel: negotiate the protocol, then feed its messages to the
/// owning handler. A handler error is a protocol error: the session goes away
/// and the peer is held in `cannot-connect` until the next bootstrap.
async fn serve_channel(
    swarm: Arc<Swarm>,
    mut channel: Stream,
    ctx: HandlerContext,
    session: Arc<YamuxSession>,
) {
    let registry = swarm.registry_snapshot();
    let ids = registry.ids();
    let protocol = match with_deadline(PHASE_TIMEOUT_SECS, multistream::accept(&mut channel, &ids)).await {
        Ok(p) => p,
        Err(e) => {
            debug!("channel negotiation with {} failed: {e}", ctx.remote_peer);
            let _ = channel.close().await;
            return;
        }
    };
    let Some(handler) = registry.dispatch(protocol.as_bytes()) else {
        let _ = channel.close().await;
        return;
    };
    debug!("serving {protocol} channel for {}", ctx.remote_peer);

    loop {
        let msg = match channel.read_framed().await {
            Ok(m) => m,
            Err(NetError::Closed) => break,
            Err(e) => {
                debug!("channel read from {} ended: {e}", ctx.remote_peer);
                break;
            }
        };
        match handler.handle(msg, &mut channel, &ctx).await {
            Ok(Verdict::Ok) => {}
            Ok(Verdict::Stop) => break,
            Err(e) => {
                warn!("{protocol} handler error for {}: {e}", ctx.remote_peer);
                session.close().await;
                swarm
                    .peerstore
                    .set_state(&ctx.remote_peer, ConnectionState::CannotConnect)
                    .await;
                break;
            }
        }
    }
    let _ = channel.close().await;
}
