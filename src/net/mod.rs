//! P2P networking layer.
//!
//! The connection pipeline is a stack of framed byte-stream protocols:
//! multistream selector -> secio encrypted channel -> yamux session
//! multiplexer -> per-channel multistream selector -> application protocol.
//! Each layer wraps the layer below and negotiates itself on establishment.

pub mod multiaddr;
pub mod multistream;
pub mod registry;
pub mod secio;
pub mod stream;
pub mod swarm;
pub mod transport;
pub mod yamux;

pub use multiaddr::{Multiaddr, MultiaddrError, Segment};
pub use multistream::{MULTISTREAM_ID, PROTOCOL_NA};
pub use registry::{HandlerContext, ProtocolHandler, ProtocolRegistry, Verdict};
pub use secio::{SecioError, SecioSession};
pub use stream::{ChunkRead, ChunkWrite, FrameReader, Stream};
pub use swarm::{Swarm, PROTO_BITSWAP, PROTO_IDENTIFY, PROTO_JOURNAL, PROTO_KAD};
pub use transport::{TcpTransport, Transport};
pub use yamux::{YamuxError, YamuxSession};

use crate::wire::WireError;
use thiserror::Error;

/// Per-phase deadline for handshakes and single protocol exchanges (seconds).
pub const PHASE_TIMEOUT_SECS: u64 = 10;

/// Deadline for a whole dial (TCP connect through yamux establishment).
pub const DIAL_TIMEOUT_SECS: u64 = 30;

/// Transport-level errors shared by every layer of the stack.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("deadline exceeded")]
    Timeout,

    #[error("stream closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("message too large: {0} bytes")]
    TooLarge(usize),
}
