//! Yamux stream multiplexer.
//!
//! One secured connection carries many independent bidirectional streams.
//! The session demultiplexes inbound frames from a single reader task; writers
//! share the session write lock, held only for the duration of a single frame.

pub mod frame;
pub mod session;
pub mod stream;

pub use frame::{flags, Frame, FrameType, GoAwayCode, HEADER_LEN, YAMUX_VERSION};
pub use session::{Role, YamuxSession, KEEPALIVE_INTERVAL_SECS, PING_TIMEOUT_SECS};
pub use stream::{StreamState, INITIAL_WINDOW};

use super::NetError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum YamuxError {
    #[error("net: {0}")]
    Net(#[from] NetError),

    #[error("unsupported yamux version {0}")]
    BadVersion(u8),

    #[error("unknown frame type {0}")]
    BadFrameType(u8),

    #[error("truncated frame header: {0} bytes")]
    TruncatedHeader(usize),

    #[error("frame for unknown stream {0}")]
    UnknownStream(u32),

    #[error("stream id {0} has wrong parity for its initiator")]
    WrongParity(u32),

    #[error("receive window exceeded on stream {0}")]
    WindowExceeded(u32),

    #[error("session closed")]
    SessionClosed,

    #[error("stream backlog full")]
    BacklogFull,

    #[error("remote sent go-away, code {0}")]
    RemoteGoAway(u32),
}
