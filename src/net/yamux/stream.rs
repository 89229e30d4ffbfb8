//! Per-stream state and the channel handles handed to protocol code.
//!
//! The session's stream table is the single source of truth: a channel handle
//! is just an `Arc` into the table plus an `Arc` of the session, so state can
//! never diverge between the two.

use super::frame::{flags, Frame};
use super::session::YamuxSession;
use super::YamuxError;
use crate::net::stream::{ChunkRead, ChunkWrite};
use crate::net::NetError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Initial receive window per stream.
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Largest payload carried in one data frame. Keeps a single slow stream from
/// monopolizing the session write lock.
pub const MAX_DATA_FRAME: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Inited,
    SynSent,
    SynRecv,
    Established,
    Closing,
    Closed,
}

/// Shared per-stream record inside the session table.
pub(crate) struct StreamEntry {
    pub id: u32,
    pub state: Mutex<StreamState>,

    /// Inbound bytes awaiting the consumer.
    pub recv_buf: Mutex<VecDeque<u8>>,
    pub readable: Notify,
    /// Remote finished writing (FIN seen).
    pub read_closed: AtomicBool,

    /// Credit we have granted the remote and not yet seen consumed.
    pub recv_window: AtomicU32,
    /// Bytes the consumer has drained since the last window update.
    pub consumed: AtomicU32,

    /// Credit the remote has granted us.
    pub send_window: AtomicU32,
    pub writable: Notify,
}

impl StreamEntry {
    pub fn new(id: u32, state: StreamState) -> Self {
        Self {
            id,
            state: Mutex::new(state),
            recv_buf: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            read_closed: AtomicBool::new(false),
            recv_window: AtomicU32::new(INITIAL_WINDOW),
            consumed: AtomicU32::new(0),
            send_window: AtomicU32::new(INITIAL_WINDOW),
            writable: Notify::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, new: StreamState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = new;
    }

    /// Mark fully closed and wake anything blocked on this stream.
    pub fn force_close(&self) {
        self.set_state(StreamState::Closed);
        self.read_closed.store(true, Ordering::SeqCst);
        self.readable.notify_one();
        self.writable.notify_one();
    }

    /// The flag to piggyback on the next outbound frame, advancing the
    /// handshake state machine.
    pub fn piggyback_flags(&self) -> u16 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            StreamState::Inited => {
                *state = StreamState::SynSent;
                flags::SYN
            }
            StreamState::SynRecv => {
                *state = StreamState::Established;
                0
            }
            _ => 0,
        }
    }
}

/// Readable half of one yamux channel.
pub struct ChannelReader {
    pub(crate) entry: Arc<StreamEntry>,
    pub(crate) session: Arc<YamuxSession>,
}

#[async_trait]
impl ChunkRead for ChannelReader {
    async fn read_chunk(&mut self) -> Result<Vec<u8>, NetError> {
        loop {
            let taken: Vec<u8> = {
                let mut buf = self.entry.recv_buf.lock().unwrap_or_else(|e| e.into_inner());
                buf.drain(..).collect()
            };
            if !taken.is_empty() {
                self.session.on_consumed(&self.entry, taken.len() as u32).await?;
                return Ok(taken);
            }
            if self.entry.read_closed.load(Ordering::SeqCst) {
                return Err(NetError::Closed);
            }
            self.entry.readable.notified().await;
        }
    }
}

/// Writable half of one yamux channel.
pub struct ChannelWriter {
    pub(crate) entry: Arc<StreamEntry>,
    pub(crate) session: Arc<YamuxSession>,
}

#[async_trait]
impl ChunkWrite for ChannelWriter {
    async fn write_chunk(&mut self, buf: &[u8]) -> Result<(), NetError> {
        let mut offset = 0usize;
        while offset < buf.len() {
            match self.entry.state() {
                StreamState::Closed | StreamState::Closing => return Err(NetError::Closed),
                _ => {}
            }
            if self.session.is_closed() {
                return Err(NetError::Closed);
            }

            // Block until the remote grants credit; a stalled reader on the
            // other side legitimately pins this at zero.
            let available = self.entry.send_window.load(Ordering::SeqCst);
            if available == 0 {
                self.entry.writable.notified().await;
                continue;
            }

            let remaining = (buf.len() - offset) as u32;
            let take = remaining.min(available).min(MAX_DATA_FRAME);
            self.entry.send_window.fetch_sub(take, Ordering::SeqCst);

            let frame = Frame::data(self.entry.id, take, self.entry.piggyback_flags());
            let payload = &buf[offset..offset + take as usize];
            self.session
                .write_frame(frame, payload)
                .await
                .map_err(net_err)?;
            offset += take as usize;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), NetError> {
        self.session.close_stream(&self.entry).await.map_err(net_err)
    }
}

fn net_err(e: YamuxError) -> NetError {
    match e {
        YamuxError::Net(inner) => inner,
        YamuxError::SessionClosed => NetError::Closed,
        other => NetError::Protocol(other.to_string()),
    }
}
