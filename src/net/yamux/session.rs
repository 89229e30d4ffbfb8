//! Yamux session: frame demultiplexing, stream lifecycle, keep-alive.
//!
//! A single reader task per session pulls frames off the secured stream and
//! routes them. Writers from any task contend on the session write lock,
//! which is held only while one frame goes out. Stream ids are odd when the
//! client opened them and even when the server did, for the whole session.

use super::frame::{flags, Frame, FrameType, GoAwayCode, HEADER_LEN};
use super::stream::{ChannelReader, ChannelWriter, StreamEntry, StreamState, INITIAL_WINDOW};
use super::YamuxError;
use crate::net::stream::{ChunkWrite, FrameReader, Stream};
use crate::net::NetError;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Idle sessions are pinged this often.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 15;

/// A ping with no ack for this long closes the session.
pub const PING_TIMEOUT_SECS: u64 = 30;

/// Capacity of the inbound stream queue and cap on live streams.
const ACCEPT_BACKLOG: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialing side: opens odd stream ids starting at 1.
    Client,
    /// Accepting side: opens even stream ids starting at 2.
    Server,
}

struct PingState {
    outstanding: Option<(u32, Instant)>,
}

pub struct YamuxSession {
    role: Role,
    writer: tokio::sync::Mutex<Box<dyn ChunkWrite>>,
    streams: Mutex<HashMap<u32, Arc<StreamEntry>>>,
    next_id: AtomicU32,
    closed: AtomicBool,
    accept_tx: Mutex<Option<mpsc::Sender<Stream>>>,
    ping: Mutex<PingState>,
}

impl YamuxSession {
    /// Take ownership of a secured stream and run a session over it. Returns
    /// the session handle and the queue of remotely-opened streams.
    pub fn start(stream: Stream, role: Role) -> (Arc<Self>, mpsc::Receiver<Stream>) {
        let (reader, writer) = stream.into_parts();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let session = Arc::new(Self {
            role,
            writer: tokio::sync::Mutex::new(writer),
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(match role {
                Role::Client => 1,
                Role::Server => 2,
            }),
            closed: AtomicBool::new(false),
            accept_tx: Mutex::new(Some(accept_tx)),
            ping: Mutex::new(PingState { outstanding: None }),
        });

        tokio::spawn(read_loop(session.clone(), reader));
        tokio::spawn(keepalive(session.clone()));
        (session, accept_rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Open a new outbound stream: allocate the next id of our parity and
    /// announce it with a SYN window update.
    pub async fn open_stream(self: &Arc<Self>) -> Result<Stream, YamuxError> {
        if self.is_closed() {
            return Err(YamuxError::SessionClosed);
        }
        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        let entry = Arc::new(StreamEntry::new(id, StreamState::Inited));
        {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            if streams.len() >= ACCEPT_BACKLOG {
                return Err(YamuxError::BacklogFull);
            }
            streams.insert(id, entry.clone());
        }
        let syn = Frame::window_update(id, 0, entry.piggyback_flags());
        self.write_frame(syn, &[]).await?;
        Ok(self.channel(entry))
    }

    /// Graceful local shutdown.
    pub async fn close(&self) {
        self.go_away(GoAwayCode::Normal).await;
        self.teardown();
    }

    fn channel(self: &Arc<Self>, entry: Arc<StreamEntry>) -> Stream {
        Stream::new(
            Box::new(ChannelReader { entry: entry.clone(), session: self.clone() }),
            Box::new(ChannelWriter { entry, session: self.clone() }),
        )
    }

    /// Serialize one frame (plus payload) under the session write lock.
    pub(crate) async fn write_frame(&self, frame: Frame, payload: &[u8]) -> Result<(), YamuxError> {
        if self.is_closed() && frame.frame_type != FrameType::GoAway {
            return Err(YamuxError::SessionClosed);
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&frame.encode());
        buf.extend_from_slice(payload);
        let mut writer = self.writer.lock().await;
        writer.write_chunk(&buf).await?;
        Ok(())
    }

    /// Consumer drained `n` bytes: replenish the remote's credit once half
    /// the window has been consumed.
    pub(crate) async fn on_consumed(&self, entry: &Arc<StreamEntry>, n: u32) -> Result<(), NetError> {
        let total = entry.consumed.fetch_add(n, Ordering::SeqCst) + n;
        if total < INITIAL_WINDOW / 2 {
            return Ok(());
        }
        if matches!(entry.state(), StreamState::Closed | StreamState::Closing) {
            return Ok(());
        }
        entry.consumed.store(0, Ordering::SeqCst);
        entry.recv_window.fetch_add(total, Ordering::SeqCst);
        let update = Frame::window_update(entry.id, total, entry.piggyback_flags());
        self.write_frame(update, &[]).await.map_err(|e| match e {
            YamuxError::Net(inner) => inner,
            other => NetError::Protocol(other.to_string()),
        })
    }

    /// Local half-close: send FIN once, transition per the state table.
    pub(crate) async fn close_stream(&self, entry: &Arc<StreamEntry>) -> Result<(), YamuxError> {
        let already_closed = {
            match entry.state() {
                StreamState::Closing => return Ok(()),
                StreamState::Closed => true,
                _ => false,
            }
        };
        if already_closed {
            // remote finished first; answer with our FIN and forget the stream
            self.remove_stream(entry.id);
        } else {
            entry.set_state(StreamState::Closing);
        }
        self.write_frame(Frame::window_update(entry.id, 0, flags::FIN), &[])
            .await
    }

    fn remove_stream(&self, id: u32) {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }

    async fn go_away(&self, code: GoAwayCode) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // closed is already set; write_frame lets go-away through
        if let Err(e) = self.write_frame(Frame::go_away(code), &[]).await {
            debug!("go-away write failed: {e}");
        }
    }

    /// Release every stream and wake all waiters. Idempotent.
    fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let entries: Vec<Arc<StreamEntry>> = {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            streams.drain().map(|(_, v)| v).collect()
        };
        for entry in entries {
            entry.force_close();
        }
        // closing the accept queue unblocks the swarm's accept loop
        self.accept_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame, payload: Vec<u8>) -> Result<(), YamuxError> {
        if frame.stream_id == 0 {
            return self.handle_session_frame(frame).await;
        }

        let existing = {
            self.streams
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&frame.stream_id)
                .cloned()
        };

        match existing {
            Some(entry) => self.handle_stream_frame(&entry, frame, payload).await,
            None => self.handle_unknown_stream(frame, payload).await,
        }
    }

    async fn handle_session_frame(self: &Arc<Self>, frame: Frame) -> Result<(), YamuxError> {
        match frame.frame_type {
            FrameType::Ping => {
                if frame.has_flag(flags::SYN) {
                    // echo the value back with ACK set
                    self.write_frame(Frame::ping(frame.length, flags::ACK), &[]).await
                } else if frame.has_flag(flags::ACK) {
                    let mut ping = self.ping.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some((value, sent)) = ping.outstanding {
                        if value == frame.length {
                            debug!("yamux pong after {:?}", sent.elapsed());
                            ping.outstanding = None;
                        }
                    }
                    Ok(())
                } else {
                    Err(YamuxError::Net(NetError::Protocol("ping without syn or ack".into())))
                }
            }
            FrameType::GoAway => Err(YamuxError::RemoteGoAway(frame.length)),
            // a FIN-flagged update on the session id is a polite hang-up
            FrameType::WindowUpdate if frame.has_flag(flags::FIN) => {
                Err(YamuxError::RemoteGoAway(GoAwayCode::Normal as u32))
            }
            _ => Err(YamuxError::Net(NetError::Protocol(format!(
                "unexpected session-level frame type {:?}",
                frame.frame_type
            )))),
        }
    }

    async fn handle_stream_frame(
        self: &Arc<Self>,
        entry: &Arc<StreamEntry>,
        frame: Frame,
        payload: Vec<u8>,
    ) -> Result<(), YamuxError> {
        if frame.has_flag(flags::RST) {
            entry.force_close();
            self.remove_stream(entry.id);
            return Ok(());
        }
        if frame.has_flag(flags::ACK) && entry.state() == StreamState::SynSent {
            entry.set_state(StreamState::Established);
        }

        match frame.frame_type {
            FrameType::WindowUpdate => {
                if frame.length > 0 {
                    entry.send_window.fetch_add(frame.length, Ordering::SeqCst);
                    entry.writable.notify_one();
                }
            }
            FrameType::Data => self.deliver(entry, frame.length, payload)?,
            _ => {
                return Err(YamuxError::Net(NetError::Protocol(format!(
                    "frame type {:?} on stream {}",
                    frame.frame_type, frame.stream_id
                ))))
            }
        }

        if frame.has_flag(flags::FIN) {
            let was_closing = entry.state() == StreamState::Closing;
            entry.force_close();
            if was_closing {
                // both FINs exchanged
                self.remove_stream(entry.id);
            }
        }
        Ok(())
    }

    async fn handle_unknown_stream(
        self: &Arc<Self>,
        frame: Frame,
        payload: Vec<u8>,
    ) -> Result<(), YamuxError> {
        if !frame.has_flag(flags::SYN) {
            if frame.has_flag(flags::FIN) || frame.has_flag(flags::RST) {
                // late close for a stream we already forgot
                return Ok(());
            }
            return Err(YamuxError::UnknownStream(frame.stream_id));
        }

        // remote-initiated ids must carry the remote's parity
        let expected_parity = match self.role {
            Role::Server => 1, // client opens odd
            Role::Client => 0,
        };
        if frame.stream_id % 2 != expected_parity {
            return Err(YamuxError::WrongParity(frame.stream_id));
        }

        let entry = Arc::new(StreamEntry::new(frame.stream_id, StreamState::SynRecv));
        let backlog_full = {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            let backlog_full = streams.len() >= ACCEPT_BACKLOG;
            if !backlog_full {
                streams.insert(frame.stream_id, entry.clone());
            }
            backlog_full
        };
        if backlog_full {
            warn!("yamux stream backlog full, resetting stream {}", frame.stream_id);
            return self
                .write_frame(Frame::window_update(frame.stream_id, 0, flags::RST), &[])
                .await;
        }

        self.write_frame(Frame::window_update(frame.stream_id, 0, flags::ACK), &[])
            .await?;

        if frame.frame_type == FrameType::Data {
            self.deliver(&entry, frame.length, payload)?;
        } else if frame.frame_type == FrameType::WindowUpdate && frame.length > 0 {
            entry.send_window.fetch_add(frame.length, Ordering::SeqCst);
        }
        if frame.has_flag(flags::FIN) {
            entry.force_close();
        }

        let channel = self.channel(entry);
        let tx = {
            self.accept_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        };
        if let Some(tx) = tx {
            if tx.try_send(channel).is_err() {
                warn!("inbound stream queue full, resetting stream {}", frame.stream_id);
                self.remove_stream(frame.stream_id);
                return self
                    .write_frame(Frame::window_update(frame.stream_id, 0, flags::RST), &[])
                    .await;
            }
        }
        Ok(())
    }

    fn deliver(&self, entry: &Arc<StreamEntry>, length: u32, payload: Vec<u8>) -> Result<(), YamuxError> {
        if length == 0 {
            return Ok(());
        }
        let window = entry.recv_window.load(Ordering::SeqCst);
        if length > window {
            return Err(YamuxError::WindowExceeded(entry.id));
        }
        entry.recv_window.fetch_sub(length, Ordering::SeqCst);
        {
            let mut buf = entry.recv_buf.lock().unwrap_or_else(|e| e.into_inner());
            buf.extend(payload);
        }
        entry.readable.notify_one();
        Ok(())
    }
}

/// The single per-session reader: demultiplexes until transport loss, remote
/// go-away, or a protocol violation (answered with our own go-away).
async fn read_loop(session: Arc<YamuxSession>, mut reader: FrameReader) {
    loop {
        let header = match reader.read_exact(HEADER_LEN).await {
            Ok(h) => h,
            Err(e) => {
                debug!("yamux transport ended: {e}");
                session.teardown();
                return;
            }
        };
        let frame = match Frame::decode(&header) {
            Ok(f) => f,
            Err(e) => {
                warn!("yamux framing violation: {e}");
                session.go_away(GoAwayCode::ProtocolError).await;
                session.teardown();
                return;
            }
        };

        let payload = if frame.frame_type == FrameType::Data && frame.length > 0 {
            if frame.length > INITIAL_WINDOW {
                warn!("yamux data frame of {} bytes exceeds any granted window", frame.length);
                session.go_away(GoAwayCode::ProtocolError).await;
                session.teardown();
                return;
            }
            match reader.read_exact(frame.length as usize).await {
                Ok(p) => p,
                Err(e) => {
                    debug!("yamux transport ended mid-frame: {e}");
                    session.teardown();
                    return;
                }
            }
        } else {
            Vec::new()
        };

        match session.handle_frame(frame, payload).await {
            Ok(()) => {}
            Err(YamuxError::RemoteGoAway(code)) => {
                debug!("remote closed session, code {code}");
                session.teardown();
                return;
            }
            Err(e) => {
                warn!("yamux protocol error: {e}");
                session.go_away(GoAwayCode::ProtocolError).await;
                session.teardown();
                return;
            }
        }
    }
}

/// Keep idle sessions alive; kill sessions whose remote stopped answering.
async fn keepalive(session: Arc<YamuxSession>) {
    let period = Duration::from_secs(KEEPALIVE_INTERVAL_SECS);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        if session.is_closed() {
            return;
        }

        let overdue = {
            let ping = session.ping.lock().unwrap_or_else(|e| e.into_inner());
            ping.outstanding
                .map(|(_, sent)| sent.elapsed() >= Duration::from_secs(PING_TIMEOUT_SECS))
                .unwrap_or(false)
        };
        if overdue {
            warn!("yamux keep-alive ping unanswered, closing session");
            session.go_away(GoAwayCode::Normal).await;
            session.teardown();
            return;
        }

        let value: u32 = rand::thread_rng().gen();
        {
            let mut ping = session.ping.lock().unwrap_or_else(|e| e.into_inner());
            if ping.outstanding.is_none() {
                ping.outstanding = Some((value, Instant::now()));
            } else {
                continue; // still waiting on the previous ping
            }
        }
        if session.write_frame(Frame::ping(value, flags::SYN), &[]).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::stream::testing::pair;

    /// A session on side A, raw frame access on side B.
    fn session_and_raw(role: Role) -> (Arc<YamuxSession>, mpsc::Receiver<Stream>, Stream) {
        let (a, b) = pair();
        let (session, accept_rx) = YamuxSession::start(a, role);
        (session, accept_rx, b)
    }

    async fn read_frame(raw: &mut Stream) -> (Frame, Vec<u8>) {
        let header = raw.read_exact(HEADER_LEN).await.unwrap();
        let frame = Frame::decode(&header).unwrap();
        let payload = if frame.frame_type == FrameType::Data && frame.length > 0 {
            raw.read_exact(frame.length as usize).await.unwrap()
        } else {
            Vec::new()
        };
        (frame, payload)
    }

    /// Skip keep-alive pings when driving one side by hand.
    async fn read_non_ping(raw: &mut Stream) -> (Frame, Vec<u8>) {
        loop {
            let (frame, payload) = read_frame(raw).await;
            if frame.frame_type != FrameType::Ping {
                return (frame, payload);
            }
        }
    }

    #[tokio::test]
    async fn client_ids_are_odd_and_increment_by_two() {
        let (session, _accept, mut raw) = session_and_raw(Role::Client);
        let _s1 = session.open_stream().await.unwrap();
        let _s2 = session.open_stream().await.unwrap();

        let (f1, _) = read_non_ping(&mut raw).await;
        let (f2, _) = read_non_ping(&mut raw).await;
        assert_eq!(f1.stream_id, 1);
        assert_eq!(f2.stream_id, 3);
        assert!(f1.has_flag(flags::SYN));
        assert!(f2.has_flag(flags::SYN));
    }

    #[tokio::test]
    async fn server_accepts_odd_inbound_streams() {
        let (_session, mut accept, mut raw) = session_and_raw(Role::Server);

        // remote client opens stream 1 and sends data
        raw.write(&Frame::window_update(1, 0, flags::SYN).encode()).await.unwrap();
        let mut data_frame = Frame::data(1, 5, 0).encode().to_vec();
        data_frame.extend_from_slice(b"hello");
        raw.write(&data_frame).await.unwrap();

        let mut inbound = accept.recv().await.expect("inbound stream");
        let got = inbound.read_any().await.unwrap();
        assert_eq!(got, b"hello");

        // the session acked the syn
        let (ack, _) = read_non_ping(&mut raw).await;
        assert_eq!(ack.frame_type, FrameType::WindowUpdate);
        assert!(ack.has_flag(flags::ACK));
        assert_eq!(ack.stream_id, 1);
    }

    #[tokio::test]
    async fn wrong_parity_syn_is_a_protocol_error() {
        let (session, _accept, mut raw) = session_and_raw(Role::Server);

        // a client may not open even ids
        raw.write(&Frame::window_update(2, 0, flags::SYN).encode()).await.unwrap();

        let (reply, _) = read_non_ping(&mut raw).await;
        assert_eq!(reply.frame_type, FrameType::GoAway);
        assert_eq!(reply.length, GoAwayCode::ProtocolError as u32);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn unknown_version_closes_with_go_away() {
        let (session, _accept, mut raw) = session_and_raw(Role::Server);

        let mut bad = Frame::window_update(1, 0, flags::SYN).encode();
        bad[0] = 9;
        raw.write(&bad).await.unwrap();

        let (reply, _) = read_non_ping(&mut raw).await;
        assert_eq!(reply.frame_type, FrameType::GoAway);
        assert_eq!(reply.length, GoAwayCode::ProtocolError as u32);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn ping_is_echoed_with_ack() {
        let (_session, _accept, mut raw) = session_and_raw(Role::Server);

        raw.write(&Frame::ping(0xfeed, flags::SYN).encode()).await.unwrap();
        loop {
            let (frame, _) = read_frame(&mut raw).await;
            if frame.frame_type == FrameType::Ping && frame.has_flag(flags::ACK) {
                assert_eq!(frame.length, 0xfeed);
                break;
            }
        }
    }

    #[tokio::test]
    async fn two_sessions_exchange_data_both_ways() {
        let (a, b) = pair();
        let (client, _client_accept) = YamuxSession::start(a, Role::Client);
        let (_server, mut server_accept) = YamuxSession::start(b, Role::Server);

        let mut outbound = client.open_stream().await.unwrap();
        outbound.write(b"request").await.unwrap();

        let mut inbound = server_accept.recv().await.unwrap();
        assert_eq!(inbound.read_any().await.unwrap(), b"request");
        inbound.write(b"response").await.unwrap();

        assert_eq!(outbound.read_any().await.unwrap(), b"response");
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let (a, b) = pair();
        let (client, _ca) = YamuxSession::start(a, Role::Client);
        let (_server, mut server_accept) = YamuxSession::start(b, Role::Server);

        let mut s1 = client.open_stream().await.unwrap();
        let mut s2 = client.open_stream().await.unwrap();

        // a big write on s2 must not leak into or stall s1
        let big: Vec<u8> = (0..100_000u32).map(|i| (i % 7) as u8).collect();
        let big_writer = {
            let big = big.clone();
            tokio::spawn(async move {
                s2.write(&big).await.unwrap();
            })
        };
        s1.write(b"tiny").await.unwrap();

        // streams are accepted in syn order: s1 first, s2 second
        let mut in1 = server_accept.recv().await.unwrap();
        let mut in2 = server_accept.recv().await.unwrap();

        assert_eq!(in1.read_any().await.unwrap(), b"tiny");

        let mut collected = Vec::with_capacity(big.len());
        while collected.len() < big.len() {
            collected.extend(in2.read_any().await.unwrap());
        }
        assert_eq!(collected, big);
        big_writer.await.unwrap();
    }

    #[tokio::test]
    async fn window_updates_let_large_transfers_finish() {
        let (a, b) = pair();
        let (client, _ca) = YamuxSession::start(a, Role::Client);
        let (_server, mut server_accept) = YamuxSession::start(b, Role::Server);

        let payload: Vec<u8> = (0..(INITIAL_WINDOW as usize * 3)).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let mut outbound = client.open_stream().await.unwrap();
        let writer = tokio::spawn(async move {
            outbound.write(&payload).await.unwrap();
            outbound
        });

        let mut inbound = server_accept.recv().await.unwrap();
        let mut collected = Vec::with_capacity(expected.len());
        while collected.len() < expected.len() {
            collected.extend(inbound.read_any().await.unwrap());
        }
        assert_eq!(collected, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn fin_ends_the_reader() {
        let (a, b) = pair();
        let (client, _ca) = YamuxSession::start(a, Role::Client);
        let (_server, mut server_accept) = YamuxSession::start(b, Role::Server);

        let mut outbound = client.open_stream().await.unwrap();
        outbound.write(b"last words").await.unwrap();
        outbound.close().await.unwrap();

        let mut inbound = server_accept.recv().await.unwrap();
        assert_eq!(inbound.read_any().await.unwrap(), b"last words");
        assert!(matches!(inbound.read_any().await, Err(NetError::Closed)));
    }
}
