//! Point-to-point framed peer channel.
//!
//! Each connection owns a reader task and a writer task. The reader applies
//! an optional notification hook inline, routes answers to their registered
//! reply queues, and forwards everything else to the owning application's
//! event sink. A single task performs those steps in arrival order, so FIFO
//! delivery and notification-before-answer ordering hold per connection.

use crate::config::{DEFAULT_PING_DELAY, DEFAULT_PING_TIMEOUT};
use crate::error::{Error, Result};
use crate::net::codec::{self, HEADER_SIZE};
use crate::net::packet::{error_from_wire, ErrorCode, Packet, PacketKind};
use crate::types::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub type MsgId = u32;

/// What a waiter receives for one registered request.
#[derive(Clone, Debug)]
pub enum Reply {
    Packet(Packet),
    /// The connection closed before the answer arrived.
    Closed,
    /// The request timed out and was forgotten; a late answer is dropped.
    Forgotten,
}

#[derive(Clone, Debug)]
pub struct ReplyEnvelope {
    pub conn: Connection,
    pub msg_id: MsgId,
    pub reply: Reply,
}

pub type ReplyQueue = mpsc::UnboundedSender<ReplyEnvelope>;

/// Packets that are neither answers nor liveness, delivered to the
/// application owning the connection.
#[derive(Debug)]
pub enum ConnEvent {
    Packet {
        conn: Connection,
        msg_id: MsgId,
        packet: Packet,
    },
    Closed {
        conn: Connection,
    },
}

pub type EventSink = mpsc::UnboundedSender<ConnEvent>;

/// Inline hook for notifications, run on the reader task so they are
/// processed before any answer that follows them on the wire.
pub type NotificationHook = Arc<dyn Fn(&Connection, MsgId, Packet) + Send + Sync>;

/// Decides whether a request timeout is fatal. Returning `true` means the
/// timeout was handled (e.g. rearmed with a follow-up request); `false`
/// aborts the connection.
pub type TimeoutCallback = Box<dyn FnOnce(&Connection) -> bool + Send>;

#[derive(Clone)]
pub struct ConnectionOptions {
    pub ping_delay: Duration,
    pub ping_timeout: Duration,
    pub on_notification: Option<NotificationHook>,
}

impl Default for ConnectionOptions {
    fn default() -> ConnectionOptions {
        ConnectionOptions {
            ping_delay: DEFAULT_PING_DELAY,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            on_notification: None,
        }
    }
}

enum Slot {
    Queue(ReplyQueue),
    Forgotten,
}

#[derive(Default)]
struct PendingMap {
    closed: bool,
    slots: HashMap<MsgId, Slot>,
}

struct Inner {
    cid: u64,
    peer: SocketAddr,
    writer_tx: mpsc::UnboundedSender<(MsgId, Packet)>,
    next_msg_id: AtomicU32,
    pending: Mutex<PendingMap>,
    peer_node: Mutex<Option<NodeId>>,
    closed: AtomicBool,
    close_notify: Notify,
}

static NEXT_CID: AtomicU64 = AtomicU64::new(1);

/// Cloneable handle to one peer connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}({})", self.inner.cid, self.inner.peer)
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Connection) -> bool {
        self.inner.cid == other.inner.cid
    }
}
impl Eq for Connection {}

impl Connection {
    /// Wrap an established stream, spawning its reader and writer tasks.
    pub fn spawn(stream: TcpStream, sink: EventSink, opts: ConnectionOptions) -> Connection {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            cid: NEXT_CID.fetch_add(1, Ordering::Relaxed),
            peer,
            writer_tx,
            next_msg_id: AtomicU32::new(0),
            pending: Mutex::new(PendingMap::default()),
            peer_node: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        let conn = Connection {
            inner: inner.clone(),
        };
        tokio::spawn(writer_loop(inner, write_half, writer_rx));
        tokio::spawn(reader_loop(conn.clone(), read_half, sink, opts));
        conn
    }

    /// Open an outbound connection.
    pub async fn connect(
        addr: SocketAddr,
        sink: EventSink,
        opts: ConnectionOptions,
    ) -> Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Connection::spawn(stream, sink, opts))
    }

    pub fn cid(&self) -> u64 {
        self.inner.cid
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Identity of the peer once identification succeeded.
    pub fn peer_node(&self) -> Option<NodeId> {
        *self.inner.peer_node.lock().unwrap()
    }

    pub fn set_peer_node(&self, id: NodeId) {
        *self.inner.peer_node.lock().unwrap() = Some(id);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Shut the connection down. Pending requests receive a close sentinel.
    pub fn close(&self) {
        self.inner.close_notify.notify_waiters();
    }

    fn alloc_msg_id(&self) -> MsgId {
        // Wraps at 2^32.
        self.inner.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send_frame(&self, msg_id: MsgId, packet: Packet) -> Result<()> {
        self.inner
            .writer_tx
            .send((msg_id, packet))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Send a notification; the receiver must not reply.
    pub fn notify(&self, packet: Packet) -> MsgId {
        let msg_id = self.alloc_msg_id();
        let _ = self.send_frame(msg_id, packet);
        msg_id
    }

    /// Reply to a request.
    pub fn answer(&self, msg_id: MsgId, packet: Packet) {
        let _ = self.send_frame(msg_id, packet);
    }

    pub fn answer_error(&self, msg_id: MsgId, code: ErrorCode, message: impl Into<String>) {
        self.answer(msg_id, Packet::error(code, message));
    }

    /// Send a request whose answer will arrive on the event sink rather than
    /// a registered queue. Used between servers, where the application event
    /// loop correlates answers itself.
    pub fn send_request(&self, packet: Packet) -> MsgId {
        self.notify(packet)
    }

    /// Send a request and register `queue` to receive exactly one
    /// [`ReplyEnvelope`] for it.
    pub fn ask_queue(&self, packet: Packet, queue: &ReplyQueue) -> Result<MsgId> {
        let msg_id = self.alloc_msg_id();
        {
            let mut pending = self.inner.pending.lock().unwrap();
            if pending.closed {
                return Err(Error::ConnectionClosed);
            }
            pending.slots.insert(msg_id, Slot::Queue(queue.clone()));
        }
        if let Err(e) = self.send_frame(msg_id, packet) {
            self.inner.pending.lock().unwrap().slots.remove(&msg_id);
            return Err(e);
        }
        Ok(msg_id)
    }

    /// Like [`Connection::ask_queue`] with a per-request timeout. On expiry
    /// the request is forgotten (the waiter receives [`Reply::Forgotten`])
    /// and `on_timeout` decides whether the connection survives.
    pub fn ask_queue_with_timeout(
        &self,
        packet: Packet,
        queue: &ReplyQueue,
        timeout: Duration,
        on_timeout: Option<TimeoutCallback>,
    ) -> Result<MsgId> {
        let msg_id = self.ask_queue(packet, queue)?;
        let conn = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if conn.forget(msg_id) {
                warn!(conn = ?conn, msg_id, "request timed out");
                let survives = match on_timeout {
                    Some(cb) => cb(&conn),
                    None => false,
                };
                if !survives {
                    conn.close();
                }
            }
        });
        Ok(msg_id)
    }

    /// Stop expecting an answer for `msg_id`. The registered queue receives
    /// a [`Reply::Forgotten`] envelope so waiters keep exact accounting.
    /// Returns false if the answer already arrived.
    pub fn forget(&self, msg_id: MsgId) -> bool {
        let queue = {
            let mut pending = self.inner.pending.lock().unwrap();
            match pending.slots.get_mut(&msg_id) {
                Some(slot) if matches!(slot, Slot::Queue(_)) => {
                    match std::mem::replace(slot, Slot::Forgotten) {
                        Slot::Queue(queue) => queue,
                        Slot::Forgotten => unreachable!(),
                    }
                }
                _ => return false,
            }
        };
        let _ = queue.send(ReplyEnvelope {
            conn: self.clone(),
            msg_id,
            reply: Reply::Forgotten,
        });
        true
    }

    /// Send a request and wait for its answer. Wire errors other than `Ack`
    /// are converted to [`Error`].
    pub async fn ask(&self, packet: Packet) -> Result<Packet> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.ask_queue(packet, &tx)?;
        match rx.recv().await.map(|env| env.reply) {
            Some(Reply::Packet(Packet::Error { code, message })) => {
                match error_from_wire(code, &message) {
                    Some(err) => Err(err),
                    None => Ok(Packet::Error { code, message }),
                }
            }
            Some(Reply::Packet(packet)) => Ok(packet),
            Some(Reply::Closed) | Some(Reply::Forgotten) | None => Err(Error::ConnectionClosed),
        }
    }
}

/// Accept inbound connections forever, handing each to `sink`.
pub fn accept_loop(
    listener: TcpListener,
    sink: EventSink,
    opts: ConnectionOptions,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    Connection::spawn(stream, sink.clone(), opts.clone());
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    })
}

async fn writer_loop(
    inner: Arc<Inner>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<(MsgId, Packet)>,
) {
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some((msg_id, packet)) => {
                    if let Err(e) = codec::write_frame(&mut writer, msg_id, &packet).await {
                        debug!(peer = %inner.peer, error = %e, "write failed");
                        inner.close_notify.notify_waiters();
                        break;
                    }
                }
                None => break,
            },
            _ = inner.close_notify.notified() => break,
        }
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
}

/// Parse the frame length if `buf` holds a complete header, validating the
/// packet kind and its size cap before the payload is buffered.
fn complete_frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let raw_kind = u16::from_be_bytes(buf[4..6].try_into().unwrap());
    let length = u32::from_be_bytes(buf[6..10].try_into().unwrap()) as usize;
    let kind = PacketKind::from_u16(raw_kind)
        .ok_or_else(|| Error::Protocol(format!("unknown packet type {raw_kind:#06x}")))?;
    if length > kind.max_size() {
        return Err(Error::Protocol(format!(
            "{} payload of {length} bytes exceeds cap",
            kind.name()
        )));
    }
    if buf.len() < HEADER_SIZE + length {
        return Ok(None);
    }
    Ok(Some(HEADER_SIZE + length))
}

enum FrameOutcome {
    Other,
    Pong,
}

fn handle_frame(
    conn: &Connection,
    frame: codec::Frame,
    sink: &EventSink,
    opts: &ConnectionOptions,
) -> FrameOutcome {
    let codec::Frame { msg_id, packet } = frame;
    match packet {
        Packet::Ping => {
            conn.answer(msg_id, Packet::Pong);
            FrameOutcome::Other
        }
        Packet::Pong => FrameOutcome::Pong,
        packet => {
            let slot = if packet.kind().is_response() {
                conn.inner.pending.lock().unwrap().slots.remove(&msg_id)
            } else {
                None
            };
            match slot {
                Some(Slot::Queue(queue)) => {
                    let _ = queue.send(ReplyEnvelope {
                        conn: conn.clone(),
                        msg_id,
                        reply: Reply::Packet(packet),
                    });
                }
                Some(Slot::Forgotten) => {
                    debug!(conn = ?conn, msg_id, "dropping answer to forgotten request");
                }
                None => match &opts.on_notification {
                    Some(hook) => hook(conn, msg_id, packet),
                    None => {
                        let _ = sink.send(ConnEvent::Packet {
                            conn: conn.clone(),
                            msg_id,
                            packet,
                        });
                    }
                },
            }
            FrameOutcome::Other
        }
    }
}

async fn reader_loop(
    conn: Connection,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    sink: EventSink,
    opts: ConnectionOptions,
) {
    let inner = conn.inner.clone();
    let mut acc: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    let mut last_activity = Instant::now();
    let mut ping_sent_at: Option<Instant> = None;

    'outer: loop {
        // Drain complete frames before reading more bytes.
        loop {
            match complete_frame_len(&acc) {
                Ok(Some(len)) => {
                    let frame = match codec::decode(&acc[..len]) {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!(conn = ?conn, error = %e, "malformed packet");
                            conn.notify(Packet::error(ErrorCode::ProtocolError, e.to_string()));
                            break 'outer;
                        }
                    };
                    acc.drain(..len);
                    if let FrameOutcome::Pong = handle_frame(&conn, frame, &sink, &opts) {
                        ping_sent_at = None;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(conn = ?conn, error = %e, "malformed packet header");
                    conn.notify(Packet::error(ErrorCode::ProtocolError, e.to_string()));
                    break 'outer;
                }
            }
        }

        let soft_deadline = last_activity + opts.ping_delay;
        let hard_deadline = ping_sent_at.map(|at| at + opts.ping_timeout);
        tokio::select! {
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => {
                    acc.extend_from_slice(&chunk[..n]);
                    last_activity = Instant::now();
                }
                Err(e) => {
                    debug!(conn = ?conn, error = %e, "read failed");
                    break;
                }
            },
            _ = tokio::time::sleep_until(soft_deadline), if ping_sent_at.is_none() => {
                conn.notify(Packet::Ping);
                ping_sent_at = Some(Instant::now());
                last_activity = Instant::now();
            }
            _ = tokio::time::sleep_until(hard_deadline.unwrap_or_else(Instant::now)),
                if hard_deadline.is_some() =>
            {
                warn!(conn = ?conn, "peer unresponsive to ping, dropping");
                break;
            }
            _ = inner.close_notify.notified() => break,
        }
    }

    // Tear down: unblock every waiter deterministically, then tell the owner.
    let slots = {
        let mut pending = inner.pending.lock().unwrap();
        pending.closed = true;
        inner.closed.store(true, Ordering::Release);
        std::mem::take(&mut pending.slots)
    };
    inner.close_notify.notify_waiters();
    for (msg_id, slot) in slots {
        if let Slot::Queue(queue) = slot {
            let _ = queue.send(ReplyEnvelope {
                conn: conn.clone(),
                msg_id,
                reply: Reply::Closed,
            });
        }
    }
    let _ = sink.send(ConnEvent::Closed { conn: conn.clone() });
    debug!(conn = ?conn, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tid;

    async fn pair() -> (Connection, Connection, mpsc::UnboundedReceiver<ConnEvent>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server_sink, server_events) = mpsc::unbounded_channel();
        let (client_sink, _client_events) = mpsc::unbounded_channel();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Connection::spawn(stream, server_sink, ConnectionOptions::default())
        });
        let client = Connection::connect(addr, client_sink, ConnectionOptions::default())
            .await
            .unwrap();
        let server = accept.await.unwrap();
        (client, server, server_events)
    }

    #[tokio::test]
    async fn request_answer_correlation() {
        let (client, _server, mut events) = pair().await;
        let echo = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ConnEvent::Packet { conn, msg_id, packet } = event {
                    if packet == Packet::AskLastTransaction {
                        conn.answer(msg_id, Packet::AnswerLastTransaction { tid: Tid::new(42) });
                    }
                }
            }
        });
        let answer = client.ask(Packet::AskLastTransaction).await.unwrap();
        assert_eq!(answer, Packet::AnswerLastTransaction { tid: Tid::new(42) });
        echo.abort();
    }

    #[tokio::test]
    async fn close_posts_sentinel_to_waiters() {
        let (client, server, _events) = pair().await;
        let waiter = tokio::spawn(async move { client.ask(Packet::AskLastTransaction).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn forgotten_request_drops_late_answer() {
        let (client, _server, mut events) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let msg_id = client.ask_queue(Packet::AskLastTransaction, &tx).unwrap();
        assert!(client.forget(msg_id));
        let env = rx.recv().await.unwrap();
        assert!(matches!(env.reply, Reply::Forgotten));
        // The late answer must not reach the queue.
        if let Some(ConnEvent::Packet { conn, msg_id, .. }) = events.recv().await {
            conn.answer(msg_id, Packet::AnswerLastTransaction { tid: Tid::new(1) });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn request_timeout_forgets_and_aborts_by_default() {
        let (client, _server, _events) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        // The server never answers; with no callback the timeout is fatal.
        client
            .ask_queue_with_timeout(
                Packet::AskLastTransaction,
                &tx,
                Duration::from_millis(50),
                None,
            )
            .unwrap();
        let env = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(env.reply, Reply::Forgotten));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn timeout_callback_can_keep_the_connection() {
        let (client, _server, _events) = pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .ask_queue_with_timeout(
                Packet::AskLastTransaction,
                &tx,
                Duration::from_millis(50),
                Some(Box::new(|_conn| true)),
            )
            .unwrap();
        let env = rx.recv().await.unwrap();
        assert!(matches!(env.reply, Reply::Forgotten));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn wire_error_becomes_error() {
        let (client, _server, mut events) = pair().await;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ConnEvent::Packet { conn, msg_id, .. } = event {
                    conn.answer_error(msg_id, ErrorCode::OidNotFound, "nope");
                }
            }
        });
        let result = client.ask(Packet::AskLastTransaction).await;
        assert!(matches!(result, Err(Error::OidNotFound(_))));
    }

    #[tokio::test]
    async fn unresponsive_peer_is_dropped_after_ping_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // A raw socket that never answers pings.
        let _mute = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        });
        let (sink, mut events) = mpsc::unbounded_channel();
        let opts = ConnectionOptions {
            ping_delay: Duration::from_millis(50),
            ping_timeout: Duration::from_millis(50),
            on_notification: None,
        };
        let conn = Connection::connect(addr, sink, opts).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("liveness should drop the connection");
        assert!(matches!(event, Some(ConnEvent::Closed { .. })));
        assert!(conn.is_closed());
    }
}
