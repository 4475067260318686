//! One task per transport connection: handshake, a serialized writer fed by a
//! bounded queue, and a read loop that hands decoded messages to the router.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::registry::{PeerRegistry, Registration};
use super::router::MessageRouter;
use crate::core::{
    ChatError, ConnectionId, ConnectionState, Direction, EventPublisher, PeerIdentity, PeerInfo,
    Result, SessionEvent,
};
use crate::file_transfer::FileTransferManager;
use crate::infrastructure::SessionConfig;
use crate::protocol::{
    Decoded, Frame, FrameCodec, Hello, Message, PROTOCOL_VERSION, ProtocolError, encode_frame,
};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Answer for whoever is waiting on an outbound dial.
pub type HandshakeReply = oneshot::Sender<Result<PeerIdentity>>;

/// An encoded frame waiting in a connection's outbound queue.
pub(crate) struct Outbound {
    pub(crate) bytes: Vec<u8>,
    /// Fired once the bytes have been handed to the transport.
    pub(crate) written: Option<oneshot::Sender<()>>,
}

/// Everything a connection task needs from the session.
pub struct ConnectionContext {
    pub config: Arc<SessionConfig>,
    pub local_identity: PeerIdentity,
    /// Port announced in our HELLO.
    pub listen_port: Option<u16>,
    pub registry: Arc<PeerRegistry>,
    pub router: MessageRouter,
    pub transfers: Arc<FileTransferManager>,
    pub publisher: Arc<dyn EventPublisher>,
    pub shutdown: watch::Receiver<bool>,
}

type SharedState = Arc<watch::Sender<ConnectionState>>;

fn advance(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    })
}

async fn reached(state: &mut watch::Receiver<ConnectionState>, at_least: ConnectionState) {
    let _ = state.wait_for(|s| *s >= at_least).await;
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the session is gone.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

struct HandleInner {
    id: ConnectionId,
    identity: PeerIdentity,
    direction: Direction,
    remote_addr: SocketAddr,
    listen_port: Option<u16>,
    connected_at: SystemTime,
    started: Instant,
    last_activity_ms: AtomicU64,
    left_announced: AtomicBool,
    max_frame_size: u32,
    outbound: mpsc::Sender<Outbound>,
    state: SharedState,
}

/// Cheaply cloneable reference to a handshaken connection. All writes go
/// through its outbound queue so frames never interleave.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("identity", &self.inner.identity)
            .field("direction", &self.inner.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    fn new(
        id: ConnectionId,
        hello: &Hello,
        direction: Direction,
        remote_addr: SocketAddr,
        max_frame_size: u32,
        outbound: mpsc::Sender<Outbound>,
        state: SharedState,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                identity: PeerIdentity::new(hello.identity.clone()),
                direction,
                remote_addr,
                listen_port: hello.listen_port,
                connected_at: SystemTime::now(),
                started: Instant::now(),
                last_activity_ms: AtomicU64::new(0),
                left_announced: AtomicBool::new(false),
                max_frame_size,
                outbound,
                state,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.inner.identity
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub(crate) fn advance(&self, next: ConnectionState) -> bool {
        advance(&self.inner.state, next)
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        let elapsed = self.inner.started.elapsed().as_millis() as u64;
        self.inner.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.inner.last_activity_ms.load(Ordering::Relaxed));
        self.inner.started.elapsed().saturating_sub(last)
    }

    pub fn info(&self) -> PeerInfo {
        let last = Duration::from_millis(self.inner.last_activity_ms.load(Ordering::Relaxed));
        PeerInfo {
            identity: self.inner.identity.clone(),
            remote_addr: self.inner.remote_addr,
            direction: self.inner.direction,
            listen_port: self.inner.listen_port,
            connected_at: self.inner.connected_at,
            last_activity: self.inner.connected_at + last,
        }
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        if self.state() >= ConnectionState::Closing {
            return Err(ChatError::ConnectionClosed);
        }
        let payload = message.encode_payload()?;
        let bytes = encode_frame(message.message_type(), &payload, self.inner.max_frame_size)
            .map_err(ProtocolError::from)?;
        Ok(bytes)
    }

    /// Queue a message, waiting for room in the outbound queue.
    pub async fn send(&self, message: Message) -> Result<()> {
        let bytes = self.encode(&message)?;
        self.inner
            .outbound
            .send(Outbound {
                bytes,
                written: None,
            })
            .await
            .map_err(|_| ChatError::ConnectionClosed)
    }

    /// Queue a message if there is room. Returns `false` when the queue is full.
    pub fn try_send(&self, message: Message) -> Result<bool> {
        let bytes = self.encode(&message)?;
        match self.inner.outbound.try_send(Outbound {
            bytes,
            written: None,
        }) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(ChatError::ConnectionClosed),
        }
    }

    /// Queue a message and wait until the writer has handed it to the
    /// transport.
    pub async fn send_and_wait(&self, message: Message) -> Result<()> {
        let bytes = self.encode(&message)?;
        let (written_tx, written_rx) = oneshot::channel();
        self.inner
            .outbound
            .send(Outbound {
                bytes,
                written: Some(written_tx),
            })
            .await
            .map_err(|_| ChatError::ConnectionClosed)?;
        written_rx.await.map_err(|_| ChatError::ConnectionClosed)
    }

    /// Ask the connection task to close. Pending writes are abandoned.
    pub fn close(&self) {
        self.advance(ConnectionState::Closing);
    }

    /// True for the first caller only.
    fn claim_departure(&self) -> bool {
        !self.inner.left_announced.swap(true, Ordering::AcqRel)
    }

    /// Resolves once the connection task has fully torn down.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        reached(&mut state, ConnectionState::Closed).await;
    }
}

#[cfg(test)]
pub(crate) fn test_handle(
    id: u64,
    identity: &str,
    direction: Direction,
) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
    let (outbound, queue) = mpsc::channel(16);
    let (state, _) = watch::channel(ConnectionState::Handshaking);
    let hello = Hello {
        identity: identity.to_string(),
        protocol_version: PROTOCOL_VERSION,
        listen_port: None,
    };
    let handle = ConnectionHandle::new(
        ConnectionId(id),
        &hello,
        direction,
        SocketAddr::from(([127, 0, 0, 1], 40_000 + id as u16)),
        crate::protocol::DEFAULT_MAX_FRAME_SIZE,
        outbound,
        Arc::new(state),
    );
    (handle, queue)
}

/// Drive one connection from handshake to teardown.
pub async fn run_connection(
    ctx: Arc<ConnectionContext>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    direction: Direction,
    reply: Option<HandshakeReply>,
) {
    let id = ctx.registry.next_connection_id();
    let (state_tx, _state_rx) = watch::channel(ConnectionState::Connecting);
    let state: SharedState = Arc::new(state_tx);
    advance(&state, ConnectionState::Handshaking);
    debug!(conn = %id, addr = %remote_addr, ?direction, "Handshaking");

    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn = %id, "set_nodelay failed: {}", e);
    }
    let (mut reader, mut writer) = stream.into_split();
    let mut codec = FrameCodec::new(ctx.config.network.max_frame_size);
    let mut shutdown = ctx.shutdown.clone();

    let hello = match handshake(&ctx, &mut reader, &mut writer, &mut codec, &mut shutdown).await {
        Ok(hello) => hello,
        Err(err) => {
            drop((reader, writer));
            fail_before_active(&ctx, &state, id, remote_addr, err, reply).await;
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(ctx.config.network.outbound_queue_capacity);
    let handle = ConnectionHandle::new(
        id,
        &hello,
        direction,
        remote_addr,
        ctx.config.network.max_frame_size,
        outbound_tx,
        state.clone(),
    );
    handle.touch();

    match ctx.registry.register(&handle).await {
        Registration::Accepted => {}
        Registration::Replaced(previous) => {
            info!(
                peer = %handle.identity(),
                kept = %id,
                dropped = %previous.id(),
                "Resolved simultaneous connections"
            );
            let _ = time::timeout(ctx.config.network.shutdown_timeout(), previous.closed()).await;
        }
        Registration::Rejected(err) => {
            drop((reader, writer));
            fail_before_active(&ctx, &state, id, remote_addr, err.into(), reply).await;
            return;
        }
    }

    info!(peer = %handle.identity(), conn = %id, addr = %remote_addr, ?direction, "Peer connected");
    ctx.publisher
        .publish(SessionEvent::PeerJoined {
            peer: handle.identity().clone(),
            addr: remote_addr,
            direction,
        })
        .await;
    if let Some(reply) = reply {
        let _ = reply.send(Ok(handle.identity().clone()));
    }

    let writer_task = tokio::spawn(write_loop(writer, outbound_rx, state.clone(), id));
    let reason = read_loop(&ctx, &handle, &mut reader, &mut codec, shutdown).await;

    advance(&state, ConnectionState::Closing);
    let _ = writer_task.await;
    drop(reader);
    release_connection(&ctx, &handle, &reason).await;
}

/// Final teardown of an Active connection: fail its transfers, announce
/// `PeerLeft` once, leave the registry, then reach Closed. Also used by the
/// session for connection tasks it had to abort.
pub(crate) async fn release_connection(
    ctx: &ConnectionContext,
    handle: &ConnectionHandle,
    reason: &str,
) {
    handle.close();
    ctx.transfers.on_connection_lost(handle.id()).await;
    if handle.claim_departure() {
        info!(peer = %handle.identity(), conn = %handle.id(), "Peer disconnected: {}", reason);
        ctx.publisher
            .publish(SessionEvent::PeerLeft {
                peer: handle.identity().clone(),
            })
            .await;
    }
    ctx.registry.unregister(handle).await;
    handle.advance(ConnectionState::Closed);
}

async fn fail_before_active(
    ctx: &ConnectionContext,
    state: &watch::Sender<ConnectionState>,
    id: ConnectionId,
    addr: SocketAddr,
    err: ChatError,
    reply: Option<HandshakeReply>,
) {
    advance(state, ConnectionState::Closed);
    let reason = err.to_string();
    warn!(conn = %id, addr = %addr, "Connection failed: {}", reason);
    if let Some(reply) = reply {
        let _ = reply.send(Err(err));
    }
    ctx.publisher
        .publish(SessionEvent::ConnectionFailed { addr, reason })
        .await;
}

async fn handshake(
    ctx: &ConnectionContext,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    codec: &mut FrameCodec,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Hello> {
    let hello = Message::hello(ctx.local_identity.as_str(), ctx.listen_port);
    let bytes = codec
        .encode(hello.message_type(), &hello.encode_payload()?)
        .map_err(ProtocolError::from)?;

    let exchange = exchange_hello(reader, writer, codec, &bytes);
    let frame = tokio::select! {
        result = time::timeout(ctx.config.network.handshake_timeout(), exchange) => {
            result.map_err(|_| ProtocolError::HandshakeTimeout)??
        }
        _ = shutdown_requested(shutdown) => return Err(ChatError::ShuttingDown),
    };

    let hello = match Message::from_frame(&frame)? {
        Message::Hello(hello) => hello,
        other => return Err(ProtocolError::UnexpectedFrame(other.message_type()).into()),
    };
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(hello.protocol_version).into());
    }
    if hello.identity.trim().is_empty() || hello.identity == ctx.local_identity.as_str() {
        return Err(ProtocolError::InvalidIdentity(hello.identity).into());
    }
    Ok(hello)
}

/// Write our HELLO, then wait for the peer's first frame. Bytes after that
/// frame stay buffered in `codec`.
async fn exchange_hello(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    codec: &mut FrameCodec,
    hello: &[u8],
) -> Result<Frame> {
    writer.write_all(hello).await?;
    let mut buf = [0u8; 4096];
    loop {
        if let Decoded::Frame(frame) = codec.decode().map_err(ProtocolError::from)? {
            return Ok(frame);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(ProtocolError::ClosedDuringHandshake.into());
        }
        codec.extend(&buf[..n]);
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Outbound>,
    state: SharedState,
    id: ConnectionId,
) {
    let mut state_rx = state.subscribe();
    loop {
        let next = tokio::select! {
            biased;
            _ = reached(&mut state_rx, ConnectionState::Closing) => break,
            next = queue.recv() => next,
        };
        let Some(outbound) = next else { break };
        let written = tokio::select! {
            biased;
            _ = reached(&mut state_rx, ConnectionState::Closing) => break,
            written = writer.write_all(&outbound.bytes) => written,
        };
        match written {
            Ok(()) => {
                if let Some(done) = outbound.written {
                    let _ = done.send(());
                }
            }
            Err(e) => {
                debug!(conn = %id, "Write failed: {}", e);
                advance(&state, ConnectionState::Closing);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    ctx: &ConnectionContext,
    handle: &ConnectionHandle,
    reader: &mut OwnedReadHalf,
    codec: &mut FrameCodec,
    mut shutdown: watch::Receiver<bool>,
) -> String {
    let heartbeat_interval = ctx.config.network.heartbeat_interval();
    let liveness_timeout = ctx.config.network.liveness_timeout();
    let tick = (heartbeat_interval / 2).max(Duration::from_millis(10));
    let mut heartbeat = time::interval_at(time::Instant::now() + tick, tick);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state = handle.inner.state.subscribe();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    // Frames may have arrived in the same segment as the HELLO.
    if let Err(reason) = drain_frames(ctx, handle, codec).await {
        return reason;
    }

    loop {
        tokio::select! {
            _ = reached(&mut state, ConnectionState::Closing) => return "closed locally".into(),
            _ = shutdown_requested(&mut shutdown) => return "session shutting down".into(),
            read = reader.read(&mut buf) => match read {
                Ok(0) => return "closed by peer".into(),
                Ok(n) => {
                    codec.extend(&buf[..n]);
                    if let Err(reason) = drain_frames(ctx, handle, codec).await {
                        return reason;
                    }
                }
                Err(e) => return format!("read failed: {}", e),
            },
            _ = heartbeat.tick() => {
                let idle = handle.idle_for();
                if idle >= liveness_timeout {
                    warn!(peer = %handle.identity(), "No traffic for {:?}", idle);
                    return "liveness timeout".into();
                }
                if idle >= heartbeat_interval {
                    match handle.try_send(Message::Ping) {
                        Ok(true) => debug!(peer = %handle.identity(), "Sent PING"),
                        Ok(false) => {
                            debug!(peer = %handle.identity(), "Outbound queue full, PING skipped")
                        }
                        Err(_) => return "closed locally".into(),
                    }
                }
            }
        }
    }
}

/// Dispatch every complete frame in the codec. `Err` carries the reason the
/// connection must close.
async fn drain_frames(
    ctx: &ConnectionContext,
    handle: &ConnectionHandle,
    codec: &mut FrameCodec,
) -> std::result::Result<(), String> {
    loop {
        match codec.decode() {
            Ok(Decoded::NeedMoreData) => return Ok(()),
            Ok(Decoded::Frame(frame)) => {
                handle.touch();
                match Message::from_frame(&frame) {
                    Ok(message) => ctx.router.dispatch(handle, message).await,
                    Err(err) => {
                        warn!(
                            peer = %handle.identity(),
                            kind = ?frame.kind,
                            "Malformed payload: {}",
                            err
                        );
                        return Err(format!("protocol error: {}", err));
                    }
                }
            }
            Err(err) if err.is_aligned() => {
                handle.touch();
                debug!(peer = %handle.identity(), "Ignoring frame: {}", err);
            }
            Err(err) => {
                warn!(peer = %handle.identity(), "Corrupt frame: {}", err);
                return Err(format!("protocol error: {}", err));
            }
        }
    }
}
