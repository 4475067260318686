#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use peerchat::core::EventPublisher;
use peerchat::protocol::{Decoded, FrameCodec, Message};
use peerchat::{ChannelEventPublisher, ChatSession, SessionConfig, SessionEvent};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// A running session with its own shared/downloads directories.
pub struct TestPeer {
    pub session: ChatSession,
    pub events: UnboundedReceiver<SessionEvent>,
    pub dir: TempDir,
}

impl TestPeer {
    pub async fn start(identity: &str) -> anyhow::Result<Self> {
        Self::start_with(identity, |_| {}).await
    }

    pub async fn start_with(
        identity: &str,
        tweak: impl FnOnce(&mut SessionConfig),
    ) -> anyhow::Result<Self> {
        Self::start_delayed(identity, tweak, |_| None).await
    }

    /// Start with a publisher that holds back events the way a slow
    /// consumer would.
    pub async fn start_delayed(
        identity: &str,
        tweak: impl FnOnce(&mut SessionConfig),
        delay: impl Fn(&SessionEvent) -> Option<Duration> + Send + Sync + 'static,
    ) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let shared = dir.path().join("shared");
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(&shared)?;
        std::fs::create_dir_all(&downloads)?;

        let mut config = SessionConfig::new(identity, "127.0.0.1", 0, shared, downloads);
        tweak(&mut config);

        let (inner, events) = ChannelEventPublisher::new();
        let publisher = DelayingPublisher {
            inner,
            delay: Box::new(delay),
        };
        let session = ChatSession::start(config, Arc::new(publisher)).await?;
        Ok(Self {
            session,
            events,
            dir,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.session.local_addr()
    }

    pub fn shared_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("shared")
    }

    pub fn downloads_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("downloads")
    }

    /// Dial `other` and wait until both sides report the peer as joined.
    pub async fn connect(&mut self, other: &mut TestPeer) -> anyhow::Result<()> {
        let addr = other.addr();
        self.session.connect_to("127.0.0.1", addr.port()).await?;
        let theirs = other.session.identity().clone();
        let ours = self.session.identity().clone();
        wait_for(&mut self.events, |e| {
            matches!(e, SessionEvent::PeerJoined { peer, .. } if *peer == theirs)
        })
        .await?;
        wait_for(&mut other.events, |e| {
            matches!(e, SessionEvent::PeerJoined { peer, .. } if *peer == ours)
        })
        .await?;
        Ok(())
    }

    pub async fn next_event(
        &mut self,
        pred: impl FnMut(&SessionEvent) -> bool,
    ) -> anyhow::Result<SessionEvent> {
        wait_for(&mut self.events, pred).await
    }
}

/// Forwards to a channel after an optional per-event pause.
pub struct DelayingPublisher {
    inner: ChannelEventPublisher,
    delay: Box<dyn Fn(&SessionEvent) -> Option<Duration> + Send + Sync>,
}

#[async_trait]
impl EventPublisher for DelayingPublisher {
    async fn publish(&self, event: SessionEvent) {
        if let Some(pause) = (self.delay)(&event) {
            tokio::time::sleep(pause).await;
        }
        self.inner.publish(event).await;
    }
}

/// Skip events until one matches, failing after `EVENT_TIMEOUT`.
pub async fn wait_for(
    events: &mut UnboundedReceiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> anyhow::Result<SessionEvent> {
    let search = async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Ok(event);
            }
        }
        Err(anyhow!("event channel closed"))
    };
    timeout(EVENT_TIMEOUT, search)
        .await
        .context("timed out waiting for event")?
}

/// Deterministic test content that is not a repeating single byte.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Hand-driven peer speaking the wire protocol directly.
pub struct RawPeer {
    stream: TcpStream,
    codec: FrameCodec,
}

impl RawPeer {
    /// Connect and complete the HELLO exchange as `identity`.
    pub async fn connect(addr: SocketAddr, identity: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut peer = Self {
            stream,
            codec: FrameCodec::new(peerchat::protocol::DEFAULT_MAX_FRAME_SIZE),
        };
        peer.send(&Message::hello(identity, None)).await?;
        match peer.recv().await? {
            Message::Hello(_) => Ok(peer),
            other => bail!("expected HELLO, got {:?}", other),
        }
    }

    /// Take the next dial on `listener` and answer it as `identity`.
    pub async fn accept(listener: &TcpListener, identity: &str) -> anyhow::Result<Self> {
        let (stream, _) = timeout(EVENT_TIMEOUT, listener.accept())
            .await
            .context("nobody dialed")??;
        let mut peer = Self {
            stream,
            codec: FrameCodec::new(peerchat::protocol::DEFAULT_MAX_FRAME_SIZE),
        };
        peer.send(&Message::hello(identity, None)).await?;
        match peer.recv().await? {
            Message::Hello(_) => Ok(peer),
            other => bail!("expected HELLO, got {:?}", other),
        }
    }

    pub async fn send(&mut self, message: &Message) -> anyhow::Result<()> {
        let bytes = self
            .codec
            .encode(message.message_type(), &message.encode_payload()?)?;
        self.send_raw(&bytes).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Next decoded message, skipping heartbeats.
    pub async fn recv(&mut self) -> anyhow::Result<Message> {
        loop {
            let message = timeout(EVENT_TIMEOUT, self.next_message())
                .await
                .context("timed out waiting for a frame")??;
            if !matches!(message, Message::Ping | Message::Pong) {
                return Ok(message);
            }
        }
    }

    async fn next_message(&mut self) -> anyhow::Result<Message> {
        let mut buf = [0u8; 8192];
        loop {
            if let Decoded::Frame(frame) = self.codec.decode()? {
                return Ok(Message::from_frame(&frame)?);
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                bail!("connection closed");
            }
            self.codec.extend(&buf[..n]);
        }
    }

    /// Wait until the remote side closes the socket.
    pub async fn closed(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; 8192];
        timeout(EVENT_TIMEOUT, async {
            loop {
                match self.stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await
        .context("connection stayed open")
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}
