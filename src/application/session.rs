use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, info, warn};

use crate::core::{
    ChatError, Direction, EventPublisher, PeerIdentity, PeerInfo, Result, SharedFile, TransferId,
};
use crate::file_transfer::{FileTransfer, FileTransferManager};
use crate::infrastructure::SessionConfig;
use crate::network::connection::release_connection;
use crate::network::{ConnectionContext, MessageRouter, PeerRegistry, run_connection};
use crate::protocol::Message;

/// Top-level facade: owns the listener, every connection task and the
/// transfer manager.
pub struct ChatSession {
    config: Arc<SessionConfig>,
    identity: PeerIdentity,
    local_addr: SocketAddr,
    ctx: Arc<ConnectionContext>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    /// Validate the configuration, bind the listener and start accepting.
    pub async fn start(config: SessionConfig, publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        config.validate()?;
        config.validate_directories()?;

        let listen_addr = config.listen_addr();
        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| ChatError::Config(format!("cannot bind {}: {}", listen_addr, e)))?;
        let local_addr = listener.local_addr()?;

        let config = Arc::new(config);
        let identity = PeerIdentity::new(config.identity.clone());
        let registry = Arc::new(PeerRegistry::new(
            identity.clone(),
            config.network.max_connections,
        ));
        let transfers = Arc::new(FileTransferManager::new(config.clone(), publisher.clone()));
        let router = MessageRouter::new(transfers.clone(), publisher.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(ConnectionContext {
            config: config.clone(),
            local_identity: identity.clone(),
            listen_port: Some(local_addr.port()),
            registry,
            router,
            transfers,
            publisher,
            shutdown: shutdown_rx,
        });

        let tasks = Arc::new(Mutex::new(JoinSet::new()));
        let accept_task = tokio::spawn(accept_loop(listener, ctx.clone(), tasks.clone()));
        info!(peer = %identity, addr = %local_addr, "Listening");

        Ok(Self {
            config,
            identity,
            local_addr,
            ctx,
            shutdown_tx,
            tasks,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(ChatError::ShuttingDown);
        }
        Ok(())
    }

    /// Dial a peer and wait for the handshake to settle.
    pub async fn connect_to(&self, host: &str, port: u16) -> Result<PeerIdentity> {
        self.ensure_running()?;
        let stream = tokio::net::TcpStream::connect((host, port)).await?;
        let remote_addr = stream.peer_addr()?;
        debug!(addr = %remote_addr, "Dialed");

        let (reply_tx, reply_rx) = oneshot::channel();
        let ctx = self.ctx.clone();
        {
            let mut tasks = self.tasks.lock().await;
            while tasks.try_join_next().is_some() {}
            tasks.spawn(run_connection(
                ctx,
                stream,
                remote_addr,
                Direction::Outbound,
                Some(reply_tx),
            ));
        }
        reply_rx.await.map_err(|_| ChatError::ConnectionClosed)?
    }

    pub async fn send_message(&self, peer: &PeerIdentity, text: &str) -> Result<()> {
        self.ensure_running()?;
        let conn = self
            .ctx
            .registry
            .lookup(peer)
            .await
            .ok_or_else(|| ChatError::PeerNotFound(peer.clone()))?;
        conn.send(Message::Chat {
            text: text.to_string(),
        })
        .await
    }

    /// Send `text` to every Active peer. Returns how many peers it was
    /// queued for.
    pub async fn broadcast(&self, text: &str) -> Result<usize> {
        self.ensure_running()?;
        let mut delivered = 0;
        for conn in self.ctx.registry.handles().await {
            if !conn.is_active() {
                continue;
            }
            let message = Message::Chat {
                text: text.to_string(),
            };
            match conn.send(message).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer = %conn.identity(), "Broadcast skipped peer: {}", e),
            }
        }
        Ok(delivered)
    }

    /// Offer a file to `peer`. A bare name is looked up in the shared
    /// directory.
    pub async fn send_file(
        &self,
        peer: &PeerIdentity,
        path: impl AsRef<Path>,
    ) -> Result<TransferId> {
        self.ensure_running()?;
        let conn = self
            .ctx
            .registry
            .lookup(peer)
            .await
            .ok_or_else(|| ChatError::PeerNotFound(peer.clone()))?;
        self.ctx.transfers.send_file(conn, path.as_ref()).await
    }

    pub async fn accept_file(&self, transfer_id: &TransferId) -> Result<()> {
        Ok(self.ctx.transfers.accept(transfer_id).await?)
    }

    pub async fn reject_file(&self, transfer_id: &TransferId) -> Result<()> {
        Ok(self.ctx.transfers.reject(transfer_id).await?)
    }

    pub async fn cancel_transfer(&self, transfer_id: &TransferId) -> Result<()> {
        Ok(self.ctx.transfers.cancel(transfer_id).await?)
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.ctx.registry.peers().await
    }

    pub async fn transfers(&self) -> Vec<FileTransfer> {
        self.ctx.transfers.active_transfers().await
    }

    pub async fn shared_files(&self) -> Result<Vec<SharedFile>> {
        self.ctx.transfers.list_shared_files().await
    }

    /// Ask `peer` for its shared listing. The answer arrives as
    /// `SessionEvent::SharedFilesListed`.
    pub async fn request_shared_files(&self, peer: &PeerIdentity) -> Result<()> {
        self.ensure_running()?;
        let conn = self
            .ctx
            .registry
            .lookup(peer)
            .await
            .ok_or_else(|| ChatError::PeerNotFound(peer.clone()))?;
        conn.send(Message::SharedListRequest).await
    }

    /// Stop accepting, close every connection and wait for them to reach
    /// Closed. Stragglers are aborted after the shutdown timeout.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            debug!("Shutdown already requested");
        }
        if let Some(accept_task) = self.accept_task.lock().await.take() {
            let _ = accept_task.await;
        }
        for conn in self.ctx.registry.handles().await {
            conn.close();
        }

        let mut tasks = self.tasks.lock().await;
        let drained = time::timeout(self.config.network.shutdown_timeout(), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Connections did not close in time, aborting them");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            // Aborted tasks never reached their own teardown.
            for conn in self.ctx.registry.handles().await {
                release_connection(&self.ctx, &conn, "aborted at shutdown").await;
            }
        }
        info!(peer = %self.identity, "Session stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    tasks: Arc<Mutex<JoinSet<()>>>,
) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        let accepted = tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote_addr)) => {
                debug!(addr = %remote_addr, "Accepted connection");
                let mut tasks = tasks.lock().await;
                while tasks.try_join_next().is_some() {}
                tasks.spawn(run_connection(
                    ctx.clone(),
                    stream,
                    remote_addr,
                    Direction::Inbound,
                    None,
                ));
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Listener closed");
}
