use crate::core::{
    domain::SessionEvent,
    traits::{EventHandler, EventPublisher, HandlerResult},
};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{error, info, warn};

/// In-memory event publisher that records every event
pub struct InMemoryEventPublisher {
    event_log: Arc<RwLock<Vec<SessionEvent>>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self {
            event_log: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Get all events that have been published
    pub async fn get_events(&self) -> Vec<SessionEvent> {
        self.event_log.read().await.clone()
    }

    /// Clear the event log
    pub async fn clear_events(&self) {
        self.event_log.write().await.clear();
    }
}

impl Default for InMemoryEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: SessionEvent) {
        self.event_log.write().await.push(event);
    }
}

/// Event publisher that forwards into an unbounded channel
pub struct ChannelEventPublisher {
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelEventPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self { event_tx }, event_rx)
    }
}

#[async_trait]
impl EventPublisher for ChannelEventPublisher {
    async fn publish(&self, event: SessionEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("Event receiver dropped; discarding event");
        }
    }
}

/// Drain `event_rx`, handing every event to all handlers concurrently.
/// Returns once the channel is closed.
pub async fn dispatch_events(
    mut event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    handlers: Vec<Arc<dyn EventHandler>>,
) {
    while let Some(event) = event_rx.recv().await {
        let futures = handlers.iter().map(|h| {
            let ev = event.clone();
            async move { h.handle_event(ev).await }
        });
        let results = join_all(futures).await;
        for res in results {
            if let Err(e) = res {
                error!("Error in event handler: {}", e);
            }
        }
    }
}

/// Event handler for logging session events
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: SessionEvent) -> HandlerResult<()> {
        match &event {
            SessionEvent::PeerJoined {
                peer,
                addr,
                direction,
            } => {
                info!(peer = %peer, addr = %addr, ?direction, "Peer joined");
            }
            SessionEvent::PeerLeft { peer } => {
                info!(peer = %peer, "Peer left");
            }
            SessionEvent::ConnectionFailed { addr, reason } => {
                warn!(addr = %addr, "Connection failed: {}", reason);
            }
            SessionEvent::MessageReceived(message) => {
                info!(peer = %message.sender, "Message: {}", message.text);
            }
            SessionEvent::FileOffered {
                peer,
                transfer_id,
                filename,
                total_size,
            } => {
                info!(
                    peer = %peer,
                    transfer_id = %transfer_id,
                    "File offered: {} ({} bytes)",
                    filename,
                    total_size
                );
            }
            SessionEvent::FileReceived {
                peer,
                transfer_id,
                path,
            } => {
                info!(
                    peer = %peer,
                    transfer_id = %transfer_id,
                    "File received: {}",
                    path.display()
                );
            }
            SessionEvent::FileSent { peer, transfer_id } => {
                info!(peer = %peer, transfer_id = %transfer_id, "File sent");
            }
            SessionEvent::TransferProgress {
                transfer_id,
                progress,
                ..
            } => {
                tracing::debug!(
                    transfer_id = %transfer_id,
                    "Transfer progress: {:.2}%",
                    progress.percentage
                );
            }
            SessionEvent::TransferFailed {
                peer,
                transfer_id,
                reason,
            } => {
                error!(peer = %peer, transfer_id = %transfer_id, "Transfer failed: {}", reason);
            }
            SessionEvent::TransferCancelled { peer, transfer_id } => {
                info!(peer = %peer, transfer_id = %transfer_id, "Transfer cancelled");
            }
            SessionEvent::SharedFilesListed { peer, files } => {
                info!(peer = %peer, count = files.len(), "Shared listing received");
            }
        }
        Ok(())
    }
}
