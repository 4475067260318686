use async_trait::async_trait;
use std::error::Error;

use super::domain::SessionEvent;

/// Result type for event handler callbacks
pub type HandlerResult<T> = std::result::Result<T, Box<dyn Error + Send + Sync>>;

/// Event handler trait for session events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: SessionEvent) -> HandlerResult<()>;
}

/// Sink for events emitted by the core. Publishing never fails the caller;
/// a publisher whose consumer went away drops the event.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: SessionEvent);
}
