pub mod application;
pub mod core;
pub mod file_transfer;
pub mod infrastructure;
pub mod network;
pub mod protocol;
pub mod utils;

// Re-export the session surface for binaries and integration tests
pub use crate::application::ChatSession;
pub use crate::core::{ChatError, PeerIdentity, Result, SessionEvent, TransferId};
pub use crate::infrastructure::{
    ChannelEventPublisher, InMemoryEventPublisher, LoggingEventHandler, SessionConfig,
    dispatch_events,
};
