pub mod connection;
pub mod registry;
pub mod router;

pub use connection::{ConnectionContext, ConnectionHandle, HandshakeReply, run_connection};
pub use registry::{PeerRegistry, Registration};
pub use router::MessageRouter;
