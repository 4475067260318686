use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

/// Self-declared peer name exchanged in the handshake. Not verified.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerIdentity(pub String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<PeerIdentity> for String {
    fn from(peer: PeerIdentity) -> String {
        peer.0
    }
}

/// Strongly typed transfer identifier, generated by the sending side
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(pub String);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-local identifier of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side opened the transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Connection lifecycle. Variants are declared in lifecycle order so that
/// `Ord` matches the only permitted direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Transitions are monotonic; Handshaking may also jump straight to Closed.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        next > self
    }
}

/// Transfer direction relative to this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Transfer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Offered,
    Accepted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Transfer progress information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percentage: f32,
}

impl TransferProgress {
    pub fn new(bytes_transferred: u64, total_bytes: u64) -> Self {
        let percentage = if total_bytes > 0 {
            (bytes_transferred as f32 / total_bytes as f32) * 100.0
        } else {
            100.0
        };
        Self {
            bytes_transferred,
            total_bytes,
            percentage,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_transferred >= self.total_bytes
    }
}

/// A chat line received from a peer. Not stored by the core.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub sender: PeerIdentity,
    pub text: String,
    pub timestamp: SystemTime,
}

/// Presence metadata for an Active peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub identity: PeerIdentity,
    pub remote_addr: SocketAddr,
    pub direction: Direction,
    pub listen_port: Option<u16>,
    pub connected_at: SystemTime,
    pub last_activity: SystemTime,
}

/// A file offered from the shared area
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFile {
    pub name: String,
    pub size: u64,
}

/// Events emitted by the session towards its caller
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerJoined {
        peer: PeerIdentity,
        addr: SocketAddr,
        direction: Direction,
    },
    PeerLeft {
        peer: PeerIdentity,
    },
    /// A connection was closed before it ever became Active.
    ConnectionFailed {
        addr: SocketAddr,
        reason: String,
    },
    MessageReceived(ChatMessage),
    FileOffered {
        peer: PeerIdentity,
        transfer_id: TransferId,
        filename: String,
        total_size: u64,
    },
    FileReceived {
        peer: PeerIdentity,
        transfer_id: TransferId,
        path: PathBuf,
    },
    FileSent {
        peer: PeerIdentity,
        transfer_id: TransferId,
    },
    TransferProgress {
        transfer_id: TransferId,
        direction: TransferDirection,
        progress: TransferProgress,
    },
    TransferFailed {
        peer: PeerIdentity,
        transfer_id: TransferId,
        reason: String,
    },
    TransferCancelled {
        peer: PeerIdentity,
        transfer_id: TransferId,
    },
    /// Answer to `ChatSession::request_shared_files`.
    SharedFilesListed {
        peer: PeerIdentity,
        files: Vec<SharedFile>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_only_moves_forward() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Active));
        assert!(Handshaking.can_transition_to(Closed));
        assert!(Active.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(!Active.can_transition_to(Handshaking));
        assert!(!Closed.can_transition_to(Closing));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn progress_percentage() {
        let p = TransferProgress::new(50, 200);
        assert_eq!(p.percentage, 25.0);
        assert!(!p.is_complete());
        assert!(TransferProgress::new(0, 0).is_complete());
    }

    #[test]
    fn transfer_ids_are_unique() {
        assert_ne!(TransferId::new(), TransferId::new());
    }
}
