use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::connection::ConnectionHandle;
use crate::core::{ConnectionId, ConnectionState, Direction, PeerIdentity, PeerInfo};
use crate::protocol::ProtocolError;

/// Outcome of registering a freshly handshaken connection
#[derive(Debug)]
pub enum Registration {
    Accepted,
    /// The new connection won a simultaneous-dial tie-break. The returned
    /// connection has already been asked to close.
    Replaced(ConnectionHandle),
    /// The new connection lost and must be closed by its owner.
    Rejected(ProtocolError),
}

/// Identity to connection map. At most one Active connection per identity.
pub struct PeerRegistry {
    local_identity: PeerIdentity,
    max_connections: usize,
    peers: RwLock<HashMap<PeerIdentity, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl PeerRegistry {
    pub fn new(local_identity: PeerIdentity, max_connections: usize) -> Self {
        Self {
            local_identity,
            max_connections,
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register `handle` and move it to Active on success.
    ///
    /// When the identity is already Active and the two connections were
    /// dialed in opposite directions, the one dialed by the lexicographically
    /// smaller identity wins. Any other duplicate is rejected.
    pub async fn register(&self, handle: &ConnectionHandle) -> Registration {
        let mut peers = self.peers.write().await;
        let identity = handle.identity();

        let outcome = match peers.get(identity) {
            Some(existing) if existing.is_active() => {
                let preferred = if self.local_identity < *identity {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                };
                if existing.direction() != handle.direction() && handle.direction() == preferred {
                    existing.close();
                    Registration::Replaced(existing.clone())
                } else {
                    Registration::Rejected(ProtocolError::DuplicateIdentity(identity.to_string()))
                }
            }
            _ => {
                let active = peers
                    .iter()
                    .filter(|(id, h)| *id != identity && h.is_active())
                    .count();
                if active >= self.max_connections {
                    Registration::Rejected(ProtocolError::TooManyPeers(self.max_connections))
                } else {
                    Registration::Accepted
                }
            }
        };

        if let Registration::Rejected(reason) = &outcome {
            warn!(peer = %identity, conn = %handle.id(), "Registration rejected: {}", reason);
            return outcome;
        }
        if !handle.advance(ConnectionState::Active) {
            return Registration::Rejected(ProtocolError::ClosedDuringHandshake);
        }
        debug!(peer = %identity, conn = %handle.id(), "Registered");
        peers.insert(identity.clone(), handle.clone());
        outcome
    }

    /// Remove `handle` if it is still the registered connection for its
    /// identity.
    pub async fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(handle.identity()) {
            Some(current) if current.id() == handle.id() => {
                peers.remove(handle.identity());
                debug!(peer = %handle.identity(), conn = %handle.id(), "Unregistered");
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, identity: &PeerIdentity) -> Option<ConnectionHandle> {
        let peers = self.peers.read().await;
        peers.get(identity).filter(|h| h.is_active()).cloned()
    }

    /// Identities of Active peers, sorted.
    pub async fn list_active(&self) -> Vec<PeerIdentity> {
        let peers = self.peers.read().await;
        let mut identities: Vec<PeerIdentity> = peers
            .values()
            .filter(|h| h.is_active())
            .map(|h| h.identity().clone())
            .collect();
        identities.sort();
        identities
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        let mut infos: Vec<PeerInfo> = peers
            .values()
            .filter(|h| h.is_active())
            .map(|h| h.info())
            .collect();
        infos.sort_by(|a, b| a.identity.cmp(&b.identity));
        infos
    }

    /// Every registered connection, Active or already closing.
    pub async fn handles(&self) -> Vec<ConnectionHandle> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
