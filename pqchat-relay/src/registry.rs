//! Connection registry: the authoritative map from live WebSocket
//! connections to client records.
//!
//! Each open connection gets a process-unique [`ConnId`] when it arrives and
//! an entry holding its outbound channel sender and liveness state. A client
//! record is attached on registration and mutated on room join/leave. All
//! routing by client id goes through this registry, never through raw
//! connection handles, so a stale id simply resolves to nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;

/// Process-unique identifier for one WebSocket connection.
pub type ConnId = u64;

/// Length of server-generated client ids.
const GENERATED_ID_LEN: usize = 8;

/// Identity of one registered participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    /// Client-chosen or server-generated identifier.
    pub id: String,
    /// Opaque public key material, re-broadcast verbatim to room peers.
    pub public_key: Vec<u8>,
    /// Room this client is currently in, if any.
    pub current_room: Option<String>,
}

/// Liveness state of one connection.
///
/// `Responsive` means the last probe (if any) was answered. `Awaiting` means
/// a probe is outstanding since the recorded instant; the liveness monitor
/// evicts connections whose probe has gone unanswered for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// No probe outstanding.
    Responsive,
    /// A probe was sent and has not been answered yet.
    Awaiting {
        /// When the outstanding probe was sent.
        since: Instant,
    },
}

/// Per-connection registry entry.
#[derive(Debug)]
pub struct ConnectionEntry {
    /// Channel feeding this connection's WebSocket writer task.
    pub sender: mpsc::UnboundedSender<Message>,
    /// Client record, present once the connection has registered.
    pub record: Option<ClientRecord>,
    /// Liveness state.
    pub probe: ProbeState,
}

/// Registry of all open connections, keyed by [`ConnId`].
///
/// Thread-safe via [`RwLock`]. Duplicate client ids across connections are
/// tolerated; id lookups return the first match.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnId, ConnectionEntry>>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Creates a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Tracks a newly opened connection, before any registration frame.
    ///
    /// Liveness monitoring covers the connection from this point on.
    pub async fn connect(&self, sender: mpsc::UnboundedSender<Message>) -> ConnId {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut conns = self.connections.write().await;
        conns.insert(
            conn_id,
            ConnectionEntry {
                sender,
                record: None,
                probe: ProbeState::Responsive,
            },
        );
        conn_id
    }

    /// Registers a connection under a client id, creating or overwriting its
    /// record.
    ///
    /// Uses `requested_id` verbatim when it is a non-empty string, otherwise
    /// synthesizes a short random id. No collision detection against other
    /// connections: a later registration with the same id simply creates a
    /// second independent record.
    ///
    /// Returns the resolved id, or `None` if the connection is already gone.
    pub async fn register(
        &self,
        conn_id: ConnId,
        requested_id: Option<String>,
        public_key: Vec<u8>,
    ) -> Option<String> {
        let mut conns = self.connections.write().await;
        let entry = conns.get_mut(&conn_id)?;
        let id = requested_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_client_id);
        entry.record = Some(ClientRecord {
            id: id.clone(),
            public_key,
            current_room: None,
        });
        Some(id)
    }

    /// Returns a snapshot of the client record for a connection, if
    /// registered.
    pub async fn record(&self, conn_id: ConnId) -> Option<ClientRecord> {
        let conns = self.connections.read().await;
        conns.get(&conn_id).and_then(|e| e.record.clone())
    }

    /// Updates the current room of a registered connection.
    pub async fn set_room(&self, conn_id: ConnId, room_id: Option<String>) {
        let mut conns = self.connections.write().await;
        if let Some(record) = conns.get_mut(&conn_id).and_then(|e| e.record.as_mut()) {
            record.current_room = room_id;
        }
    }

    /// Returns the outbound sender for a connection, if still open.
    pub async fn sender_for_conn(&self, conn_id: ConnId) -> Option<mpsc::UnboundedSender<Message>> {
        let conns = self.connections.read().await;
        conns.get(&conn_id).map(|e| e.sender.clone())
    }

    /// Resolves a client id to an outbound sender by scanning all records.
    ///
    /// First match wins when ids are duplicated; unknown ids resolve to
    /// `None` so routing can silently no-op.
    pub async fn sender_for_id(&self, client_id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        let conns = self.connections.read().await;
        conns
            .values()
            .find(|e| e.record.as_ref().is_some_and(|r| r.id == client_id))
            .map(|e| e.sender.clone())
    }

    /// Resolves each id to its public key material, omitting ids with no
    /// live record.
    ///
    /// Used to build `room_joined` member lists; a member id whose record
    /// vanished mid-flight is simply left out.
    pub async fn public_keys_for(&self, ids: &[String]) -> Vec<(String, Vec<u8>)> {
        let conns = self.connections.read().await;
        ids.iter()
            .filter_map(|id| {
                conns
                    .values()
                    .find_map(|e| e.record.as_ref().filter(|r| &r.id == id))
                    .map(|r| (r.id.clone(), r.public_key.clone()))
            })
            .collect()
    }

    /// Returns senders for every open connection whose record places it in
    /// the given room, excluding at most one connection.
    ///
    /// Connection-driven scan: broadcasts built from this list can never
    /// target a closed connection, even when the room's member set is stale.
    pub async fn senders_in_room(
        &self,
        room_id: &str,
        exclude: Option<ConnId>,
    ) -> Vec<mpsc::UnboundedSender<Message>> {
        let conns = self.connections.read().await;
        conns
            .iter()
            .filter(|(conn_id, entry)| {
                Some(**conn_id) != exclude
                    && entry
                        .record
                        .as_ref()
                        .is_some_and(|r| r.current_room.as_deref() == Some(room_id))
            })
            .map(|(_, entry)| entry.sender.clone())
            .collect()
    }

    /// Removes a connection, returning its entry if it was still present.
    ///
    /// Callers are responsible for room-membership cleanup and the departure
    /// broadcast.
    pub async fn remove(&self, conn_id: ConnId) -> Option<ConnectionEntry> {
        let mut conns = self.connections.write().await;
        conns.remove(&conn_id)
    }

    /// Clears the awaiting-probe flag for a connection (probe answered).
    pub async fn mark_responsive(&self, conn_id: ConnId) {
        let mut conns = self.connections.write().await;
        if let Some(entry) = conns.get_mut(&conn_id) {
            entry.probe = ProbeState::Responsive;
        }
    }

    /// Marks every responsive connection as awaiting a probe sent at `now`
    /// and returns their senders so the caller can emit the probes.
    ///
    /// Connections already awaiting an answer are left untouched; they are
    /// the eviction sweep's concern.
    pub async fn begin_probe(&self, now: Instant) -> Vec<(ConnId, mpsc::UnboundedSender<Message>)> {
        let mut conns = self.connections.write().await;
        conns
            .iter_mut()
            .filter(|(_, entry)| entry.probe == ProbeState::Responsive)
            .map(|(conn_id, entry)| {
                entry.probe = ProbeState::Awaiting { since: now };
                (*conn_id, entry.sender.clone())
            })
            .collect()
    }

    /// Returns connections whose outstanding probe is at least `max_age` old.
    pub async fn stale_connections(&self, now: Instant, max_age: Duration) -> Vec<ConnId> {
        let conns = self.connections.read().await;
        conns
            .iter()
            .filter(|(_, entry)| match entry.probe {
                ProbeState::Awaiting { since } => now.duration_since(since) >= max_age,
                ProbeState::Responsive => false,
            })
            .map(|(conn_id, _)| *conn_id)
            .collect()
    }

    /// Number of currently tracked connections.
    pub async fn connection_count(&self) -> usize {
        let conns = self.connections.read().await;
        conns.len()
    }
}

/// Synthesizes a short random alphanumeric client id.
fn generate_client_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(GENERATED_ID_LEN)
        .map(char::from)
        .collect()
}
