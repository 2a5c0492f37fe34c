//! Room directory: named sets of member client ids.
//!
//! Rooms are created implicitly on the first join and dropped when the last
//! member leaves. Membership here is advisory for broadcast audiences; the
//! connection registry remains the authority on which connections are open,
//! so a stale member id is harmless.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

/// In-memory directory of room id to member client ids.
///
/// Thread-safe via [`RwLock`]. Join and leave are idempotent; a client id is
/// expected to be in at most one room at a time, which callers maintain by
/// leaving the previous room before joining the next.
pub struct RoomDirectory {
    rooms: RwLock<HashMap<String, HashSet<String>>>,
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomDirectory {
    /// Creates a new, empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a client to a room, creating the room on first join.
    ///
    /// Idempotent. Does not remove the client from any previous room; that
    /// is the caller's responsibility, performed before this call.
    pub async fn join(&self, room_id: &str, client_id: &str) {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(client_id.to_string());
    }

    /// Removes a client from a room.
    ///
    /// Idempotent; a no-op if the room or member does not exist. The room
    /// entry is dropped once its member set empties.
    pub async fn leave(&self, room_id: &str, client_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room_id) {
            members.remove(client_id);
            if members.is_empty() {
                rooms.remove(room_id);
            }
        }
    }

    /// Returns a snapshot of a room's member ids.
    ///
    /// May be stale by the time a broadcast built from it runs; an empty
    /// `Vec` for an unknown room, since absence and emptiness are equivalent
    /// for routing.
    pub async fn members_of(&self, room_id: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.len()
    }
}
