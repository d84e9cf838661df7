//! Per-room live presence tracking.
//!
//! Presence is tracked as room -> user -> connection set, so one user
//! on several devices counts once. A user becomes present with their
//! first connection in a room and absent when the last one goes, and
//! only those two transitions are fanned out to peers. Emptied entries
//! are pruned so idle rooms cost nothing.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use huddle_proto::ids::{ConnectionId, RoomId, UserId};

/// Result of adding a connection to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// `true` when this was the user's first connection in the room.
    pub newly_present: bool,
    /// Distinct users present after the join.
    pub online_count: usize,
}

/// Result of removing a connection from a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// `true` when the user has no remaining connections in the room.
    pub user_left: bool,
    /// `true` when the room has no present users left at all.
    pub room_emptied: bool,
    /// Distinct users present after the leave.
    pub online_count: usize,
}

/// Tracks which users are live in which rooms, per connection.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    rooms: RwLock<HashMap<RoomId, HashMap<UserId, HashSet<ConnectionId>>>>,
}

impl PresenceTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a connection to a room's presence.
    pub async fn join(&self, room_id: RoomId, user_id: UserId, conn_id: ConnectionId) -> JoinOutcome {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id).or_default();
        let connections = room.entry(user_id).or_default();
        let newly_present = connections.is_empty();
        connections.insert(conn_id);
        JoinOutcome {
            newly_present,
            online_count: room.len(),
        }
    }

    /// Removes a connection from a room's presence.
    ///
    /// Returns `None` when the connection was not tracked in that room.
    pub async fn leave(
        &self,
        room_id: RoomId,
        user_id: UserId,
        conn_id: ConnectionId,
    ) -> Option<LeaveOutcome> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&room_id)?;
        let connections = room.get_mut(&user_id)?;
        if !connections.remove(&conn_id) {
            return None;
        }

        let user_left = connections.is_empty();
        if user_left {
            room.remove(&user_id);
        }
        let online_count = room.len();
        let room_emptied = room.is_empty();
        if room_emptied {
            rooms.remove(&room_id);
        }

        Some(LeaveOutcome {
            user_left,
            room_emptied,
            online_count,
        })
    }

    /// Distinct users currently present in a room.
    pub async fn online_count(&self, room_id: RoomId) -> usize {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .map_or(0, HashMap::len)
    }

    /// Users currently present in a room.
    pub async fn online_users(&self, room_id: RoomId) -> Vec<UserId> {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .map_or_else(Vec::new, |room| room.keys().copied().collect())
    }

    /// Every connection currently present in a room, across all users.
    pub async fn connections_in(&self, room_id: RoomId) -> Vec<ConnectionId> {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .map_or_else(Vec::new, |room| {
                room.values().flatten().copied().collect()
            })
    }

    /// Returns whether a user has at least one connection in the room.
    pub async fn is_present(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .is_some_and(|room| room.contains_key(&user_id))
    }

    /// Number of rooms with any presence at all.
    pub async fn tracked_rooms(&self) -> usize {
        self.rooms.read().await.len()
    }
}
