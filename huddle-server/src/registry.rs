//! Live connection bookkeeping.
//!
//! Every authenticated WebSocket connection gets one registry entry
//! holding its outbound event channel, the resolved user identity, the
//! rooms it has joined and activity counters. All lookups are keyed by
//! [`ConnectionId`] and run in constant time.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::sync::mpsc;

use huddle_proto::event::ServerEvent;
use huddle_proto::ids::{ConnectionId, RoomId, Timestamp, UserId};
use huddle_proto::user::UserProfile;

/// State tracked for one live connection.
#[derive(Debug)]
pub struct ConnectionEntry {
    /// Authenticated identity behind the connection.
    pub user: UserProfile,
    /// Channel to the connection's writer task.
    pub tx: mpsc::UnboundedSender<ServerEvent>,
    /// Rooms this connection has joined.
    pub rooms: HashSet<RoomId>,
    /// Last time the connection sent any frame.
    pub last_activity: Timestamp,
    /// When the connection registered.
    pub connected_at: Timestamp,
    /// Messages accepted from this connection.
    pub messages_sent: u64,
}

/// Registry of live connections, keyed by connection id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a freshly authenticated connection.
    pub async fn register(
        &self,
        id: ConnectionId,
        user: UserProfile,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let now = Timestamp::now();
        let entry = ConnectionEntry {
            user,
            tx,
            rooms: HashSet::new(),
            last_activity: now,
            connected_at: now,
            messages_sent: 0,
        };
        self.connections.write().await.insert(id, entry);
    }

    /// Removes a connection, returning its final entry.
    ///
    /// Safe to call more than once; later calls return `None`.
    pub async fn unregister(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        self.connections.write().await.remove(&id)
    }

    /// Enqueues an event to one connection's writer task.
    ///
    /// Returns `false` if the connection is gone or its writer has shut
    /// down.
    pub async fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        self.connections
            .read()
            .await
            .get(&id)
            .is_some_and(|entry| entry.tx.send(event).is_ok())
    }

    /// Stamps the connection's last-activity time.
    pub async fn touch(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.last_activity = Timestamp::now();
        }
    }

    /// Records a room join on the connection. Returns `false` if the
    /// connection is unknown.
    pub async fn add_room(&self, id: ConnectionId, room_id: RoomId) -> bool {
        self.connections
            .write()
            .await
            .get_mut(&id)
            .map(|entry| entry.rooms.insert(room_id))
            .is_some()
    }

    /// Removes a room from the connection's joined set. Returns whether
    /// the room was present.
    pub async fn remove_room(&self, id: ConnectionId, room_id: RoomId) -> bool {
        self.connections
            .write()
            .await
            .get_mut(&id)
            .is_some_and(|entry| entry.rooms.remove(&room_id))
    }

    /// Returns whether the connection currently has `room_id` joined.
    pub async fn in_room(&self, id: ConnectionId, room_id: RoomId) -> bool {
        self.connections
            .read()
            .await
            .get(&id)
            .is_some_and(|entry| entry.rooms.contains(&room_id))
    }

    /// Returns the identity behind a connection, if it is registered.
    pub async fn user_of(&self, id: ConnectionId) -> Option<UserProfile> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|entry| entry.user.clone())
    }

    /// Increments the connection's accepted-message counter.
    pub async fn record_send(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.messages_sent += 1;
        }
    }

    /// Returns connections whose last activity is older than
    /// `threshold`, with the users behind them.
    pub async fn idle_since(
        &self,
        threshold: Duration,
        now: Timestamp,
    ) -> Vec<(ConnectionId, UserId)> {
        let threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        self.connections
            .read()
            .await
            .iter()
            .filter(|(_, entry)| now.millis_since(entry.last_activity) > threshold_ms)
            .map(|(id, entry)| (*id, entry.user.id))
            .collect()
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Returns `true` if no connections are registered.
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
