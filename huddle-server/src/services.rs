//! Backing services the chat layer consumes.
//!
//! The chat server does not own users, rooms or message history. It
//! talks to three narrow service traits so the surrounding application
//! can plug in its real storage, while tests and the bundled binary run
//! against the in-memory implementations defined here.

use std::collections::HashMap;

use tokio::sync::Mutex;

use huddle_proto::ids::{MessageId, RoomId, Timestamp, UserId};
use huddle_proto::message::MessageRecord;
use huddle_proto::room::RoomSummary;
use huddle_proto::user::UserProfile;

/// Errors that can occur while talking to a backing service.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage is unreachable or unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),
}

/// A user as known to the application's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Public identity.
    pub profile: UserProfile,
    /// Whether the account may open connections.
    pub active: bool,
}

/// A room as known to the application's room service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    /// Room metadata reported to clients.
    pub summary: RoomSummary,
    /// Durable participants, by user id.
    pub participant_ids: Vec<UserId>,
    /// When the room last saw a message, if ever.
    pub last_message_at: Option<Timestamp>,
}

/// Input for persisting a new message. The store assigns id and
/// creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Room the message belongs to.
    pub room_id: RoomId,
    /// Author's user id.
    pub sender_id: UserId,
    /// Already-validated, trimmed message text.
    pub content: String,
}

/// Room metadata and durable membership.
pub trait RoomDirectory: Send + Sync {
    /// Fetches a room and its participant list.
    fn room(
        &self,
        room_id: RoomId,
    ) -> impl std::future::Future<Output = Result<Option<RoomRecord>, StoreError>> + Send;

    /// Checks whether `user_id` is a durable participant of `room_id`.
    fn is_participant(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Records message activity on a room.
    fn touch_room(
        &self,
        room_id: RoomId,
        at: Timestamp,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

/// Durable message history for rooms.
pub trait MessageStore: Send + Sync {
    /// Persists a message, assigning its id and creation time.
    ///
    /// Ids increase in persistence order, so within a room they define
    /// the canonical message ordering.
    fn create(
        &self,
        message: NewMessage,
    ) -> impl std::future::Future<Output = Result<MessageRecord, StoreError>> + Send;

    /// Returns up to `limit` messages older than `before` (all newest
    /// messages when `before` is `None`), most recent first.
    fn list_before(
        &self,
        room_id: RoomId,
        before: Option<Timestamp>,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<MessageRecord>, StoreError>> + Send;

    /// Returns up to `limit` messages created strictly after `since`,
    /// oldest first. Used to replay a reconnect gap.
    fn list_since(
        &self,
        room_id: RoomId,
        since: Timestamp,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<MessageRecord>, StoreError>> + Send;

    /// Marks every unread message in `room_id` not authored by `reader`
    /// as read. Returns how many messages were updated.
    ///
    /// The read flag only ever flips from unread to read, so repeating
    /// the call is a no-op.
    fn mark_read(
        &self,
        room_id: RoomId,
        reader: UserId,
    ) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;
}

/// Read-only access to the application's user accounts.
pub trait UserDirectory: Send + Sync {
    /// Fetches a user by id, or `None` if the directory has no such
    /// account.
    fn lookup(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<Option<UserRecord>, StoreError>> + Send;
}

/// The three backing services bundled for the server.
pub struct Services<R, M, U> {
    /// Room metadata and membership.
    pub rooms: R,
    /// Message history.
    pub store: M,
    /// User accounts.
    pub users: U,
}

impl Services<InMemoryRooms, InMemoryMessages, InMemoryUsers> {
    /// Creates an empty, fully in-memory service bundle.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            rooms: InMemoryRooms::new(),
            store: InMemoryMessages::new(),
            users: InMemoryUsers::new(),
        }
    }
}

/// In-memory room service for tests and the bundled binary.
#[derive(Debug)]
pub struct InMemoryRooms {
    rooms: Mutex<HashMap<RoomId, RoomRecord>>,
}

impl InMemoryRooms {
    /// Creates an empty room service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a room service pre-populated with `rooms`.
    #[must_use]
    pub fn with_rooms(rooms: impl IntoIterator<Item = RoomRecord>) -> Self {
        let map = rooms
            .into_iter()
            .map(|record| (record.summary.id, record))
            .collect();
        Self {
            rooms: Mutex::new(map),
        }
    }

    /// Adds or replaces a room.
    pub async fn insert(&self, record: RoomRecord) {
        self.rooms.lock().await.insert(record.summary.id, record);
    }
}

impl Default for InMemoryRooms {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomDirectory for InMemoryRooms {
    async fn room(&self, room_id: RoomId) -> Result<Option<RoomRecord>, StoreError> {
        Ok(self.rooms.lock().await.get(&room_id).cloned())
    }

    async fn is_participant(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self
            .rooms
            .lock()
            .await
            .get(&room_id)
            .is_some_and(|record| record.participant_ids.contains(&user_id)))
    }

    async fn touch_room(&self, room_id: RoomId, at: Timestamp) -> Result<(), StoreError> {
        match self.rooms.lock().await.get_mut(&room_id) {
            Some(record) => {
                record.last_message_at = Some(at);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("room {room_id}"))),
        }
    }
}

struct MessagesInner {
    next_id: i64,
    by_room: HashMap<RoomId, Vec<MessageRecord>>,
}

/// In-memory message history for tests and the bundled binary.
pub struct InMemoryMessages {
    inner: Mutex<MessagesInner>,
}

impl InMemoryMessages {
    /// Creates an empty message store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MessagesInner {
                next_id: 1,
                by_room: HashMap::new(),
            }),
        }
    }

    /// Returns every message persisted for `room_id`, oldest first.
    pub async fn all_in_room(&self, room_id: RoomId) -> Vec<MessageRecord> {
        self.inner
            .lock()
            .await
            .by_room
            .get(&room_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for InMemoryMessages {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for InMemoryMessages {
    async fn create(&self, message: NewMessage) -> Result<MessageRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = MessageRecord {
            id: MessageId::new(inner.next_id),
            room_id: message.room_id,
            sender_id: message.sender_id,
            content: message.content,
            read: false,
            created_at: Timestamp::now(),
            sender: None,
        };
        inner.next_id += 1;
        inner
            .by_room
            .entry(message.room_id)
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn list_before(
        &self,
        room_id: RoomId,
        before: Option<Timestamp>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let Some(messages) = inner.by_room.get(&room_id) else {
            return Ok(Vec::new());
        };
        let mut page: Vec<MessageRecord> = messages
            .iter()
            .filter(|m| before.is_none_or(|cutoff| m.created_at < cutoff))
            .cloned()
            .collect();
        page.reverse();
        page.truncate(limit);
        Ok(page)
    }

    async fn list_since(
        &self,
        room_id: RoomId,
        since: Timestamp,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let Some(messages) = inner.by_room.get(&room_id) else {
            return Ok(Vec::new());
        };
        Ok(messages
            .iter()
            .filter(|m| m.created_at > since)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, room_id: RoomId, reader: UserId) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(messages) = inner.by_room.get_mut(&room_id) else {
            return Ok(0);
        };
        let mut updated = 0;
        for message in messages.iter_mut() {
            if !message.read && message.sender_id != reader {
                message.read = true;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

/// In-memory user directory for tests and the bundled binary.
#[derive(Debug)]
pub struct InMemoryUsers {
    users: Mutex<HashMap<UserId, UserRecord>>,
}

impl InMemoryUsers {
    /// Creates an empty user directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a directory pre-populated with `users`.
    #[must_use]
    pub fn with_users(users: impl IntoIterator<Item = UserRecord>) -> Self {
        let map = users
            .into_iter()
            .map(|record| (record.profile.id, record))
            .collect();
        Self {
            users: Mutex::new(map),
        }
    }

    /// Adds or replaces an account.
    pub async fn insert(&self, record: UserRecord) {
        self.users.lock().await.insert(record.profile.id, record);
    }
}

impl Default for InMemoryUsers {
    fn default() -> Self {
        Self::new()
    }
}

impl UserDirectory for InMemoryUsers {
    async fn lookup(&self, user_id: UserId) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.lock().await.get(&user_id).cloned())
    }
}
