//! Named events exchanged over the WebSocket transport.
//!
//! Every frame is a JSON object of the form `{"event": ..., "data": {...}}`.
//! [`ClientEvent`] covers frames a client may send, [`ServerEvent`] frames
//! the server emits. Client payload fields that a peer could omit are
//! modeled as `Option` so the server can reject them with a stable error
//! code instead of failing to decode the frame.

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, RoomId, Timestamp, UserId};
use crate::message::MessageRecord;
use crate::room::{LeaveReason, RoomSummary};
use crate::user::UserProfile;

/// Per-room cursor sent while resuming a dropped session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRoom {
    /// Room the client wants to rejoin.
    pub room_id: RoomId,
    /// Creation time of the newest message the client has seen, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_ms: Option<u64>,
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Presents a credential when none was given at connection time.
    Authenticate {
        /// Signed credential string.
        credential: String,
    },
    /// Requests live membership of a room.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        /// Target room. Absent when a buggy client forgets it.
        #[serde(default)]
        room_id: Option<RoomId>,
    },
    /// Drops live membership of a room.
    #[serde(rename_all = "camelCase")]
    LeaveRoom {
        /// Target room.
        #[serde(default)]
        room_id: Option<RoomId>,
    },
    /// Submits a chat message for persistence and broadcast.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        /// Target room.
        #[serde(default)]
        room_id: Option<RoomId>,
        /// Raw message text, validated server-side.
        #[serde(default)]
        content: Option<String>,
    },
    /// Reports the user started or stopped typing.
    #[serde(rename_all = "camelCase")]
    Typing {
        /// Target room.
        #[serde(default)]
        room_id: Option<RoomId>,
        /// `true` while composing, `false` or absent to clear.
        #[serde(default)]
        is_typing: Option<bool>,
    },
    /// Marks other participants' messages in a room as read.
    #[serde(rename_all = "camelCase")]
    MarkMessagesRead {
        /// Target room.
        #[serde(default)]
        room_id: Option<RoomId>,
    },
    /// Application-level keepalive probe.
    Ping {
        /// Opaque payload echoed back in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    /// Re-establishes room membership after a reconnect, reporting the
    /// newest message seen per room so the server can replay the gap.
    Resume {
        /// Rooms the client considers itself part of.
        rooms: Vec<ResumeRoom>,
    },
}

/// Frames emitted by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Handshake acknowledgment carrying the authenticated identity.
    Connected {
        /// The user this connection now acts as.
        user: UserProfile,
    },
    /// Confirms a join to the requesting connection.
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        /// Room metadata.
        room: RoomSummary,
        /// Durable participants of the room.
        participants: Vec<UserProfile>,
        /// Number of participants currently present.
        online_count: usize,
    },
    /// Confirms a leave to the requesting connection.
    #[serde(rename_all = "camelCase")]
    RoomLeft {
        /// Room that was left.
        room_id: RoomId,
    },
    /// Confirms a resumed room and replays messages missed while away.
    #[serde(rename_all = "camelCase")]
    RoomResumed {
        /// Room that was rejoined.
        room_id: RoomId,
        /// Messages persisted after the client's reported cursor.
        missed: Vec<MessageRecord>,
        /// Number of participants currently present.
        online_count: usize,
    },
    /// A message accepted into the room, fanned out to present connections.
    #[serde(rename_all = "camelCase")]
    NewMessage {
        /// Room the message belongs to.
        room_id: RoomId,
        /// The persisted message.
        message: MessageRecord,
    },
    /// Acknowledges the sender's own message once it is persisted.
    #[serde(rename_all = "camelCase")]
    MessageSent {
        /// Store-assigned identifier.
        message_id: MessageId,
        /// Room the message was sent to.
        room_id: RoomId,
        /// Store-assigned creation time.
        timestamp: Timestamp,
    },
    /// A user became present in a room.
    #[serde(rename_all = "camelCase")]
    UserJoinedRoom {
        /// Room in question.
        room_id: RoomId,
        /// Identity of the user who joined.
        user: UserProfile,
        /// Number of participants currently present.
        online_count: usize,
    },
    /// A user dropped out of a room's presence.
    #[serde(rename_all = "camelCase")]
    UserLeftRoom {
        /// Room in question.
        room_id: RoomId,
        /// User who left.
        user_id: UserId,
        /// Why presence ended.
        reason: LeaveReason,
    },
    /// A participant started or stopped typing.
    #[serde(rename_all = "camelCase")]
    UserTyping {
        /// Room in question.
        room_id: RoomId,
        /// User whose typing state changed.
        user_id: UserId,
        /// Current typing state.
        is_typing: bool,
    },
    /// A participant marked the room's messages as read.
    #[serde(rename_all = "camelCase")]
    MessagesRead {
        /// Room in question.
        room_id: RoomId,
        /// User who read the messages.
        user_id: UserId,
    },
    /// Keepalive reply.
    #[serde(rename_all = "camelCase")]
    Pong {
        /// Payload echoed from the ping, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        /// Server wall-clock time in milliseconds since the UNIX epoch.
        server_time_ms: u64,
    },
    /// Reports a failed operation back to the offending connection.
    Error {
        /// Human-readable description.
        message: String,
        /// Stable machine-readable code.
        code: ErrorCode,
    },
    /// Orders the client to disconnect. No further frames follow.
    ForceDisconnect {
        /// Why the server is closing the session.
        reason: String,
    },
}

/// Stable error codes carried in [`ServerEvent::Error`].
///
/// These are part of the wire contract: clients branch on them, so the
/// serialized tokens never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A room-scoped request arrived without a room id.
    MissingRoomId,
    /// The user is not a participant of the target room.
    RoomAccessDenied,
    /// Message payload failed validation.
    InvalidMessageData,
    /// Message content exceeds the length limit.
    MessageTooLong,
    /// Joining a room failed for an internal reason.
    JoinRoomError,
    /// Leaving a room failed for an internal reason.
    LeaveRoomError,
    /// Persisting or broadcasting a message failed.
    SendMessageError,
    /// Updating read state failed.
    MarkReadError,
    /// A frame could not be decoded.
    SocketError,
    /// The connection presented no acceptable credential.
    AuthenticationError,
}

impl ErrorCode {
    /// Returns the wire token for this code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MissingRoomId => "MISSING_ROOM_ID",
            Self::RoomAccessDenied => "ROOM_ACCESS_DENIED",
            Self::InvalidMessageData => "INVALID_MESSAGE_DATA",
            Self::MessageTooLong => "MESSAGE_TOO_LONG",
            Self::JoinRoomError => "JOIN_ROOM_ERROR",
            Self::LeaveRoomError => "LEAVE_ROOM_ERROR",
            Self::SendMessageError => "SEND_MESSAGE_ERROR",
            Self::MarkReadError => "MARK_READ_ERROR",
            Self::SocketError => "SOCKET_ERROR",
            Self::AuthenticationError => "AUTHENTICATION_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
