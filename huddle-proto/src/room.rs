//! Room metadata and presence-related wire types.

use serde::{Deserialize, Serialize};

use crate::ids::RoomId;

/// Shape of a conversation room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomKind {
    /// Direct conversation between one member and one support agent.
    OneOnOne,
    /// Multi-participant conversation.
    Group,
}

/// Room metadata as reported to clients on join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    /// Identifier in the application's room service.
    pub id: RoomId,
    /// Human-readable room name.
    pub name: String,
    /// Conversation shape.
    pub kind: RoomKind,
    /// Whether the room is open for new activity.
    pub active: bool,
}

/// Why a user dropped out of a room's live presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveReason {
    /// The user left the room explicitly.
    Left,
    /// The user's last connection closed.
    Disconnected,
    /// The server evicted the user's last connection for inactivity.
    Idle,
}

impl std::fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Left => "left",
            Self::Disconnected => "disconnected",
            Self::Idle => "idle",
        };
        write!(f, "{name}")
    }
}
