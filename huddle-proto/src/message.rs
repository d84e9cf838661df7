//! Chat message records and content validation.
//!
//! Content rules are enforced server-side before anything is persisted:
//! surrounding whitespace is stripped, the trimmed text must be non-empty
//! and must not exceed [`MAX_MESSAGE_CHARS`] characters.

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, RoomId, Timestamp, UserId};
use crate::user::UserProfile;

/// Maximum allowed message length in characters, measured after trimming.
pub const MAX_MESSAGE_CHARS: usize = 1000;

/// A persisted chat message as carried in broadcasts and history replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Store-assigned identifier, unique per message.
    pub id: MessageId,
    /// Room the message belongs to.
    pub room_id: RoomId,
    /// Author's user identifier.
    pub sender_id: UserId,
    /// Trimmed message text.
    pub content: String,
    /// Whether another participant has marked the message read.
    pub read: bool,
    /// Store-assigned creation time.
    pub created_at: Timestamp,
    /// Author identity, attached on a best-effort basis when broadcasting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserProfile>,
}

/// Error returned when message content fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Content is empty once surrounding whitespace is removed.
    #[error("message content is empty")]
    Empty,
    /// Content exceeds the maximum allowed length.
    #[error("message too long ({chars} characters, max {max})")]
    TooLong {
        /// Trimmed length of the content in characters.
        chars: usize,
        /// Maximum allowed length in characters.
        max: usize,
    },
}

/// Validates raw message content and returns the trimmed text.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] if nothing remains after trimming,
/// or [`ValidationError::TooLong`] if the trimmed text exceeds
/// [`MAX_MESSAGE_CHARS`] characters.
pub fn validate_content(raw: &str) -> Result<&str, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    let chars = trimmed.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(ValidationError::TooLong {
            chars,
            max: MAX_MESSAGE_CHARS,
        });
    }
    Ok(trimmed)
}
