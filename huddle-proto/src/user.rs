//! User identity types carried in presence and message events.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Role a user holds in the surrounding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular end user.
    Member,
    /// Support staff handling member conversations.
    Support,
    /// Administrative account.
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Member => "member",
            Self::Support => "support",
            Self::Admin => "admin",
        };
        write!(f, "{name}")
    }
}

/// Public identity of a user, attached to presence events and enriched
/// message broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// Identifier in the application's user directory.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Optional avatar URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Application role.
    pub role: Role,
}
