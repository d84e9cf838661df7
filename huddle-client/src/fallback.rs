//! Offline send fallback.
//!
//! While the session has no live connection, outbound messages can be
//! handed to a [`SendFallback`] that persists them through some other
//! channel (an HTTP API, a local queue). The default [`NullFallback`]
//! has no such channel and rejects every attempt.

use huddle_proto::ids::RoomId;
use huddle_proto::message::MessageRecord;
use huddle_proto::user::UserProfile;

/// Errors an offline delivery attempt can produce.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FallbackError {
    /// No offline delivery channel exists.
    #[error("no offline delivery channel is available")]
    Unavailable,

    /// The fallback tried and failed.
    #[error("offline delivery failed: {0}")]
    Failed(String),
}

/// Alternative persistence for messages composed while disconnected.
pub trait SendFallback: Send + Sync {
    /// Persists a message without the live connection and returns the
    /// stored record.
    fn create_message(
        &self,
        room_id: RoomId,
        sender: &UserProfile,
        content: &str,
    ) -> impl std::future::Future<Output = Result<MessageRecord, FallbackError>> + Send;
}

/// A fallback with no delivery channel. Every attempt fails with
/// [`FallbackError::Unavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFallback;

impl SendFallback for NullFallback {
    async fn create_message(
        &self,
        _room_id: RoomId,
        _sender: &UserProfile,
        _content: &str,
    ) -> Result<MessageRecord, FallbackError> {
        Err(FallbackError::Unavailable)
    }
}
