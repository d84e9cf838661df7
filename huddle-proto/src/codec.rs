//! JSON codec for WebSocket text frames.
//!
//! Each WebSocket text frame carries exactly one serialized event. The
//! transport preserves message boundaries, so no extra framing is needed
//! on top of the JSON object.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serializing an event failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A frame does not contain a valid event.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Encodes an event into the JSON text carried by one frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode<T: Serialize>(event: &T) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes one frame's JSON text into an event.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the text is not valid JSON or
/// does not match any known event shape.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::InvalidFrame(e.to_string()))
}
