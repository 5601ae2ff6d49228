//! Serialization for the `Rundown` synchronization channel.
//!
//! WebSocket frames preserve message boundaries, so each frame carries
//! exactly one postcard-encoded [`SyncMessage`] with no length prefix.

use crate::sync::SyncMessage;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame exceeds the configured maximum size.
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual frame size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },
}

/// Encodes a [`SyncMessage`] into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the message cannot be serialized.
pub fn encode(msg: &SyncMessage) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(msg).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`SyncMessage`] from a byte slice using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode(bytes: &[u8]) -> Result<SyncMessage, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a frame after checking it against a size limit.
///
/// # Errors
///
/// Returns `CodecError::TooLarge` if `bytes` exceeds `max`, otherwise the
/// errors of [`decode`].
pub fn decode_bounded(bytes: &[u8], max: usize) -> Result<SyncMessage, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max,
        });
    }
    decode(bytes)
}
