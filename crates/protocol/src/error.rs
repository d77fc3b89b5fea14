//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering every way a frame can fail to decode or encode.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The frame is not well-formed JSON.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A text frame without a string `type` discriminator.
    #[error("message has no `type` field")]
    MissingType,

    /// A text frame whose `type` is not part of the schema.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// A known message type whose payload fields are missing or mistyped.
    #[error("invalid `{kind}` message: {reason}")]
    InvalidField {
        /// The message type that failed validation.
        kind: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A frame kind that is not valid in this direction.
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
