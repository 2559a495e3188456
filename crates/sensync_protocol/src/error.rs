//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A message could not be serialized.
    #[error("failed to encode {what}: {source}")]
    Encode {
        /// Message kind being encoded.
        what: &'static str,
        /// Underlying serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// A frame was not a well-formed message.
    #[error("failed to decode {what}: {source}")]
    Decode {
        /// Message kind being decoded.
        what: &'static str,
        /// Underlying parser error.
        #[source]
        source: serde_json::Error,
    },

    /// A batch frame carried an unknown `type` tag.
    #[error("unexpected message type: {0}")]
    UnexpectedType(String),
}
