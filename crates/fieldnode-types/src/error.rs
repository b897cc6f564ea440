//! Error types for message decoding in fieldnode-types.

use thiserror::Error;

/// Errors that can occur when decoding a bus message.
///
/// A decode error means the message is dropped. Missing or malformed
/// individual fields are not errors; they normalize to absent values.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Payload is not valid JSON.
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Payload is valid JSON but not an object.
    #[error("Payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// Unknown reading shape name.
    #[error("Unknown reading shape '{0}': expected 'wide' or 'narrow'")]
    UnknownShape(String),
}

/// Result type alias using fieldnode-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
