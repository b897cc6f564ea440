//! Error types for fieldnode-store.

use std::path::PathBuf;

use fieldnode_types::ReadingShape;

/// Result type for fieldnode-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldnode-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The store (or a message) is committed to a different reading shape.
    #[error("Reading shape mismatch: store is '{stored}', got '{requested}'")]
    ShapeMismatch {
        stored: ReadingShape,
        requested: ReadingShape,
    },

    /// A query filter that the store's shape cannot answer.
    #[error("Unsupported filter: {0}")]
    UnsupportedFilter(String),

    /// Invalid timestamp.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
