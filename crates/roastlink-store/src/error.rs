//! Error types for roastlink-store.

use std::path::PathBuf;

/// Result type for roastlink-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in roastlink-store.
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

    /// A stored row could not be turned back into a queue item.
    #[error("Corrupt queue row {client_id}: {reason}")]
    CorruptRow { client_id: String, reason: String },

    /// The database was written by a newer version of roastlink.
    #[error("Unsupported schema version {found} (newest known is {supported})")]
    UnsupportedSchema { found: i32, supported: i32 },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<Error> for roastlink_core::Error {
    fn from(err: Error) -> Self {
        roastlink_core::Error::Queue(err.to_string())
    }
}
