//! Error types for offsync
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::remote::RemoteError;

/// All error types that can occur in offsync
#[derive(Debug, Error)]
pub enum OffsyncError {
    /// The structured store could not be opened
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A write exceeded the capacity of the active store
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Collection is not part of the schema
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// Record could not be keyed (missing natural key, bad key type)
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// A single legacy mapping failed to migrate
    #[error("Migration error: {0}")]
    Migration(String),

    /// Configuration could not be loaded or is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// Remote service error
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OffsyncError {
    /// True when the failure threatens local durability and must reach the caller.
    pub fn is_local_durability(&self) -> bool {
        matches!(
            self,
            OffsyncError::QuotaExceeded(_)
                | OffsyncError::Storage(_)
                | OffsyncError::Sqlite(_)
                | OffsyncError::Io(_)
        )
    }
}

/// Result type alias for offsync operations
pub type Result<T> = std::result::Result<T, OffsyncError>;
