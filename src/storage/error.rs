//! Storage-specific error types.
//!
//! All storage operations return [`StorageError`] on failure, which can be
//! matched to determine the underlying cause (database, decoding, migration).

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed (sqlx error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid data in database (e.g., unknown enum value, missing column).
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Referenced record does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
