use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur within the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection became available in time.
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A JSON column (schedule, job data) could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An insert collided with an existing definition.
    #[error("{kind} already exists: {key}")]
    ObjectAlreadyExists { kind: &'static str, key: String },

    /// No job with the given key exists in the store.
    #[error("Job not found: {key}")]
    JobNotFound { key: String },

    /// No trigger with the given key exists in the store.
    #[error("Trigger not found: {key}")]
    TriggerNotFound { key: String },
}

impl StoreError {
    /// True for SQLite busy/locked failures: another connection holds the write lock.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => is_busy(e),
            StoreError::Pool(_) => true,
            _ => false,
        }
    }
}

/// Whether a rusqlite error is a write-lock conflict worth retrying.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

pub type Result<T> = std::result::Result<T, StoreError>;
