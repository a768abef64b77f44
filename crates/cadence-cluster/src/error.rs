use cadence_core::CoreError;
use cadence_store::{is_busy, StoreError};
use thiserror::Error;

/// Errors raised by the coordination engine.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(#[from] CoreError),

    /// The lock row was never found: the schema was not provisioned for
    /// this scheduler name.
    #[error("lock row {lock} missing for scheduler {scheduler}; provision the schema first")]
    LockRowMissing {
        lock: &'static str,
        scheduler: String,
    },

    /// The lock row existed earlier in this process and has been deleted since.
    #[error("lock row {lock} for scheduler {scheduler} was deleted while in use")]
    LockRowVanished {
        lock: &'static str,
        scheduler: String,
    },

    /// The store kept reporting a write conflict on the lock row.
    #[error("failed to obtain lock {lock} after {attempts} attempt(s): {source}")]
    LockFailed {
        lock: &'static str,
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    /// A database lock was requested without a connection to lock on.
    #[error("lock {lock} requires a connection")]
    LockRequiresConnection { lock: &'static str },

    /// A database lock was requested on a host connection with no open transaction.
    #[error("lock {lock} requested outside a host transaction")]
    NoHostTransaction { lock: &'static str },

    /// Foreground operations in managed mode must run inside a host transaction.
    #[error("store runs in managed transaction mode; use JobStore::with_host_transaction")]
    HostTransactionRequired,

    /// A blocking pass panicked or was cancelled by the runtime.
    #[error("background task failed: {0}")]
    Task(String),

    #[error("job store is shutting down")]
    ShuttingDown,
}

impl ClusterError {
    /// Whether the same operation may succeed if tried again later.
    ///
    /// Missing lock rows and configuration problems are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClusterError::Store(e) => e.is_transient(),
            ClusterError::Database(e) => is_busy(e),
            ClusterError::LockFailed { .. } | ClusterError::Task(_) => true,
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ClusterError::Store(_) => "STORE_ERROR",
            ClusterError::Database(_) => "DATABASE_ERROR",
            ClusterError::Config(_) => "CONFIG_ERROR",
            ClusterError::LockRowMissing { .. } => "LOCK_ROW_MISSING",
            ClusterError::LockRowVanished { .. } => "LOCK_ROW_VANISHED",
            ClusterError::LockFailed { .. } => "LOCK_FAILED",
            ClusterError::LockRequiresConnection { .. } => "LOCK_REQUIRES_CONNECTION",
            ClusterError::NoHostTransaction { .. } => "NO_HOST_TRANSACTION",
            ClusterError::HostTransactionRequired => "HOST_TRANSACTION_REQUIRED",
            ClusterError::Task(_) => "TASK_FAILED",
            ClusterError::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
