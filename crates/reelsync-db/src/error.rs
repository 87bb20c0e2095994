//! # Storage Error Types
//!
//! Error types for the shared store (change logs, bulletin board) and the
//! local SQLite cache.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  std::io::Error / serde_json::Error / sqlx::Error                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← Adds path context and categorization          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError (in reelsync-sync) ← Logged, project left for retry         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncStatus::Error shown by the GUI (advisory, never a dialog)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};

use thiserror::Error;

use reelsync_core::CoreError;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// A shared-store file could not be read or written.
    ///
    /// ## When This Occurs
    /// - Network share temporarily unavailable
    /// - File locked by another device's writer
    /// - Permission denied
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON record on the shared store is malformed.
    #[error("Malformed record in {path}: {message}")]
    MalformedRecord { path: PathBuf, message: String },

    /// A record failed domain validation.
    #[error("Invalid record: {0}")]
    Invalid(#[from] CoreError),

    /// Serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Transaction failed.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal storage error.
    #[error("Internal storage error: {0}")]
    Internal(String),
}

impl DbError {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        DbError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Returns true for errors that are expected to clear on a later scan
    /// (locked files, a share that dropped off the network).
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Io { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput
            ),
            DbError::PoolExhausted | DbError::ConnectionFailed(_) => true,
            _ => false,
        }
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::Database       → DbError::QueryFailed
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// sqlx::Error::PoolClosed     → DbError::ConnectionFailed
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => DbError::QueryFailed(db_err.message().to_string()),
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),
            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for storage operations.
pub type DbResult<T> = Result<T, DbError>;
