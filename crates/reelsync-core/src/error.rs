//! # Error Types
//!
//! Domain-specific error types for reelsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  reelsync-core errors (this file)                                      │
//! │  └── CoreError        - Invalid items / records                        │
//! │                                                                         │
//! │  reelsync-db errors (separate crate)                                   │
//! │  └── DbError          - Shared-store and cache failures                │
//! │                                                                         │
//! │  reelsync-sync errors (separate crate)                                 │
//! │  └── SyncError        - Network, protocol, scheduling failures         │
//! │                                                                         │
//! │  Flow: CoreError → DbError → SyncError → advisory SyncStatus           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An item path was empty or absolute.
    #[error("Invalid item path: '{0}'")]
    InvalidItemPath(String),

    /// A change-log entry disagrees with the snapshot it carries.
    #[error("Change-log entry for '{path}' carries a snapshot for '{snapshot_path}'")]
    EntryPathMismatch { path: String, snapshot_path: String },

    /// A device identifier was empty.
    #[error("Device ID must not be empty")]
    EmptyDeviceId,

    /// A peer descriptor could not be interpreted.
    #[error("Invalid peer descriptor: {0}")]
    InvalidDescriptor(String),
}
