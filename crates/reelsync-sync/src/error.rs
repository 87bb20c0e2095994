//! # Sync Error Types
//!
//! Error types for the sync engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  ConnectFailed  │  │  FrameTooLarge          │ │
//! │  │  MissingDeviceId│  │  Timeout        │  │  TooManyEmptyFrames     │ │
//! │  │  ConfigLoad/Save│  │  BindFailed     │  │  MalformedMessage       │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Storage      │  │   Collaborator  │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Storage        │  │  Cache          │  │  ShuttingDown           │ │
//! │  │  (share, logs)  │  │  Subscriptions  │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  HANDLING                                                              │
//! │  Transport → log, retry on the next discovery cycle                    │
//! │  Protocol  → close the offending connection only                       │
//! │  Storage   → skip this cycle, keep the last good data                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;

use thiserror::Error;

use reelsync_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering every engine failure.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required for sync).
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// No port in the probe range could be bound.
    #[error("Could not bind a listening port in {first}..={last}")]
    BindFailed { first: u16, last: u16 },

    /// Outbound connection failed.
    #[error("Connection to {addr} failed: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },

    /// Outbound connection did not complete in time.
    #[error("Connection to {addr} timed out after {millis} ms")]
    ConnectTimeout { addr: SocketAddr, millis: u64 },

    /// Every candidate address of a peer failed.
    #[error("Peer {0} unreachable on every candidate address")]
    PeerUnreachable(String),

    /// Socket I/O failed.
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection closed.
    #[error("Connection closed")]
    Disconnected,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Frame length exceeds the allowed maximum.
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Too many consecutive zero-length frames.
    #[error("{0} consecutive zero-length frames")]
    TooManyEmptyFrames(u32),

    /// Frame body is not a valid message.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Envelope carries an unknown message type.
    #[error("Unknown message type {0}")]
    UnknownMessageType(u32),

    /// Failed to serialize a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Shared store or cache failure.
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    /// A host collaborator (cache store, subscription registry) failed.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The service is shutting down.
    #[error("Sync service is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedMessage(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::Internal(format!("background task failed: {}", err))
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the operation may succeed on a later cycle.
    ///
    /// ## Retryable Errors
    /// - Connect failures and timeouts (peer offline, VPN down)
    /// - Socket resets
    /// - Transient storage errors (share unavailable, file locked)
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ConnectFailed { .. }
            | SyncError::ConnectTimeout { .. }
            | SyncError::PeerUnreachable(_)
            | SyncError::Io(_)
            | SyncError::Disconnected
            | SyncError::Collaborator { .. } => true,
            SyncError::Storage(db) => db.is_transient(),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the peer violated the wire protocol.
    ///
    /// Only the offending connection is closed.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::FrameTooLarge { .. }
                | SyncError::TooManyEmptyFrames(_)
                | SyncError::MalformedMessage(_)
                | SyncError::UnknownMessageType(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        let addr: SocketAddr = "192.168.1.20:49152".parse().unwrap();
        assert!(SyncError::ConnectTimeout { addr, millis: 3000 }.is_retryable());
        assert!(SyncError::Disconnected.is_retryable());
        assert!(SyncError::PeerUnreachable("X".into()).is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::MissingDeviceId.is_retryable());
        assert!(!SyncError::FrameTooLarge { len: 11, max: 10 }.is_retryable());
    }

    #[test]
    fn test_protocol_errors() {
        assert!(SyncError::TooManyEmptyFrames(10).is_protocol_error());
        assert!(SyncError::UnknownMessageType(99).is_protocol_error());
        assert!(!SyncError::Disconnected.is_protocol_error());
    }

    #[test]
    fn test_storage_errors_follow_db_classification() {
        let locked = SyncError::from(DbError::io(
            "/share/peers/X.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"),
        ));
        assert!(locked.is_retryable());
        assert!(locked.to_string().contains("peers/X.json"));
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::BindFailed {
            first: 49152,
            last: 49251,
        };
        assert!(err.to_string().contains("49152"));
        assert!(err.to_string().contains("49251"));
    }
}
