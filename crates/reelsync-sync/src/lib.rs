//! # reelsync-sync: Peer-to-Peer Sync Engine for ReelSync
//!
//! Devices on the same LAN (or VPN) converge on project metadata without a
//! server. Per-device change logs on the shared project store carry the
//! data; direct TCP sessions carry low-latency change notifications.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncService (Orchestrator)                       │
//! │                                                                         │
//! │  Started and stopped by the host application                           │
//! │  Owns every background task                                             │
//! │                                                                         │
//! │         ┌─────────────────────┬─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ PeerRegistry   │  │ Connection     │  │  SyncScheduler         │    │
//! │  │                │  │ Engine         │  │                        │    │
//! │  │ Bulletin board │─►│ Framed TCP,    │─►│ Dedup queue, worker,   │    │
//! │  │ publish / scan │  │ HELLO, PING,   │  │ round-robin timer      │    │
//! │  │ dial / reap    │  │ CHANGE_NOTIFY  │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └───────────┬────────────┘    │
//! │                                                      ▼                  │
//! │                                          ┌────────────────────────┐    │
//! │                                          │  MergeEngine           │    │
//! │                                          │  change logs ⇄ cache   │    │
//! │                                          └────────────────────────┘    │
//! │                                                                         │
//! │  HOST COLLABORATORS (injected):                                        │
//! │  • CacheStore            • SubscriptionRegistry                        │
//! │  • BackupHook            • PeerEventListener                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Wire and Sockets
//! - [`protocol`] - Message types and length-prefixed framing
//! - [`socket`] - Port probing, connect timeout, socket options
//! - [`session`] - Per-socket connection state and the session table
//! - [`engine`] - Accept pool, reader/writer tasks, handshake, keepalive
//!
//! ### Discovery and Sync
//! - [`peers`] - In-memory peer table
//! - [`registry`] - Bulletin-board heartbeat and dialing
//! - [`merge`] - Change-log merge passes
//! - [`scheduler`] - Work queue, worker and timer
//!
//! ### Service
//! - [`service`] - `SyncService` and its builder
//! - [`collaborators`] - Host contracts and in-memory implementations
//! - [`config`] - Sync configuration
//! - [`error`] - Sync error types
//! - [`telemetry`] - Optional tracing setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reelsync_sync::{SyncConfig, SyncService, SqliteCacheStore};
//!
//! let config = SyncConfig::load_or_default(None);
//! let service = SyncService::builder(config)
//!     .with_cache(Arc::new(SqliteCacheStore::new(cache_db)))
//!     .with_subscriptions(subscriptions)
//!     .build()?;
//!
//! let port = service.start()?;
//! service.publish_local_edit("project-1", &item).await?;
//! println!("{:?}", service.status().await?);
//! service.shutdown().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Wire and sockets
pub mod engine;
pub mod protocol;
pub mod session;
pub mod socket;

// Discovery and sync
pub mod merge;
pub mod peers;
pub mod registry;
pub mod scheduler;

// Service
pub mod collaborators;
pub mod config;
pub mod error;
pub mod service;
pub mod telemetry;

// =============================================================================
// Re-exports
// =============================================================================

pub use collaborators::{
    BackupHook, CacheStore, MemoryCacheStore, MemorySubscriptions, NoOpBackup, NoOpListener,
    PeerEventListener, ProjectSubscription, SqliteCacheStore, SubscriptionRegistry, SyncStateUpdate,
};
pub use config::{
    ChangeLogConfig, DeviceConfig, DiscoverySettings, NetworkSettings, SchedulerSettings, SyncConfig,
};
pub use engine::ConnectionEngine;
pub use error::{SyncError, SyncResult};
pub use merge::{MergeEngine, MergeReport};
pub use peers::PeerTable;
pub use protocol::{ChangeNotice, FrameDecoder, MessageType, PeerMessage};
pub use registry::{HeartbeatReport, PeerRegistry};
pub use scheduler::{SyncJob, SyncQueue, SyncScheduler};
pub use service::{ProjectStatus, ServiceStatus, SyncService, SyncServiceBuilder};
pub use session::{
    Connection, ConnectionId, ConnectionState, Direction, Registration, SessionInfo, SessionTable,
};
