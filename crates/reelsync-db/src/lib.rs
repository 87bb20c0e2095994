//! # reelsync-db: Storage Layer for ReelSync
//!
//! Everything the sync engine persists. Two kinds of storage live here:
//! files on each project's shared location, visible to every device, and a
//! SQLite cache private to this device.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        ReelSync Storage                                 │
//! │                                                                         │
//! │  reelsync-sync (registry, merge engine)                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  reelsync-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐   ┌───────────────┐   ┌───────────────┐    │   │
//! │  │   │  changelog    │   │   bulletin    │   │    cache      │    │   │
//! │  │   │  per-device   │   │ peers/<id>    │   │  SQLite items │    │   │
//! │  │   │  .jsonl logs  │   │   .json       │   │  + migrations │    │   │
//! │  │   └───────┬───────┘   └───────┬───────┘   └───────┬───────┘    │   │
//! │  │           └──── fsutil (atomic writes) ───┘        │            │   │
//! │  └───────────────────────────────────────────────────┼────────────┘   │
//! │       │                                               │                │
//! │       ▼                                               ▼                │
//! │  <shared project root>/ (SMB, NFS, ...)       local cache.db          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`changelog`] - Per-device change logs, compaction, legacy import
//! - [`bulletin`] - Peer descriptors on the shared location
//! - [`cache`] - SQLite item cache
//! - [`migrations`] - Embedded cache migrations
//! - [`fsutil`] - Atomic file replacement
//! - [`error`] - Storage error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod bulletin;
pub mod cache;
pub mod changelog;
pub mod error;
pub mod fsutil;
pub mod migrations;

// =============================================================================
// Re-exports
// =============================================================================

pub use bulletin::{BulletinBoard, BulletinScan};
pub use cache::{CacheConfig, CacheDb};
pub use changelog::{ChangeLogSettings, ChangeLogStore, CompactionReport, ExpectedChange, LogSnapshot};
pub use error::{DbError, DbResult};
