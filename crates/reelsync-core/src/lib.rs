//! # reelsync-core: Pure Domain Logic for ReelSync
//!
//! Types and algorithms shared by every layer of the sync engine. Nothing in
//! this crate touches the filesystem, the network or a database.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         ReelSync Layering                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                reelsync-sync (engine, tokio)                    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │            reelsync-db (change logs, bulletin, cache)           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ reelsync-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────────┐   │   │
//! │  │   │  types   │  │  merge   │  │   peer   │  │    clock     │   │   │
//! │  │   │  Item    │  │  LWW     │  │  Record  │  │  now_millis  │   │   │
//! │  │   │  Entry   │  │  diff    │  │  ranking │  │              │   │   │
//! │  │   └──────────┘  └──────────┘  └──────────┘  └──────────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Items, change-log entries, sync status
//! - [`merge`] - Last-writer-wins ordering and the local/remote diff
//! - [`peer`] - Peer records, bulletin-board descriptors, address ranking
//! - [`clock`] - Wall-clock helpers
//! - [`error`] - Domain error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod error;
pub mod merge;
pub mod peer;
pub mod types;

// =============================================================================
// Re-exports
// =============================================================================

pub use clock::{now_millis, CLOCK_SKEW_TOLERANCE_MS, DAY_MS};
pub use error::{CoreError, CoreResult};
pub use merge::{diff, fold_entries, MergeDiff, Version};
pub use peer::{rank_address, sort_addresses, AddressClass, PeerDescriptor, PeerRecord};
pub use types::{ChangeLogEntry, Item, SyncStatus};
