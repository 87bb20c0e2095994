//! # Domain Types
//!
//! Tracked items, change-log entries and the advisory sync status.
//!
//! ## Type Relationships
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────────┐          ┌─────────────────────────────┐      │
//! │  │        Item         │          │       ChangeLogEntry        │      │
//! │  │  ─────────────────  │ snapshot │  ─────────────────────────  │      │
//! │  │  path (key)         │◄─────────│  item_path                  │      │
//! │  │  item_type, name    │          │  item (full snapshot)       │      │
//! │  │  metadata (opaque)  │          │  timestamp                  │      │
//! │  │  created_at         │          │  device_id (log owner)      │      │
//! │  │  modified_at        │          └─────────────────────────────┘      │
//! │  │  modified_by        │                                               │
//! │  └─────────────────────┘          ┌─────────────────────────────┐      │
//! │                                   │        SyncStatus           │      │
//! │  (project_id, path) identifies    │  Pending → Syncing → Synced │      │
//! │  an item's current state.         │              └──→ Error     │      │
//! │                                   └─────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::merge::Version;

// =============================================================================
// Item
// =============================================================================

/// A tracked entity (shot, asset, ...) within one project.
///
/// The metadata payload belongs to the GUI layer; the engine never looks
/// inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Project-relative path, e.g. `shots/010`.
    pub path: String,

    /// Type tag ("shot", "asset", ...).
    #[serde(rename = "type")]
    pub item_type: String,

    /// Display name.
    pub name: String,

    /// Opaque metadata payload (status, category, notes, ...).
    #[serde(default)]
    pub metadata: String,

    /// Creation time (Unix ms).
    pub created_at: i64,

    /// Last modification time (Unix ms, monotonic per device).
    pub modified_at: i64,

    /// Device that produced the last modification.
    pub modified_by: String,
}

impl Item {
    /// Creates a new item stamped as created and modified at `now` by `device_id`.
    pub fn new(
        path: impl Into<String>,
        item_type: impl Into<String>,
        name: impl Into<String>,
        metadata: impl Into<String>,
        device_id: impl Into<String>,
        now: i64,
    ) -> Self {
        Item {
            path: path.into(),
            item_type: item_type.into(),
            name: name.into(),
            metadata: metadata.into(),
            created_at: now,
            modified_at: now,
            modified_by: device_id.into(),
        }
    }

    /// Returns the last-writer-wins version of this snapshot.
    pub fn version(&self) -> Version {
        Version::new(self.modified_at, &self.modified_by)
    }

    /// Returns a copy re-stamped as modified at `timestamp` by `device_id`.
    pub fn touched(&self, timestamp: i64, device_id: &str) -> Self {
        Item {
            modified_at: timestamp,
            modified_by: device_id.to_string(),
            ..self.clone()
        }
    }

    /// Validates the item path.
    ///
    /// Paths are project-relative: non-empty and never absolute.
    pub fn validate(&self) -> CoreResult<()> {
        if self.path.trim().is_empty() || self.path.starts_with('/') || self.path.starts_with('\\') {
            return Err(CoreError::InvalidItemPath(self.path.clone()));
        }
        if self.modified_by.is_empty() {
            return Err(CoreError::EmptyDeviceId);
        }
        Ok(())
    }
}

// =============================================================================
// Change-Log Entry
// =============================================================================

/// One append-only change-log record.
///
/// Written by exactly one device, into that device's own log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    /// Key of the changed item.
    pub item_path: String,

    /// Full snapshot of the item after the change.
    pub item: Item,

    /// When the change was made (Unix ms, writer's clock).
    pub timestamp: i64,

    /// Writer device.
    pub device_id: String,
}

impl ChangeLogEntry {
    /// Builds an entry for a local edit of `item` by `device_id` at `timestamp`.
    ///
    /// The snapshot is re-stamped so `item.version() == entry.version()`.
    pub fn for_edit(item: &Item, device_id: &str, timestamp: i64) -> Self {
        ChangeLogEntry {
            item_path: item.path.clone(),
            item: item.touched(timestamp, device_id),
            timestamp,
            device_id: device_id.to_string(),
        }
    }

    /// Returns the last-writer-wins version of this entry.
    pub fn version(&self) -> Version {
        Version::new(self.timestamp, &self.device_id)
    }

    /// Checks the entry's key matches its snapshot.
    pub fn validate(&self) -> CoreResult<()> {
        if self.item_path != self.item.path {
            return Err(CoreError::EntryPathMismatch {
                path: self.item_path.clone(),
                snapshot_path: self.item.path.clone(),
            });
        }
        if self.device_id.is_empty() {
            return Err(CoreError::EmptyDeviceId);
        }
        Ok(())
    }

    /// Converts the entry into the item state it represents.
    ///
    /// The entry's timestamp and writer are authoritative over whatever the
    /// snapshot carried.
    pub fn into_item(self) -> Item {
        Item {
            modified_at: self.timestamp,
            modified_by: self.device_id,
            ..self.item
        }
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// Advisory per-project sync state rendered by the GUI.
///
/// ## Transitions
/// ```text
/// Pending ──► Syncing ──► Synced
///                │
///                └──────► Error ──(next tick)──► Syncing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum SyncStatus {
    /// Waiting for a merge pass.
    #[default]
    Pending,
    /// A merge pass is running.
    Syncing,
    /// Last merge pass succeeded.
    Synced,
    /// Last merge pass failed; retried on a later tick.
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Pending => write!(f, "pending"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shot(path: &str) -> Item {
        Item::new(path, "shot", "Shot 010", r#"{"status":"WIP"}"#, "A", 1000)
    }

    #[test]
    fn test_item_json_uses_camel_case() {
        let json = serde_json::to_string(&shot("shots/010")).unwrap();
        assert!(json.contains("\"modifiedAt\":1000"));
        assert!(json.contains("\"modifiedBy\":\"A\""));
        assert!(json.contains("\"type\":\"shot\""));
    }

    #[test]
    fn test_entry_for_edit_restamps_snapshot() {
        let entry = ChangeLogEntry::for_edit(&shot("shots/010"), "B", 1500);
        assert_eq!(entry.item.modified_at, 1500);
        assert_eq!(entry.item.modified_by, "B");
        assert_eq!(entry.version(), entry.item.version());
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn test_entry_path_mismatch_rejected() {
        let mut entry = ChangeLogEntry::for_edit(&shot("shots/010"), "A", 1000);
        entry.item_path = "shots/020".into();
        assert!(entry.validate().is_err());
    }

    #[test]
    fn test_into_item_prefers_entry_version() {
        let mut entry = ChangeLogEntry::for_edit(&shot("shots/010"), "A", 1000);
        entry.item.modified_at = 1;
        let item = entry.into_item();
        assert_eq!(item.modified_at, 1000);
        assert_eq!(item.modified_by, "A");
    }

    #[test]
    fn test_item_path_validation() {
        assert!(shot("shots/010").validate().is_ok());
        assert!(shot("").validate().is_err());
        assert!(shot("/abs/path").validate().is_err());
    }

    #[test]
    fn test_sync_status_display() {
        assert_eq!(SyncStatus::default(), SyncStatus::Pending);
        assert_eq!(SyncStatus::Synced.to_string(), "synced");
    }
}
