//! # Last-Writer-Wins Merge
//!
//! Pure functions that fold per-device change logs into one remote view and
//! diff that view against the local cache.
//!
//! ## Conflict Rule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Last-Writer-Wins (per item path)                    │
//! │                                                                         │
//! │  Compare (timestamp, device_id):                                       │
//! │                                                                         │
//! │    1000/"A"  vs  1500/"B"   →  1500/"B" wins (newer timestamp)         │
//! │    1000/"A"  vs  1000/"B"   →  1000/"B" wins (greater device id)       │
//! │    1000/"A"  vs  1000/"A"   →  same version, no-op                     │
//! │                                                                         │
//! │  No shared clock authority is needed: every device evaluates the       │
//! │  same total order and converges on the same winner.                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Diff Categories
//! | Remote | Local | Outcome |
//! |---|---|---|
//! | present | absent | remote addition |
//! | newer | older | remote update (accept remote) |
//! | older | newer | local-ahead (already in own log) |
//! | absent | present | local-only (already in own log) |
//! | same version | same version | unchanged |

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::types::{ChangeLogEntry, Item};

// =============================================================================
// Version
// =============================================================================

/// Total order used for conflict resolution.
///
/// Field order matters: the derived `Ord` compares `timestamp` first and
/// falls back to the lexicographic device id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Writer's wall-clock timestamp (Unix ms).
    pub timestamp: i64,
    /// Writer device.
    pub device_id: String,
}

impl Version {
    pub fn new(timestamp: i64, device_id: &str) -> Self {
        Version {
            timestamp,
            device_id: device_id.to_string(),
        }
    }
}

// =============================================================================
// Folding Change Logs
// =============================================================================

/// Folds change-log entries from any number of devices into the winning
/// entry per item path.
///
/// The result is independent of input order.
pub fn fold_entries<I>(entries: I) -> BTreeMap<String, ChangeLogEntry>
where
    I: IntoIterator<Item = ChangeLogEntry>,
{
    let mut merged: BTreeMap<String, ChangeLogEntry> = BTreeMap::new();

    for entry in entries {
        let replace = match merged.get(&entry.item_path) {
            Some(current) => supersedes(&entry, current),
            None => true,
        };
        if replace {
            merged.insert(entry.item_path.clone(), entry);
        }
    }

    merged
}

/// Returns true if `candidate` should replace `current`.
fn supersedes(candidate: &ChangeLogEntry, current: &ChangeLogEntry) -> bool {
    match candidate.version().cmp(&current.version()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        // Same writer and timestamp. Snapshots should be identical; if a
        // rewritten log disagrees, order by content so the pick is stable.
        Ordering::Equal => content_key(&candidate.item) > content_key(&current.item),
    }
}

fn content_key(item: &Item) -> (&str, &str, &str, i64) {
    (&item.metadata, &item.name, &item.item_type, item.created_at)
}

// =============================================================================
// Diff
// =============================================================================

/// Outcome of comparing the merged remote view with the local cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeDiff {
    /// Items present remotely but not in the local cache.
    pub remote_additions: Vec<Item>,
    /// Items whose remote version beats the cached version.
    pub remote_updates: Vec<Item>,
    /// Paths where the cached version is strictly newer.
    pub local_ahead: Vec<String>,
    /// Paths only present in the local cache.
    pub local_only: Vec<String>,
    /// Paths with identical versions on both sides.
    pub unchanged: usize,
}

impl MergeDiff {
    /// Returns true if nothing needs to be written to the cache.
    pub fn is_noop(&self) -> bool {
        self.remote_additions.is_empty() && self.remote_updates.is_empty()
    }

    /// Number of items that will be written to the cache.
    pub fn apply_count(&self) -> usize {
        self.remote_additions.len() + self.remote_updates.len()
    }

    /// Consumes the diff, returning every item to write to the cache.
    pub fn into_changes(self) -> Vec<Item> {
        let mut changes = self.remote_additions;
        changes.extend(self.remote_updates);
        changes
    }
}

/// Diffs the merged remote view against the local cache.
pub fn diff(local: &[Item], remote: &BTreeMap<String, ChangeLogEntry>) -> MergeDiff {
    let local_by_path: HashMap<&str, &Item> =
        local.iter().map(|item| (item.path.as_str(), item)).collect();

    let mut result = MergeDiff::default();

    for (path, entry) in remote {
        match local_by_path.get(path.as_str()) {
            None => result.remote_additions.push(entry.clone().into_item()),
            Some(cached) => match entry.version().cmp(&cached.version()) {
                Ordering::Greater => result.remote_updates.push(entry.clone().into_item()),
                Ordering::Less => result.local_ahead.push(path.clone()),
                Ordering::Equal => result.unchanged += 1,
            },
        }
    }

    for item in local {
        if !remote.contains_key(&item.path) {
            result.local_only.push(item.path.clone());
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, status: &str, ts: i64, device: &str) -> ChangeLogEntry {
        let item = Item::new(path, "shot", path, format!(r#"{{"status":"{status}"}}"#), device, ts);
        ChangeLogEntry::for_edit(&item, device, ts)
    }

    fn apply(cache: &mut Vec<Item>, changes: Vec<Item>) {
        for change in changes {
            cache.retain(|i| i.path != change.path);
            cache.push(change);
        }
        cache.sort_by(|a, b| a.path.cmp(&b.path));
    }

    #[test]
    fn test_version_orders_by_timestamp_then_device() {
        assert!(Version::new(1500, "A") > Version::new(1000, "Z"));
        assert!(Version::new(1000, "B") > Version::new(1000, "A"));
    }

    #[test]
    fn test_tie_break_prefers_greater_device_regardless_of_order() {
        let a = entry("shots/010", "from-a", 1000, "A");
        let b = entry("shots/010", "from-b", 1000, "B");

        let ab = fold_entries(vec![a.clone(), b.clone()]);
        let ba = fold_entries(vec![b, a]);

        assert_eq!(ab["shots/010"].device_id, "B");
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_diff_categories() {
        let local = vec![
            entry("shots/ahead", "local", 2000, "A").into_item(),
            entry("shots/behind", "local", 1000, "A").into_item(),
            entry("shots/local-only", "local", 1000, "A").into_item(),
            entry("shots/same", "same", 1000, "A").into_item(),
        ];
        let remote = fold_entries(vec![
            entry("shots/ahead", "remote", 1500, "B"),
            entry("shots/behind", "remote", 1200, "B"),
            entry("shots/new", "remote", 1100, "B"),
            entry("shots/same", "same", 1000, "A"),
        ]);

        let d = diff(&local, &remote);
        assert_eq!(d.remote_additions.len(), 1);
        assert_eq!(d.remote_additions[0].path, "shots/new");
        assert_eq!(d.remote_updates.len(), 1);
        assert_eq!(d.remote_updates[0].path, "shots/behind");
        assert_eq!(d.local_ahead, vec!["shots/ahead".to_string()]);
        assert_eq!(d.local_only, vec!["shots/local-only".to_string()]);
        assert_eq!(d.unchanged, 1);
        assert_eq!(d.apply_count(), 2);
    }

    #[test]
    fn test_equal_timestamp_greater_device_is_update() {
        let local = vec![entry("shots/010", "a", 1000, "A").into_item()];
        let remote = fold_entries(vec![entry("shots/010", "b", 1000, "B")]);
        let d = diff(&local, &remote);
        assert_eq!(d.remote_updates.len(), 1);
        assert_eq!(d.remote_updates[0].modified_by, "B");
    }

    #[test]
    fn test_second_pass_is_noop() {
        let mut cache = Vec::new();
        let logs = vec![
            entry("shots/010", "WIP", 1000, "A"),
            entry("shots/020", "Done", 1200, "B"),
        ];

        let first = diff(&cache, &fold_entries(logs.clone()));
        apply(&mut cache, first.into_changes());

        let second = diff(&cache, &fold_entries(logs));
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 2);
    }

    #[test]
    fn test_two_devices_converge() {
        let log_a = vec![
            entry("shots/010", "WIP", 1000, "A"),
            entry("shots/020", "Hold", 3000, "A"),
        ];
        let log_b = vec![
            entry("shots/010", "Review", 1500, "B"),
            entry("shots/020", "Final", 2000, "B"),
            entry("shots/030", "New", 2500, "B"),
        ];

        // Device A already holds its own edits, device B its own.
        let mut cache_a: Vec<Item> = log_a.iter().cloned().map(ChangeLogEntry::into_item).collect();
        let mut cache_b: Vec<Item> = log_b.iter().cloned().map(ChangeLogEntry::into_item).collect();

        let union: Vec<ChangeLogEntry> = log_a.iter().chain(log_b.iter()).cloned().collect();
        let merged = fold_entries(union);

        let changes = diff(&cache_a, &merged).into_changes();
        apply(&mut cache_a, changes);
        let changes = diff(&cache_b, &merged).into_changes();
        apply(&mut cache_b, changes);

        assert_eq!(cache_a, cache_b);
        let s010 = cache_a.iter().find(|i| i.path == "shots/010").unwrap();
        assert_eq!(s010.modified_by, "B");
        let s020 = cache_a.iter().find(|i| i.path == "shots/020").unwrap();
        assert_eq!(s020.modified_by, "A");
    }

    #[test]
    fn test_offline_device_scenario() {
        // A writes shots/010 = WIP at 1000.
        let log_a = vec![entry("shots/010", "WIP", 1000, "A")];

        // B, previously offline, merges A's log.
        let mut cache_b = Vec::new();
        let changes = diff(&cache_b, &fold_entries(log_a.clone())).into_changes();
        apply(&mut cache_b, changes);
        assert!(cache_b[0].metadata.contains("WIP"));

        // B edits locally at 1500.
        let log_b = vec![ChangeLogEntry::for_edit(&cache_b[0].clone(), "B", 1500)];

        // A merges B's log and adopts B's value.
        let mut cache_a: Vec<Item> = log_a.iter().cloned().map(ChangeLogEntry::into_item).collect();
        let union: Vec<ChangeLogEntry> = log_a.into_iter().chain(log_b).collect();
        let changes = diff(&cache_a, &fold_entries(union)).into_changes();
        apply(&mut cache_a, changes);

        assert_eq!(cache_a[0].modified_at, 1500);
        assert_eq!(cache_a[0].modified_by, "B");
    }
}
