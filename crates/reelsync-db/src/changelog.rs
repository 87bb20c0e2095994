//! # Change-Log Store
//!
//! Per-device, append-only change logs kept on the project's shared
//! location. Every device writes only its own log; every device reads all
//! of them.
//!
//! ## On-Disk Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  <project shared root>/                                                 │
//! │  ├── metadata.json                   legacy full-state file (read-only) │
//! │  └── .reelsync/changes/                                                 │
//! │      ├── <device-A>.jsonl            active segment, one entry per line │
//! │      ├── <device-B>.jsonl                                               │
//! │      └── archive/                                                       │
//! │          ├── <device-A>.1760000000000.jsonl   compacted segment         │
//! │          └── <device-B>.1760100000000.jsonl                             │
//! │                                                                         │
//! │  READ PATH (merge pass)                                                │
//! │  ──────────────────────                                                │
//! │  active + archive segments of every device                             │
//! │       │   (no segments at all? → legacy metadata.json, once)           │
//! │       ▼                                                                 │
//! │  LogSnapshot { entries, segments_read, segments_skipped }              │
//! │                                                                         │
//! │  WRITE PATH (local edit)                                               │
//! │  ───────────────────────                                               │
//! │  own active segment + new line → temp file → atomic rename             │
//! │                                                                         │
//! │  COMPACTION                                                            │
//! │  ──────────                                                            │
//! │  own active segment too long/old → latest entry per path written to    │
//! │  a new archive segment → active segment reset to empty                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Unreadable segments (locked, share offline) are skipped for the pass and
//! picked up on the next one.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use reelsync_core::{fold_entries, ChangeLogEntry, Item, DAY_MS};

use crate::error::{DbError, DbResult};
use crate::fsutil::{is_temp_file, write_atomic};

const SEGMENT_EXTENSION: &str = "jsonl";
const ARCHIVE_DIR: &str = "archive";
const LEGACY_DEVICE_ID: &str = "legacy";

// =============================================================================
// Settings
// =============================================================================

/// Change-log layout and compaction thresholds.
#[derive(Debug, Clone)]
pub struct ChangeLogSettings {
    /// Log directory, relative to the project's shared root.
    pub dir: PathBuf,
    /// Compact once the active segment holds this many entries.
    pub archive_after_entries: usize,
    /// Compact once the oldest active entry is this old (ms).
    pub archive_after_ms: i64,
    /// Legacy full-state file, relative to the project's shared root.
    pub legacy_file: PathBuf,
}

impl Default for ChangeLogSettings {
    fn default() -> Self {
        ChangeLogSettings {
            dir: PathBuf::from(".reelsync/changes"),
            archive_after_entries: 500,
            archive_after_ms: 7 * DAY_MS,
            legacy_file: PathBuf::from("metadata.json"),
        }
    }
}

// =============================================================================
// Read Results
// =============================================================================

/// Optional incremental-read filter for a merge pass.
///
/// Only entries at or after `min_timestamp` are returned, and the snapshot
/// reports whether `device_id` wrote one of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedChange {
    pub device_id: String,
    pub min_timestamp: i64,
}

/// Everything read from a project's change logs in one pass.
#[derive(Debug, Clone, Default)]
pub struct LogSnapshot {
    /// All entries read (after filtering), in no particular order.
    pub entries: Vec<ChangeLogEntry>,
    /// Segments read successfully.
    pub segments_read: usize,
    /// Segments skipped because they could not be read this time.
    pub segments_skipped: usize,
    /// True if entries came from the legacy full-state file.
    pub from_legacy: bool,
    /// With a filter: whether the expected device's change was visible.
    pub expected_seen: Option<bool>,
}

/// Result of compacting this device's active segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Entries that were in the active segment.
    pub archived_entries: usize,
    /// Distinct item paths written to the archive segment.
    pub archived_paths: usize,
    /// The new archive segment.
    pub segment: PathBuf,
}

/// Legacy single-file state: either a list of items or a path → item map.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyState {
    List(Vec<Item>),
    Map(BTreeMap<String, Item>),
}

// =============================================================================
// Change-Log Store
// =============================================================================

/// File-backed change-log store for all projects.
///
/// One instance is shared by the engine; it serializes this device's own
/// writes so appends and compaction never interleave.
pub struct ChangeLogStore {
    settings: ChangeLogSettings,
    write_lock: Mutex<()>,
}

impl ChangeLogStore {
    pub fn new(settings: ChangeLogSettings) -> Self {
        ChangeLogStore {
            settings,
            write_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &ChangeLogSettings {
        &self.settings
    }

    /// Directory holding active segments for the project at `root`.
    pub fn log_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.settings.dir)
    }

    /// Directory holding archived segments.
    pub fn archive_dir(&self, root: &Path) -> PathBuf {
        self.log_dir(root).join(ARCHIVE_DIR)
    }

    /// Active segment path for `device_id`.
    pub fn active_path(&self, root: &Path, device_id: &str) -> PathBuf {
        self.log_dir(root)
            .join(format!("{}.{}", file_stem(device_id), SEGMENT_EXTENSION))
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Appends one entry to the writer's own active segment.
    pub fn append(&self, root: &Path, entry: &ChangeLogEntry) -> DbResult<()> {
        entry.validate()?;

        let _guard = self.write_lock.lock();
        let path = self.active_path(root, &entry.device_id);

        let mut contents = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(DbError::io(&path, e)),
        };
        if !contents.is_empty() && !contents.ends_with(b"\n") {
            contents.push(b'\n');
        }
        serde_json::to_writer(&mut contents, entry)?;
        contents.push(b'\n');

        write_atomic(&path, &contents)?;

        debug!(
            path = %entry.item_path,
            device_id = %entry.device_id,
            timestamp = entry.timestamp,
            "Appended change-log entry"
        );
        Ok(())
    }

    /// Compacts `device_id`'s active segment if it crossed a threshold.
    ///
    /// Returns `None` when no compaction was needed.
    pub fn compact_if_needed(
        &self,
        root: &Path,
        device_id: &str,
        now: i64,
    ) -> DbResult<Option<CompactionReport>> {
        let _guard = self.write_lock.lock();
        let active = self.active_path(root, device_id);

        let entries = match read_segment(&active) {
            Ok(entries) => entries,
            Err(DbError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        let oldest = entries.iter().map(|e| e.timestamp).min();
        let too_long = entries.len() >= self.settings.archive_after_entries;
        let too_old = oldest
            .map(|ts| now.saturating_sub(ts) >= self.settings.archive_after_ms)
            .unwrap_or(false);

        if entries.is_empty() || !(too_long || too_old) {
            return Ok(None);
        }

        let archived_entries = entries.len();
        let folded = fold_entries(entries);

        let mut contents = Vec::new();
        for entry in folded.values() {
            serde_json::to_writer(&mut contents, entry)?;
            contents.push(b'\n');
        }

        let segment = self.archive_dir(root).join(format!(
            "{}.{}.{}",
            file_stem(device_id),
            now,
            SEGMENT_EXTENSION
        ));
        write_atomic(&segment, &contents)?;
        write_atomic(&active, b"")?;

        info!(
            device_id = %device_id,
            archived_entries,
            archived_paths = folded.len(),
            segment = %segment.display(),
            "Compacted change log"
        );

        Ok(Some(CompactionReport {
            archived_entries,
            archived_paths: folded.len(),
            segment,
        }))
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Reads every device's active and archived segments for the project.
    ///
    /// Falls back to the legacy full-state file when no per-device segment
    /// exists yet.
    pub fn read_all(&self, root: &Path, filter: Option<&ExpectedChange>) -> DbResult<LogSnapshot> {
        let mut segments = list_segments(&self.log_dir(root));
        segments.extend(list_segments(&self.archive_dir(root)));

        let mut snapshot = LogSnapshot::default();

        if segments.is_empty() {
            if let Some(entries) = self.read_legacy(root)? {
                snapshot.entries = entries;
                snapshot.from_legacy = true;
            }
        } else {
            for segment in &segments {
                match read_segment(segment) {
                    Ok(entries) => {
                        snapshot.segments_read += 1;
                        snapshot.entries.extend(entries);
                    }
                    Err(e) => {
                        warn!(segment = %segment.display(), error = %e, "Skipping unreadable change-log segment");
                        snapshot.segments_skipped += 1;
                    }
                }
            }
        }

        if let Some(filter) = filter {
            snapshot.entries.retain(|e| e.timestamp >= filter.min_timestamp);
            snapshot.expected_seen = Some(
                snapshot
                    .entries
                    .iter()
                    .any(|e| e.device_id == filter.device_id),
            );
        }

        debug!(
            root = %root.display(),
            entries = snapshot.entries.len(),
            segments_read = snapshot.segments_read,
            segments_skipped = snapshot.segments_skipped,
            from_legacy = snapshot.from_legacy,
            "Read change logs"
        );

        Ok(snapshot)
    }

    /// Returns true if any per-device segment exists for the project.
    pub fn has_device_logs(&self, root: &Path) -> bool {
        !list_segments(&self.log_dir(root)).is_empty()
            || !list_segments(&self.archive_dir(root)).is_empty()
    }

    fn read_legacy(&self, root: &Path) -> DbResult<Option<Vec<ChangeLogEntry>>> {
        let path = root.join(&self.settings.legacy_file);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DbError::io(&path, e)),
        };

        let state: LegacyState =
            serde_json::from_slice(&bytes).map_err(|e| DbError::MalformedRecord {
                path: path.clone(),
                message: e.to_string(),
            })?;

        let items: Vec<Item> = match state {
            LegacyState::List(items) => items,
            LegacyState::Map(map) => map
                .into_iter()
                .map(|(path, mut item)| {
                    if item.path.is_empty() {
                        item.path = path;
                    }
                    item
                })
                .collect(),
        };

        let entries: Vec<ChangeLogEntry> = items
            .into_iter()
            .map(|item| {
                let device_id = if item.modified_by.is_empty() {
                    LEGACY_DEVICE_ID.to_string()
                } else {
                    item.modified_by.clone()
                };
                ChangeLogEntry {
                    item_path: item.path.clone(),
                    timestamp: item.modified_at,
                    device_id,
                    item,
                }
            })
            .filter(|entry| entry.validate().is_ok())
            .collect();

        info!(path = %path.display(), items = entries.len(), "Migrating legacy metadata file");
        Ok(Some(entries))
    }
}

// =============================================================================
// Segment Helpers
// =============================================================================

/// Device ids become file names; path separators must not survive.
fn file_stem(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}

fn list_segments(dir: &Path) -> Vec<PathBuf> {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut segments: Vec<PathBuf> = read_dir
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && !is_temp_file(path)
                && path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION)
        })
        .collect();
    segments.sort();
    segments
}

/// Reads one segment. Malformed lines are skipped, I/O failures are errors.
fn read_segment(path: &Path) -> DbResult<Vec<ChangeLogEntry>> {
    let contents = fs::read_to_string(path).map_err(|e| DbError::io(path, e))?;

    let mut entries = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ChangeLogEntry>(line) {
            Ok(entry) if entry.validate().is_ok() => entries.push(entry),
            Ok(_) => warn!(segment = %path.display(), line = line_no + 1, "Skipping invalid change-log entry"),
            Err(e) => warn!(segment = %path.display(), line = line_no + 1, error = %e, "Skipping malformed change-log line"),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(path: &str, status: &str, ts: i64, device: &str) -> ChangeLogEntry {
        let item = Item::new(path, "shot", path, format!("status={status}"), device, ts);
        ChangeLogEntry::for_edit(&item, device, ts)
    }

    fn store() -> ChangeLogStore {
        ChangeLogStore::new(ChangeLogSettings {
            archive_after_entries: 3,
            ..Default::default()
        })
    }

    #[test]
    fn test_append_and_read_all_devices() {
        let share = tempfile::tempdir().unwrap();
        let store = store();

        store.append(share.path(), &edit("shots/010", "WIP", 1000, "A")).unwrap();
        store.append(share.path(), &edit("shots/020", "WIP", 1100, "A")).unwrap();
        store.append(share.path(), &edit("shots/010", "Done", 1500, "B")).unwrap();

        let snapshot = store.read_all(share.path(), None).unwrap();
        assert_eq!(snapshot.entries.len(), 3);
        assert_eq!(snapshot.segments_read, 2);
        assert!(!snapshot.from_legacy);
        assert!(store.has_device_logs(share.path()));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let share = tempfile::tempdir().unwrap();
        let store = store();
        store.append(share.path(), &edit("shots/010", "WIP", 1000, "A")).unwrap();

        let path = store.active_path(share.path(), "A");
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("{not json\n");
        fs::write(&path, contents).unwrap();

        let snapshot = store.read_all(share.path(), None).unwrap();
        assert_eq!(snapshot.entries.len(), 1);
    }

    #[test]
    fn test_filter_keeps_recent_and_reports_expected() {
        let share = tempfile::tempdir().unwrap();
        let store = store();
        store.append(share.path(), &edit("shots/010", "WIP", 1000, "A")).unwrap();
        store.append(share.path(), &edit("shots/020", "WIP", 2000, "B")).unwrap();

        let seen = store
            .read_all(
                share.path(),
                Some(&ExpectedChange { device_id: "B".into(), min_timestamp: 1500 }),
            )
            .unwrap();
        assert_eq!(seen.entries.len(), 1);
        assert_eq!(seen.expected_seen, Some(true));

        let missing = store
            .read_all(
                share.path(),
                Some(&ExpectedChange { device_id: "C".into(), min_timestamp: 1500 }),
            )
            .unwrap();
        assert_eq!(missing.expected_seen, Some(false));
    }

    #[test]
    fn test_compaction_moves_entries_to_archive() {
        let share = tempfile::tempdir().unwrap();
        let store = store();
        store.append(share.path(), &edit("shots/010", "WIP", 1000, "A")).unwrap();
        assert!(store.compact_if_needed(share.path(), "A", 2000).unwrap().is_none());

        store.append(share.path(), &edit("shots/010", "Review", 1100, "A")).unwrap();
        store.append(share.path(), &edit("shots/020", "WIP", 1200, "A")).unwrap();

        let report = store.compact_if_needed(share.path(), "A", 2000).unwrap().unwrap();
        assert_eq!(report.archived_entries, 3);
        assert_eq!(report.archived_paths, 2);

        let active = fs::read_to_string(store.active_path(share.path(), "A")).unwrap();
        assert!(active.is_empty());

        // Archived segments stay readable by the merge step.
        let merged = fold_entries(store.read_all(share.path(), None).unwrap().entries);
        assert_eq!(merged.len(), 2);
        assert!(merged["shots/010"].item.metadata.contains("Review"));
    }

    #[test]
    fn test_compaction_by_age() {
        let share = tempfile::tempdir().unwrap();
        let store = store();
        store.append(share.path(), &edit("shots/010", "WIP", 1000, "A")).unwrap();

        let now = 1000 + 8 * DAY_MS;
        assert!(store.compact_if_needed(share.path(), "A", now).unwrap().is_some());
    }

    #[test]
    fn test_legacy_file_read_when_no_segments() {
        let share = tempfile::tempdir().unwrap();
        let store = store();

        let legacy = vec![Item::new("shots/010", "shot", "010", "status=WIP", "", 900)];
        fs::write(
            share.path().join("metadata.json"),
            serde_json::to_vec(&legacy).unwrap(),
        )
        .unwrap();

        let snapshot = store.read_all(share.path(), None).unwrap();
        assert!(snapshot.from_legacy);
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].device_id, "legacy");

        // Once a per-device log exists, the legacy file is ignored.
        store.append(share.path(), &edit("shots/020", "WIP", 1000, "A")).unwrap();
        let snapshot = store.read_all(share.path(), None).unwrap();
        assert!(!snapshot.from_legacy);
        assert_eq!(snapshot.entries.len(), 1);
    }

    #[test]
    fn test_file_stem_strips_separators() {
        assert_eq!(file_stem("a/b\\c:d"), "a_b_c_d");
    }
}
