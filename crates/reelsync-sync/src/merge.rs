//! # Merge Engine
//!
//! One merge pass computes a project's authoritative state from every
//! device's change log and applies what the local cache is missing.
//!
//! ## Merge Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Merge Pass (one project)                        │
//! │                                                                         │
//! │  status → Syncing                                                      │
//! │  first sync? ──► BackupHook (failure logged, pass continues)           │
//! │                                                                         │
//! │  1. cache.load_items                                                   │
//! │  2. change logs (active + archive, legacy fallback)                    │
//! │       expected-change filter only if cache non-empty AND not first     │
//! │       sync; otherwise the full history is read                         │
//! │  3. fold (last-writer-wins, device id breaks ties) + diff vs cache     │
//! │  4. remote additions + updates → one bulk upsert → notify_changed      │
//! │  5. status → Synced (item count, time) │ Error on failure              │
//! │  6. compact own active segment if over size / age threshold            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Local edits never flow through here; they are appended to the editing
//! device's own log at edit time.

use std::sync::Arc;

use tracing::{debug, info, warn};

use reelsync_core::{diff, fold_entries, now_millis, SyncStatus};
use reelsync_db::{ChangeLogStore, ExpectedChange};

use crate::collaborators::{
    BackupHook, CacheStore, ProjectSubscription, SubscriptionRegistry, SyncStateUpdate,
};
use crate::error::{SyncError, SyncResult};

/// What one merge pass saw and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub project_id: String,
    /// Change-log entries read (after any filter).
    pub entries_read: usize,
    pub remote_additions: usize,
    pub remote_updates: usize,
    pub local_ahead: usize,
    pub local_only: usize,
    pub unchanged: usize,
    /// Items written to the cache.
    pub applied: usize,
    /// Items in the cache once the pass is applied.
    pub item_count: usize,
    pub first_sync: bool,
    /// True if the expected-change filter was applied.
    pub filtered: bool,
    /// With the filter applied: whether the expected change was visible.
    pub expected_seen: Option<bool>,
    pub compacted: bool,
}

impl MergeReport {
    /// True if an expected change was looked for and not found.
    pub fn expected_missing(&self) -> bool {
        self.expected_seen == Some(false)
    }
}

/// Runs merge passes against injected collaborators.
pub struct MergeEngine {
    device_id: String,
    store: Arc<ChangeLogStore>,
    cache: Arc<dyn CacheStore>,
    subscriptions: Arc<dyn SubscriptionRegistry>,
    backup: Arc<dyn BackupHook>,
}

impl MergeEngine {
    pub fn new(
        device_id: impl Into<String>,
        store: Arc<ChangeLogStore>,
        cache: Arc<dyn CacheStore>,
        subscriptions: Arc<dyn SubscriptionRegistry>,
        backup: Arc<dyn BackupHook>,
    ) -> Self {
        MergeEngine {
            device_id: device_id.into(),
            store,
            cache,
            subscriptions,
            backup,
        }
    }

    /// Runs one pass for `project_id`, recording the outcome in the
    /// subscription registry.
    ///
    /// A failure leaves the project in `Error`; the next tick retries it.
    pub async fn run(
        &self,
        project_id: &str,
        expected: Option<ExpectedChange>,
    ) -> SyncResult<MergeReport> {
        let subscription = self
            .subscriptions
            .active_projects()
            .await?
            .into_iter()
            .find(|p| p.project_id == project_id)
            .ok_or_else(|| SyncError::Collaborator {
                collaborator: "subscription registry",
                message: format!("project {} is not subscribed", project_id),
            })?;

        self.subscriptions
            .update_sync_state(project_id, SyncStateUpdate::status(SyncStatus::Syncing))
            .await?;

        match self.pass(&subscription, expected).await {
            Ok(report) => {
                self.subscriptions
                    .update_sync_state(project_id, SyncStateUpdate::synced(now_millis(), report.item_count))
                    .await?;
                Ok(report)
            }
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "Merge pass failed");
                if let Err(update_err) = self
                    .subscriptions
                    .update_sync_state(project_id, SyncStateUpdate::failed(e.to_string()))
                    .await
                {
                    warn!(project_id = %project_id, error = %update_err, "Failed to record sync error");
                }
                Err(e)
            }
        }
    }

    async fn pass(
        &self,
        subscription: &ProjectSubscription,
        expected: Option<ExpectedChange>,
    ) -> SyncResult<MergeReport> {
        let project_id = subscription.project_id.as_str();
        let root = subscription.shared_root.clone();
        let first_sync = !subscription.first_sync_done;

        if first_sync {
            info!(project_id = %project_id, "First sync, running backup");
            if let Err(e) = self.backup.backup_before_first_sync(project_id, &root).await {
                warn!(project_id = %project_id, error = %e, "First-sync backup failed");
            }
        }

        let local = self.cache.load_items(project_id).await?;

        // An empty or never-synced cache must see the whole history.
        let filter = expected.filter(|_| !local.is_empty() && !first_sync);
        let filtered = filter.is_some();

        let store = Arc::clone(&self.store);
        let read_root = root.clone();
        let snapshot =
            tokio::task::spawn_blocking(move || store.read_all(&read_root, filter.as_ref())).await??;

        let entries_read = snapshot.entries.len();
        let merged = fold_entries(snapshot.entries);
        let changes = diff(&local, &merged);

        let mut report = MergeReport {
            project_id: project_id.to_string(),
            entries_read,
            remote_additions: changes.remote_additions.len(),
            remote_updates: changes.remote_updates.len(),
            local_ahead: changes.local_ahead.len(),
            local_only: changes.local_only.len(),
            unchanged: changes.unchanged,
            item_count: local.len() + changes.remote_additions.len(),
            first_sync,
            filtered,
            expected_seen: snapshot.expected_seen,
            ..Default::default()
        };

        if !changes.is_noop() {
            let items = changes.into_changes();
            report.applied = self.cache.bulk_upsert(project_id, &items).await?;
            self.cache.notify_changed(project_id);
        }

        if first_sync {
            self.subscriptions.mark_first_sync_done(project_id).await?;
        }

        let store = Arc::clone(&self.store);
        let device_id = self.device_id.clone();
        let compaction =
            tokio::task::spawn_blocking(move || store.compact_if_needed(&root, &device_id, now_millis())).await?;
        match compaction {
            Ok(compacted) => report.compacted = compacted.is_some(),
            Err(e) => warn!(project_id = %project_id, error = %e, "Change-log compaction failed"),
        }

        debug!(
            project_id = %project_id,
            entries = report.entries_read,
            additions = report.remote_additions,
            updates = report.remote_updates,
            local_ahead = report.local_ahead,
            applied = report.applied,
            "Merge pass complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryCacheStore, MemorySubscriptions, NoOpBackup};
    use async_trait::async_trait;
    use reelsync_core::{ChangeLogEntry, Item};
    use reelsync_db::ChangeLogSettings;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Device {
        engine: MergeEngine,
        cache: Arc<MemoryCacheStore>,
        subscriptions: Arc<MemorySubscriptions>,
    }

    fn device(id: &str, root: &Path, store: Arc<ChangeLogStore>) -> Device {
        let cache = Arc::new(MemoryCacheStore::new());
        let subscriptions = Arc::new(MemorySubscriptions::new());
        subscriptions.subscribe(ProjectSubscription::new("p", root));
        Device {
            engine: MergeEngine::new(
                id,
                store,
                cache.clone(),
                subscriptions.clone(),
                Arc::new(NoOpBackup),
            ),
            cache,
            subscriptions,
        }
    }

    fn store() -> Arc<ChangeLogStore> {
        Arc::new(ChangeLogStore::new(ChangeLogSettings::default()))
    }

    fn edit(store: &ChangeLogStore, root: &Path, path: &str, status: &str, ts: i64, device: &str) -> Item {
        let item = Item::new(path, "shot", path, format!("status={status}"), device, ts);
        store
            .append(root, &ChangeLogEntry::for_edit(&item, device, ts))
            .unwrap();
        item
    }

    #[tokio::test]
    async fn test_offline_device_adopts_then_wins() {
        let share = TempDir::new().unwrap();
        let root = share.path();
        let store = store();
        let a = device("A", root, store.clone());
        let b = device("B", root, store.clone());

        // A edits while B is offline.
        let item = edit(&store, root, "shots/010", "WIP", 1000, "A");
        a.cache.put("p", item);

        let report = b.engine.run("p", None).await.unwrap();
        assert_eq!(report.remote_additions, 1);
        assert_eq!(b.cache.get("p", "shots/010").unwrap().metadata, "status=WIP");

        // B edits the same shot later.
        let later = edit(&store, root, "shots/010", "Final", 1500, "B");
        b.cache.put("p", later);

        let report = a.engine.run("p", None).await.unwrap();
        assert_eq!(report.remote_updates, 1);
        let adopted = a.cache.get("p", "shots/010").unwrap();
        assert_eq!(adopted.metadata, "status=Final");
        assert_eq!(adopted.modified_by, "B");
    }

    #[tokio::test]
    async fn test_devices_converge() {
        let share = TempDir::new().unwrap();
        let root = share.path();
        let store = store();
        let a = device("A", root, store.clone());
        let b = device("B", root, store.clone());

        edit(&store, root, "shots/010", "WIP", 1000, "A");
        edit(&store, root, "shots/020", "Review", 1100, "B");
        edit(&store, root, "shots/010", "Tie-A", 2000, "A");
        edit(&store, root, "shots/010", "Tie-B", 2000, "B");

        a.engine.run("p", None).await.unwrap();
        b.engine.run("p", None).await.unwrap();

        for path in ["shots/010", "shots/020"] {
            assert_eq!(a.cache.get("p", path), b.cache.get("p", path));
        }
        assert_eq!(a.cache.get("p", "shots/010").unwrap().metadata, "status=Tie-B");
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let share = TempDir::new().unwrap();
        let root = share.path();
        let store = store();
        let b = device("B", root, store.clone());
        edit(&store, root, "shots/010", "WIP", 1000, "A");

        b.engine.run("p", None).await.unwrap();
        let writes = b.cache.write_count();
        let notifications = b.cache.notifications().len();

        let report = b.engine.run("p", None).await.unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.unchanged, 1);
        assert_eq!(b.cache.write_count(), writes);
        assert_eq!(b.cache.notifications().len(), notifications);
    }

    #[tokio::test]
    async fn test_merged_count_is_project_size() {
        let share = TempDir::new().unwrap();
        let root = share.path();
        let store = store();
        let b = device("B", root, store.clone());
        edit(&store, root, "shots/010", "WIP", 1000, "A");
        edit(&store, root, "shots/020", "WIP", 1100, "A");
        b.cache.put("p", Item::new("shots/030", "shot", "shots/030", "", "B", 1200));

        let report = b.engine.run("p", None).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.item_count, 3);
        assert_eq!(b.subscriptions.get("p").unwrap().merged_count, 3);

        // Nothing new: the count still describes the whole project.
        let report = b.engine.run("p", None).await.unwrap();
        assert_eq!(report.applied, 0);
        let state = b.subscriptions.get("p").unwrap();
        assert_eq!(state.merged_count, 3);
        assert_eq!(state.status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_local_ahead_is_kept() {
        let share = TempDir::new().unwrap();
        let root = share.path();
        let store = store();
        let b = device("B", root, store.clone());
        edit(&store, root, "shots/010", "WIP", 1000, "A");
        b.cache.put("p", Item::new("shots/010", "shot", "shots/010", "status=Mine", "B", 3000));
        b.cache.put("p", Item::new("shots/030", "shot", "shots/030", "", "B", 3000));

        let report = b.engine.run("p", None).await.unwrap();
        assert_eq!(report.local_ahead, 1);
        assert_eq!(report.local_only, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(b.cache.get("p", "shots/010").unwrap().metadata, "status=Mine");
    }

    #[tokio::test]
    async fn test_filter_ignored_on_first_sync() {
        let share = TempDir::new().unwrap();
        let root = share.path();
        let store = store();
        let b = device("B", root, store.clone());
        edit(&store, root, "shots/010", "WIP", 1000, "A");
        edit(&store, root, "shots/020", "WIP", 5000, "A");

        let expected = ExpectedChange {
            device_id: "A".into(),
            min_timestamp: 5000,
        };
        let report = b.engine.run("p", Some(expected.clone())).await.unwrap();
        assert!(report.first_sync);
        assert!(!report.filtered);
        assert_eq!(report.entries_read, 2);

        // Once synced with a populated cache the filter applies.
        edit(&store, root, "shots/030", "WIP", 6000, "A");
        let report = b
            .engine
            .run(
                "p",
                Some(ExpectedChange {
                    device_id: "A".into(),
                    min_timestamp: 6000,
                }),
            )
            .await
            .unwrap();
        assert!(report.filtered);
        assert_eq!(report.entries_read, 1);
        assert_eq!(report.expected_seen, Some(true));

        let report = b
            .engine
            .run(
                "p",
                Some(ExpectedChange {
                    device_id: "A".into(),
                    min_timestamp: 9000,
                }),
            )
            .await
            .unwrap();
        assert!(report.expected_missing());
    }

    struct CountingBackup(AtomicUsize);

    #[async_trait]
    impl BackupHook for CountingBackup {
        async fn backup_before_first_sync(&self, _project_id: &str, _root: &Path) -> SyncResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Internal("backup volume full".into()))
        }
    }

    #[tokio::test]
    async fn test_backup_runs_once_and_failure_is_not_fatal() {
        let share = TempDir::new().unwrap();
        let root = share.path();
        let store = store();
        let cache = Arc::new(MemoryCacheStore::new());
        let subscriptions = Arc::new(MemorySubscriptions::new());
        subscriptions.subscribe(ProjectSubscription::new("p", root));
        let backup = Arc::new(CountingBackup(AtomicUsize::new(0)));
        let engine = MergeEngine::new("B", store, cache, subscriptions.clone(), backup.clone());

        engine.run("p", None).await.unwrap();
        engine.run("p", None).await.unwrap();

        assert_eq!(backup.0.load(Ordering::SeqCst), 1);
        let state = subscriptions.get("p").unwrap();
        assert!(state.first_sync_done);
        assert_eq!(state.status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_unknown_project_fails() {
        let share = TempDir::new().unwrap();
        let b = device("B", share.path(), store());
        let err = b.engine.run("missing", None).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(b.subscriptions.get("p").unwrap().status, SyncStatus::Pending);
    }
}
