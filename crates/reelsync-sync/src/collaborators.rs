//! # Host Collaborators
//!
//! Contracts the host application provides to the engine, passed in at
//! construction and held as trait objects.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Engine ⇄ Host Contracts                             │
//! │                                                                         │
//! │  CacheStore            read / bulk-upsert cached items, notify UI      │
//! │  SubscriptionRegistry  active projects, per-project sync bookkeeping   │
//! │  BackupHook            one-time backup before a project's first sync   │
//! │  PeerEventListener     peer connected / disconnected / change notice   │
//! │                        (called outside every engine lock)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! In-memory implementations ship for tests and small embedders;
//! [`SqliteCacheStore`] backs the cache with the local SQLite database.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use reelsync_core::{Item, PeerRecord, SyncStatus};
use reelsync_db::CacheDb;

use crate::error::SyncResult;
use crate::protocol::ChangeNotice;

// =============================================================================
// Contracts
// =============================================================================

/// Local cache of items per project.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Every cached item of the project.
    async fn load_items(&self, project_id: &str) -> SyncResult<Vec<Item>>;

    /// Inserts or replaces `items` as one atomic unit. Returns rows written.
    async fn bulk_upsert(&self, project_id: &str, items: &[Item]) -> SyncResult<usize>;

    /// Newest `modified_at` in the project's cache.
    async fn latest_modified(&self, project_id: &str) -> SyncResult<Option<i64>>;

    /// Tells observers the project's items changed.
    fn notify_changed(&self, project_id: &str);
}

/// One subscribed project and its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSubscription {
    pub project_id: String,
    /// Project directory on the shared store.
    pub shared_root: PathBuf,
    /// Completion time of the last successful merge pass (Unix ms).
    pub last_sync_ms: Option<i64>,
    /// Items applied by the last successful merge pass.
    pub merged_count: usize,
    pub status: SyncStatus,
    pub first_sync_done: bool,
}

impl ProjectSubscription {
    pub fn new(project_id: impl Into<String>, shared_root: impl Into<PathBuf>) -> Self {
        ProjectSubscription {
            project_id: project_id.into(),
            shared_root: shared_root.into(),
            last_sync_ms: None,
            merged_count: 0,
            status: SyncStatus::Pending,
            first_sync_done: false,
        }
    }
}

/// Bookkeeping change reported after each merge-pass transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateUpdate {
    pub status: SyncStatus,
    pub last_sync_ms: Option<i64>,
    pub merged_count: Option<usize>,
    pub error: Option<String>,
}

impl SyncStateUpdate {
    pub fn status(status: SyncStatus) -> Self {
        SyncStateUpdate {
            status,
            last_sync_ms: None,
            merged_count: None,
            error: None,
        }
    }

    pub fn synced(at: i64, merged_count: usize) -> Self {
        SyncStateUpdate {
            status: SyncStatus::Synced,
            last_sync_ms: Some(at),
            merged_count: Some(merged_count),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        SyncStateUpdate {
            status: SyncStatus::Error,
            last_sync_ms: None,
            merged_count: None,
            error: Some(error.into()),
        }
    }
}

/// The host's list of subscribed projects.
#[async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    async fn active_projects(&self) -> SyncResult<Vec<ProjectSubscription>>;

    async fn update_sync_state(&self, project_id: &str, update: SyncStateUpdate) -> SyncResult<()>;

    async fn mark_first_sync_done(&self, project_id: &str) -> SyncResult<()>;
}

/// Backup taken once, before a project's first merge pass.
#[async_trait]
pub trait BackupHook: Send + Sync {
    async fn backup_before_first_sync(&self, project_id: &str, shared_root: &Path) -> SyncResult<()>;
}

/// Peer and notification events. Every method defaults to a no-op.
pub trait PeerEventListener: Send + Sync {
    fn on_peer_connected(&self, _peer: &PeerRecord) {}

    fn on_peer_disconnected(&self, _device_id: &str) {}

    fn on_change_notify(&self, _notice: &ChangeNotice) {}
}

// =============================================================================
// No-Op Implementations
// =============================================================================

/// Backup hook that does nothing.
pub struct NoOpBackup;

#[async_trait]
impl BackupHook for NoOpBackup {
    async fn backup_before_first_sync(&self, _project_id: &str, _shared_root: &Path) -> SyncResult<()> {
        Ok(())
    }
}

/// Listener that ignores every event.
pub struct NoOpListener;

impl PeerEventListener for NoOpListener {}

// =============================================================================
// In-Memory Cache
// =============================================================================

/// Cache held in process memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    projects: Mutex<HashMap<String, BTreeMap<String, Item>>>,
    writes: Mutex<usize>,
    notifications: Mutex<Vec<String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `item` directly, as the host does for a local edit.
    pub fn put(&self, project_id: &str, item: Item) {
        self.projects
            .lock()
            .entry(project_id.to_string())
            .or_default()
            .insert(item.path.clone(), item);
    }

    pub fn get(&self, project_id: &str, path: &str) -> Option<Item> {
        self.projects
            .lock()
            .get(project_id)
            .and_then(|items| items.get(path).cloned())
    }

    /// Number of non-empty bulk upserts so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }

    /// Project ids passed to `notify_changed`, in call order.
    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().clone()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load_items(&self, project_id: &str) -> SyncResult<Vec<Item>> {
        Ok(self
            .projects
            .lock()
            .get(project_id)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn bulk_upsert(&self, project_id: &str, items: &[Item]) -> SyncResult<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut projects = self.projects.lock();
        let project = projects.entry(project_id.to_string()).or_default();
        for item in items {
            project.insert(item.path.clone(), item.clone());
        }
        *self.writes.lock() += 1;
        Ok(items.len())
    }

    async fn latest_modified(&self, project_id: &str) -> SyncResult<Option<i64>> {
        Ok(self
            .projects
            .lock()
            .get(project_id)
            .and_then(|items| items.values().map(|i| i.modified_at).max()))
    }

    fn notify_changed(&self, project_id: &str) {
        self.notifications.lock().push(project_id.to_string());
    }
}

// =============================================================================
// In-Memory Subscriptions
// =============================================================================

/// Subscription registry held in process memory.
#[derive(Debug, Default)]
pub struct MemorySubscriptions {
    projects: Mutex<Vec<ProjectSubscription>>,
}

impl MemorySubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a subscription.
    pub fn subscribe(&self, subscription: ProjectSubscription) {
        let mut projects = self.projects.lock();
        projects.retain(|p| p.project_id != subscription.project_id);
        projects.push(subscription);
    }

    pub fn unsubscribe(&self, project_id: &str) {
        self.projects.lock().retain(|p| p.project_id != project_id);
    }

    pub fn get(&self, project_id: &str) -> Option<ProjectSubscription> {
        self.projects
            .lock()
            .iter()
            .find(|p| p.project_id == project_id)
            .cloned()
    }
}

#[async_trait]
impl SubscriptionRegistry for MemorySubscriptions {
    async fn active_projects(&self) -> SyncResult<Vec<ProjectSubscription>> {
        Ok(self.projects.lock().clone())
    }

    async fn update_sync_state(&self, project_id: &str, update: SyncStateUpdate) -> SyncResult<()> {
        let mut projects = self.projects.lock();
        if let Some(project) = projects.iter_mut().find(|p| p.project_id == project_id) {
            project.status = update.status;
            if let Some(at) = update.last_sync_ms {
                project.last_sync_ms = Some(at);
            }
            if let Some(count) = update.merged_count {
                project.merged_count = count;
            }
        }
        Ok(())
    }

    async fn mark_first_sync_done(&self, project_id: &str) -> SyncResult<()> {
        if let Some(project) = self
            .projects
            .lock()
            .iter_mut()
            .find(|p| p.project_id == project_id)
        {
            project.first_sync_done = true;
        }
        Ok(())
    }
}

// =============================================================================
// SQLite Cache
// =============================================================================

/// [`CacheStore`] backed by the local SQLite cache.
///
/// Change notifications are published on a broadcast channel the host
/// subscribes to.
pub struct SqliteCacheStore {
    db: CacheDb,
    changed_tx: broadcast::Sender<String>,
}

impl SqliteCacheStore {
    pub fn new(db: CacheDb) -> Self {
        let (changed_tx, _) = broadcast::channel(64);
        SqliteCacheStore { db, changed_tx }
    }

    /// Receives the id of every project whose items changed.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changed_tx.subscribe()
    }

    pub fn db(&self) -> &CacheDb {
        &self.db
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn load_items(&self, project_id: &str) -> SyncResult<Vec<Item>> {
        Ok(self.db.load_items(project_id).await?)
    }

    async fn bulk_upsert(&self, project_id: &str, items: &[Item]) -> SyncResult<usize> {
        Ok(self.db.bulk_upsert(project_id, items).await?)
    }

    async fn latest_modified(&self, project_id: &str) -> SyncResult<Option<i64>> {
        Ok(self.db.latest_modified(project_id).await?)
    }

    fn notify_changed(&self, project_id: &str) {
        debug!(project_id = %project_id, "Cache changed");
        let _ = self.changed_tx.send(project_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelsync_db::CacheConfig;

    #[tokio::test]
    async fn test_memory_cache_contract() {
        let cache = MemoryCacheStore::new();
        assert_eq!(cache.bulk_upsert("p", &[]).await.unwrap(), 0);
        assert_eq!(cache.write_count(), 0);

        let item = Item::new("shots/010", "shot", "010", "status=WIP", "A", 1000);
        assert_eq!(cache.bulk_upsert("p", &[item]).await.unwrap(), 1);
        assert_eq!(cache.latest_modified("p").await.unwrap(), Some(1000));
        assert_eq!(cache.write_count(), 1);

        cache.notify_changed("p");
        assert_eq!(cache.notifications(), vec!["p".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_subscriptions_bookkeeping() {
        let subs = MemorySubscriptions::new();
        subs.subscribe(ProjectSubscription::new("p", "/share/p"));

        subs.update_sync_state("p", SyncStateUpdate::synced(5000, 3)).await.unwrap();
        subs.mark_first_sync_done("p").await.unwrap();

        let p = subs.get("p").unwrap();
        assert_eq!(p.status, SyncStatus::Synced);
        assert_eq!(p.last_sync_ms, Some(5000));
        assert_eq!(p.merged_count, 3);
        assert!(p.first_sync_done);

        // A failure keeps the last successful sync time.
        subs.update_sync_state("p", SyncStateUpdate::failed("share offline")).await.unwrap();
        let p = subs.get("p").unwrap();
        assert_eq!(p.status, SyncStatus::Error);
        assert_eq!(p.last_sync_ms, Some(5000));
    }

    #[tokio::test]
    async fn test_sqlite_cache_store_notifies_subscribers() {
        let db = CacheDb::new(CacheConfig::in_memory()).await.unwrap();
        let store = SqliteCacheStore::new(db);
        let mut changes = store.subscribe();

        let item = Item::new("shots/010", "shot", "010", "", "A", 1000);
        store.bulk_upsert("p", &[item]).await.unwrap();
        store.notify_changed("p");

        assert_eq!(changes.recv().await.unwrap(), "p");
        assert_eq!(store.load_items("p").await.unwrap().len(), 1);
    }
}
