//! # Sync Service
//!
//! The background service the host application starts and stops. Wires the
//! connection engine, peer registry, merge engine and scheduler together
//! around the host's collaborators.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncService Lifecycle                           │
//! │                                                                         │
//! │  SyncServiceBuilder::new(config)                                       │
//! │      .with_cache(..) .with_subscriptions(..)        (required)         │
//! │      .with_backup(..) .with_listener(..)            (optional)         │
//! │      .build()                                                          │
//! │                                                                         │
//! │  start()     bind listener + accept pool                               │
//! │              spawn heartbeat, sync worker, scheduler timer,            │
//! │              notice forwarder                                          │
//! │                                                                         │
//! │  publish_local_edit(project, item)                                     │
//! │      own change log (pull path) ──► CHANGE_NOTIFY to sessions (push)   │
//! │                                                                         │
//! │  shutdown()  GOODBYE to sessions, close sockets, stop and join tasks   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ts_rs::TS;

use reelsync_core::{now_millis, ChangeLogEntry, Item, PeerRecord, SyncStatus};
use reelsync_db::ChangeLogStore;

use crate::collaborators::{
    BackupHook, CacheStore, NoOpBackup, NoOpListener, PeerEventListener, SubscriptionRegistry,
};
use crate::config::SyncConfig;
use crate::engine::ConnectionEngine;
use crate::error::{SyncError, SyncResult};
use crate::merge::MergeEngine;
use crate::peers::PeerTable;
use crate::protocol::{ChangeNotice, PeerMessage};
use crate::registry::PeerRegistry;
use crate::scheduler::SyncScheduler;
use crate::session::{Connection, SessionInfo, SessionTable};

// =============================================================================
// Status
// =============================================================================

/// Sync state of one subscribed project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ProjectStatus {
    pub project_id: String,
    pub status: SyncStatus,
    pub last_sync_ms: Option<i64>,
    pub merged_count: usize,
}

/// Snapshot of the whole service for the GUI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ServiceStatus {
    pub device_id: String,
    /// Bound port while running.
    pub listening_port: Option<u16>,
    pub active_sessions: usize,
    pub known_peers: usize,
    /// Projects waiting for a merge pass.
    pub queue_depth: usize,
    pub projects: Vec<ProjectStatus>,
}

// =============================================================================
// Service
// =============================================================================

/// Peer-to-peer metadata sync for one device.
pub struct SyncService {
    config: Arc<SyncConfig>,
    peers: Arc<PeerTable>,
    sessions: Arc<SessionTable>,
    store: Arc<ChangeLogStore>,
    cache: Arc<dyn CacheStore>,
    subscriptions: Arc<dyn SubscriptionRegistry>,
    engine: Arc<ConnectionEngine>,
    registry: Arc<PeerRegistry>,
    scheduler: Arc<SyncScheduler>,
    notices: Mutex<Option<mpsc::Receiver<ChangeNotice>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    last_edit_ms: Mutex<i64>,
}

impl SyncService {
    /// Starts building a service for `config`.
    pub fn builder(config: SyncConfig) -> SyncServiceBuilder {
        SyncServiceBuilder::new(config)
    }

    /// Binds the listener and starts every background task. Returns the
    /// listening port.
    pub fn start(&self) -> SyncResult<u16> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Internal("sync service already started".into()));
        }
        let notices = self.notices.lock().take().ok_or(SyncError::ShuttingDown)?;

        let port = self.engine.start()?;

        let mut tasks = self.tasks.lock();
        tasks.push(Arc::clone(&self.registry).spawn(self.shutdown_tx.subscribe()));
        tasks.push(Arc::clone(&self.scheduler).spawn_worker(self.shutdown_tx.subscribe()));
        tasks.push(Arc::clone(&self.scheduler).spawn_timer(self.shutdown_tx.subscribe()));
        tasks.push(tokio::spawn(forward_notices(
            notices,
            Arc::clone(&self.scheduler),
            self.shutdown_tx.subscribe(),
        )));

        info!(
            device_id = %self.config.device_id(),
            device_name = %self.config.device_name(),
            port,
            "Sync service started"
        );
        Ok(port)
    }

    /// Stops every task and closes every socket. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(device_id = %self.config.device_id(), "Sync service shutting down");

        self.engine.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }
        info!("Sync service stopped");
    }

    // =========================================================================
    // Host Operations
    // =========================================================================

    /// Records a local edit: appends it to this device's own change log,
    /// stores the stamped item in the cache and notifies connected peers.
    ///
    /// Returns the written entry.
    pub async fn publish_local_edit(&self, project_id: &str, item: &Item) -> SyncResult<ChangeLogEntry> {
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

        let timestamp = self.next_edit_timestamp(item.modified_at);
        let device_id = self.config.device_id().to_string();
        let entry = ChangeLogEntry::for_edit(item, &device_id, timestamp);

        let store = Arc::clone(&self.store);
        let root = subscription.shared_root.clone();
        let written = entry.clone();
        tokio::task::spawn_blocking(move || store.append(&root, &written)).await??;

        self.cache
            .bulk_upsert(project_id, std::slice::from_ref(&entry.item))
            .await?;
        self.cache.notify_changed(project_id);

        let notified = self
            .engine
            .broadcast(&PeerMessage::change_notify(project_id, &device_id, timestamp))?;
        debug!(
            project_id = %project_id,
            path = %entry.item_path,
            timestamp,
            peers_notified = notified,
            "Published local edit"
        );
        Ok(entry)
    }

    /// Per-device monotonic edit timestamp, also strictly after the version
    /// being edited so a peer with a fast clock cannot outrank the edit.
    fn next_edit_timestamp(&self, edited_at: i64) -> i64 {
        let mut last = self.last_edit_ms.lock();
        let timestamp = now_millis().max(*last + 1).max(edited_at.saturating_add(1));
        *last = timestamp;
        timestamp
    }

    /// Queues a merge pass for `project_id` now. Returns false if one is
    /// already queued or running.
    pub fn sync_now(&self, project_id: &str) -> bool {
        self.scheduler.sync_now(project_id)
    }

    /// Dials `addr` directly, bypassing bulletin-board discovery.
    pub async fn connect(&self, addr: SocketAddr) -> SyncResult<Arc<Connection>> {
        self.engine.connect(addr).await
    }

    pub async fn status(&self) -> SyncResult<ServiceStatus> {
        let projects = self
            .subscriptions
            .active_projects()
            .await?
            .into_iter()
            .map(|p| ProjectStatus {
                project_id: p.project_id,
                status: p.status,
                last_sync_ms: p.last_sync_ms,
                merged_count: p.merged_count,
            })
            .collect();

        Ok(ServiceStatus {
            device_id: self.config.device_id().to_string(),
            listening_port: self.engine.local_port(),
            active_sessions: self.sessions.len(),
            known_peers: self.peers.len(),
            queue_depth: self.scheduler.queue().len(),
            projects,
        })
    }

    /// Known peers, ordered by device id.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.snapshot()
    }

    /// Live sessions, ordered by device id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.snapshot()
    }

    pub fn device_id(&self) -> &str {
        self.config.device_id()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ConnectionEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }
}

/// Hands inbound `CHANGE_NOTIFY` messages to the scheduler.
async fn forward_notices(
    mut notices: mpsc::Receiver<ChangeNotice>,
    scheduler: Arc<SyncScheduler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            notice = notices.recv() => match notice {
                Some(notice) => {
                    let project_id = notice.project_id.clone();
                    match scheduler.handle_notice(notice).await {
                        Ok(queued) => debug!(project_id = %project_id, queued, "Change notice handled"),
                        Err(e) => warn!(project_id = %project_id, error = %e, "Failed to handle change notice"),
                    }
                }
                None => break,
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

type AddressSource = Box<dyn Fn() -> Vec<Ipv4Addr> + Send + Sync>;

/// Builder for [`SyncService`].
pub struct SyncServiceBuilder {
    config: SyncConfig,
    cache: Option<Arc<dyn CacheStore>>,
    subscriptions: Option<Arc<dyn SubscriptionRegistry>>,
    backup: Option<Arc<dyn BackupHook>>,
    listener: Option<Arc<dyn PeerEventListener>>,
    address_source: Option<AddressSource>,
}

impl SyncServiceBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncServiceBuilder {
            config,
            cache: None,
            subscriptions: None,
            backup: None,
            listener: None,
            address_source: None,
        }
    }

    /// Sets the local cache store.
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the subscription registry.
    pub fn with_subscriptions(mut self, subscriptions: Arc<dyn SubscriptionRegistry>) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    /// Sets the first-sync backup hook.
    pub fn with_backup(mut self, backup: Arc<dyn BackupHook>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Sets the peer event listener.
    pub fn with_listener(mut self, listener: Arc<dyn PeerEventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Overrides local address enumeration for published descriptors.
    pub fn with_address_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> Vec<Ipv4Addr> + Send + Sync + 'static,
    {
        self.address_source = Some(Box::new(source));
        self
    }

    /// Validates the config and wires every component.
    pub fn build(self) -> SyncResult<SyncService> {
        self.config.validate()?;

        let cache = self
            .cache
            .ok_or_else(|| SyncError::InvalidConfig("Cache store required".into()))?;
        let subscriptions = self
            .subscriptions
            .ok_or_else(|| SyncError::InvalidConfig("Subscription registry required".into()))?;
        let backup = self.backup.unwrap_or_else(|| Arc::new(NoOpBackup));
        let listener = self.listener.unwrap_or_else(|| Arc::new(NoOpListener));

        let config = Arc::new(self.config);
        let peers = Arc::new(PeerTable::new());
        let sessions = Arc::new(SessionTable::new());
        let store = Arc::new(ChangeLogStore::new(config.changelog.store_settings()));

        let (engine, notices) = ConnectionEngine::new(
            &config,
            Arc::clone(&peers),
            Arc::clone(&sessions),
            listener,
        );

        let mut registry = PeerRegistry::new(
            &config,
            Arc::clone(&peers),
            Arc::clone(&sessions),
            Arc::clone(&engine),
            Arc::clone(&subscriptions),
        );
        if let Some(source) = self.address_source {
            registry = registry.with_address_source(source);
        }

        let merge = Arc::new(MergeEngine::new(
            config.device_id(),
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&subscriptions),
            backup,
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            config.scheduler.clone(),
            merge,
            Arc::clone(&cache),
            Arc::clone(&subscriptions),
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(SyncService {
            config,
            peers,
            sessions,
            store,
            cache,
            subscriptions,
            engine,
            registry: Arc::new(registry),
            scheduler,
            notices: Mutex::new(Some(notices)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            last_edit_ms: Mutex::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryCacheStore, MemorySubscriptions, ProjectSubscription};
    use tempfile::TempDir;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::new();
        config.device.id = "A".into();
        config.network.bind_addr = "127.0.0.1".into();
        config.network.preferred_port = 0;
        config.network.port_probe_range = 1;
        config
    }

    #[test]
    fn test_build_requires_collaborators() {
        let err = SyncService::builder(config()).build().err().unwrap();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_local_edit_lands_in_own_log_and_cache() {
        let share = TempDir::new().unwrap();
        let cache = Arc::new(MemoryCacheStore::new());
        let subscriptions = Arc::new(MemorySubscriptions::new());
        subscriptions.subscribe(ProjectSubscription::new("p", share.path()));

        let service = SyncService::builder(config())
            .with_cache(cache.clone())
            .with_subscriptions(subscriptions)
            .build()
            .unwrap();

        let item = Item::new("shots/010", "shot", "010", "status=WIP", "A", 1);
        let first = service.publish_local_edit("p", &item).await.unwrap();
        let second = service.publish_local_edit("p", &item).await.unwrap();
        assert!(second.timestamp > first.timestamp);

        let log = std::fs::read_to_string(share.path().join(".reelsync/changes/A.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert_eq!(cache.get("p", "shots/010").unwrap().modified_at, second.timestamp);

        let err = service.publish_local_edit("nope", &item).await.unwrap_err();
        assert!(matches!(err, SyncError::Collaborator { .. }));
    }

    #[tokio::test]
    async fn test_edit_of_future_version_is_stamped_after_it() {
        let share = TempDir::new().unwrap();
        let cache = Arc::new(MemoryCacheStore::new());
        let subscriptions = Arc::new(MemorySubscriptions::new());
        subscriptions.subscribe(ProjectSubscription::new("p", share.path()));

        let service = SyncService::builder(config())
            .with_cache(cache.clone())
            .with_subscriptions(subscriptions)
            .build()
            .unwrap();

        // The version on screen came from a peer whose clock runs an hour ahead.
        let ahead = now_millis() + 3_600_000;
        let remote = Item::new("shots/020", "shot", "020", "status=WIP", "B", ahead);
        let entry = service.publish_local_edit("p", &remote).await.unwrap();
        assert_eq!(entry.timestamp, ahead + 1);
        assert_eq!(cache.get("p", "shots/020").unwrap().modified_by, "A");

        // Later edits keep climbing from there.
        let again = service.publish_local_edit("p", &entry.item).await.unwrap();
        assert_eq!(again.timestamp, ahead + 2);
    }

    #[tokio::test]
    async fn test_start_twice_refused_and_status_reports_port() {
        let service = SyncService::builder(config())
            .with_cache(Arc::new(MemoryCacheStore::new()))
            .with_subscriptions(Arc::new(MemorySubscriptions::new()))
            .build()
            .unwrap();

        let port = service.start().unwrap();
        assert!(service.start().is_err());

        let status = service.status().await.unwrap();
        assert_eq!(status.listening_port, Some(port));
        assert_eq!(status.active_sessions, 0);

        service.shutdown().await;
        service.shutdown().await;
        assert_eq!(service.status().await.unwrap().listening_port, None);
    }
}
