//! # Sync Scheduler
//!
//! Decides when each subscribed project gets a merge pass and runs those
//! passes one at a time, off the socket tasks.
//!
//! ## Scheduling
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Sync Scheduler                                 │
//! │                                                                         │
//! │  Timer task (5s)          CHANGE_NOTIFY           sync_now(project)     │
//! │  round-robin cursor,      (expected change        (UI request)          │
//! │  ≤ 2 projects per tick     attached)                   │                │
//! │        │                        │                      │                │
//! │        └────────────────────────┼──────────────────────┘                │
//! │                                 ▼                                       │
//! │                ┌─────────────────────────────────┐                      │
//! │                │ SyncQueue  VecDeque + HashSet   │  project queued or   │
//! │                │            (dedup)              │  in flight → no-op,  │
//! │                │                                 │  notices deferred    │
//! │                └────────────────┬────────────────┘                      │
//! │                                 ▼ Notify                                │
//! │                ┌─────────────────────────────────┐                      │
//! │                │ Worker task: one pass at a time │                      │
//! │                │ expected change not visible yet │──► re-enqueue after  │
//! │                │                                 │    retry delay       │
//! │                └─────────────────────────────────┘                      │
//! │                                                                         │
//! │  Timer enqueues a project when its cache holds edits newer than the    │
//! │  last sync, or when the last sync is older than 30s.                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use reelsync_core::now_millis;
use reelsync_db::ExpectedChange;

use crate::collaborators::{CacheStore, ProjectSubscription, SubscriptionRegistry};
use crate::config::SchedulerSettings;
use crate::error::SyncResult;
use crate::merge::MergeEngine;
use crate::protocol::ChangeNotice;

// =============================================================================
// Work Queue
// =============================================================================

/// One queued merge pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub project_id: String,
    /// Change a peer announced and this pass should confirm.
    pub expected: Option<ExpectedChange>,
    /// Retries already spent confirming `expected`.
    pub attempt: u32,
}

impl SyncJob {
    pub fn new(project_id: impl Into<String>) -> Self {
        SyncJob {
            project_id: project_id.into(),
            expected: None,
            attempt: 0,
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    queue: VecDeque<SyncJob>,
    /// Queued or in-flight project ids.
    members: HashSet<String>,
    /// Notices that arrived while their project's pass was running.
    deferred: HashMap<String, SyncJob>,
}

/// Deduplicating FIFO of projects awaiting a merge pass.
///
/// A project stays a member from enqueue until [`SyncQueue::complete`], so
/// enqueuing a queued or in-flight project is a no-op. The one exception is a
/// job carrying an expected change for an in-flight project: the running pass
/// may have read the logs before that change landed, so the job is held and
/// queued when the pass completes.
#[derive(Debug, Default)]
pub struct SyncQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a plain pass. Returns false if the project was already a member.
    pub fn enqueue(&self, project_id: &str) -> bool {
        self.push(SyncJob::new(project_id))
    }

    /// Queues `job`. Returns false if its project was already a member.
    pub fn push(&self, job: SyncJob) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.members.contains(&job.project_id) {
                let queued = inner.queue.iter().any(|q| q.project_id == job.project_id);
                if !queued && job.expected.is_some() {
                    inner.deferred.insert(job.project_id.clone(), job);
                }
                return false;
            }
            inner.members.insert(job.project_id.clone());
            inner.queue.push_back(job);
        }
        self.notify.notify_one();
        true
    }

    /// Takes the next job without waiting. The project stays a member.
    pub fn try_next(&self) -> Option<SyncJob> {
        self.inner.lock().queue.pop_front()
    }

    /// Waits for the next job.
    pub async fn next(&self) -> SyncJob {
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.try_next() {
                return job;
            }
            notified.await;
        }
    }

    /// Releases the project after its pass finished, or queues the notice
    /// deferred while it ran.
    pub fn complete(&self, project_id: &str) {
        {
            let mut inner = self.inner.lock();
            match inner.deferred.remove(project_id) {
                Some(job) => inner.queue.push_back(job),
                None => {
                    inner.members.remove(project_id);
                    return;
                }
            }
        }
        self.notify.notify_one();
    }

    /// Jobs waiting (in-flight excluded).
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn contains(&self, project_id: &str) -> bool {
        self.inner.lock().members.contains(project_id)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives merge passes from the queue, the timer and peer notifications.
pub struct SyncScheduler {
    queue: Arc<SyncQueue>,
    merge: Arc<MergeEngine>,
    cache: Arc<dyn CacheStore>,
    subscriptions: Arc<dyn SubscriptionRegistry>,
    settings: SchedulerSettings,
    cursor: Mutex<usize>,
    passes: AtomicU64,
}

impl SyncScheduler {
    pub fn new(
        settings: SchedulerSettings,
        merge: Arc<MergeEngine>,
        cache: Arc<dyn CacheStore>,
        subscriptions: Arc<dyn SubscriptionRegistry>,
    ) -> Self {
        SyncScheduler {
            queue: Arc::new(SyncQueue::new()),
            merge,
            cache,
            subscriptions,
            settings,
            cursor: Mutex::new(0),
            passes: AtomicU64::new(0),
        }
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Merge passes started since construction.
    pub fn passes_run(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Queues `project_id` immediately, bypassing the timer.
    pub fn sync_now(&self, project_id: &str) -> bool {
        let queued = self.queue.enqueue(project_id);
        debug!(project_id = %project_id, queued, "Sync requested");
        queued
    }

    /// Queues a pass confirming the change a peer announced.
    ///
    /// Notices for projects this device does not subscribe to are dropped.
    pub async fn handle_notice(&self, notice: ChangeNotice) -> SyncResult<bool> {
        let subscribed = self
            .subscriptions
            .active_projects()
            .await?
            .iter()
            .any(|p| p.project_id == notice.project_id);
        if !subscribed {
            debug!(project_id = %notice.project_id, "Ignoring notice for unsubscribed project");
            return Ok(false);
        }

        Ok(self.queue.push(SyncJob {
            project_id: notice.project_id,
            expected: Some(ExpectedChange {
                device_id: notice.device_id,
                min_timestamp: notice.timestamp,
            }),
            attempt: 0,
        }))
    }

    // =========================================================================
    // Timer
    // =========================================================================

    /// One timer tick: looks at up to `projects_per_tick` projects from the
    /// round-robin cursor and queues those that need a pass. Returns the
    /// projects queued.
    pub async fn tick(&self) -> SyncResult<Vec<String>> {
        let projects = self.subscriptions.active_projects().await?;
        if projects.is_empty() {
            return Ok(Vec::new());
        }

        let count = projects.len();
        let take = self.settings.projects_per_tick.min(count);
        let start = {
            let mut cursor = self.cursor.lock();
            let start = *cursor % count;
            *cursor = (start + take) % count;
            start
        };

        let now = now_millis();
        let mut queued = Vec::new();
        for offset in 0..take {
            let project = &projects[(start + offset) % count];
            match self.needs_sync(project, now).await {
                Ok(true) => {
                    if self.queue.enqueue(&project.project_id) {
                        queued.push(project.project_id.clone());
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(project_id = %project.project_id, error = %e, "Cannot check project for sync"),
            }
        }
        Ok(queued)
    }

    async fn needs_sync(&self, project: &ProjectSubscription, now: i64) -> SyncResult<bool> {
        let Some(last_sync) = project.last_sync_ms else {
            return Ok(true);
        };
        if now.saturating_sub(last_sync) > self.settings.max_sync_age_ms() {
            return Ok(true);
        }

        let latest = self.cache.latest_modified(&project.project_id).await?;
        Ok(latest.map(|ts| ts > last_sync).unwrap_or(false))
    }

    // =========================================================================
    // Worker
    // =========================================================================

    /// Runs one job and releases its project.
    ///
    /// Failures are logged; a panicking pass is contained to its own task.
    pub async fn run_job(&self, job: SyncJob) {
        self.passes.fetch_add(1, Ordering::SeqCst);

        let merge = Arc::clone(&self.merge);
        let project_id = job.project_id.clone();
        let expected = job.expected.clone();
        let outcome = tokio::spawn(async move { merge.run(&project_id, expected).await }).await;

        self.queue.complete(&job.project_id);

        match outcome {
            Ok(Ok(report)) => {
                if report.expected_missing() {
                    self.retry_expected(job);
                }
            }
            Ok(Err(e)) => debug!(project_id = %job.project_id, error = %e, "Pass failed, retrying on a later tick"),
            Err(e) => warn!(project_id = %job.project_id, error = %e, "Merge pass panicked"),
        }
    }

    /// Re-queues a pass whose announced change has not reached the shared
    /// store yet.
    fn retry_expected(&self, job: SyncJob) {
        if job.attempt >= self.settings.expected_change_retries {
            info!(
                project_id = %job.project_id,
                attempts = job.attempt,
                "Announced change still not visible, leaving it to the timer"
            );
            return;
        }

        let queue = Arc::clone(&self.queue);
        let delay = self.settings.expected_change_retry();
        let retry = SyncJob {
            attempt: job.attempt + 1,
            ..job
        };
        debug!(project_id = %retry.project_id, attempt = retry.attempt, "Announced change not visible yet");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(retry);
        });
    }

    /// Starts the worker task.
    pub fn spawn_worker(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Sync worker started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    job = self.queue.next() => self.run_job(job).await,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("Sync worker stopped");
        })
    }

    /// Starts the timer task.
    pub fn spawn_timer(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.tick_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.tick().await {
                            Ok(queued) if !queued.is_empty() => debug!(projects = ?queued, "Timer queued projects"),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Scheduler tick failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Scheduler timer stopped");
        })
    }
}
