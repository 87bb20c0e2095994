//! # Peer Registry
//!
//! Discovery without a directory server: every device publishes a descriptor
//! on each subscribed project's shared store and reads everyone else's.
//!
//! ## Heartbeat Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Heartbeat (every 30s by default)                     │
//! │                                                                         │
//! │  for each subscribed project (blocking pool):                          │
//! │    1. publish own descriptor   (only if endpoint changed or stale)     │
//! │    2. purge descriptors older than 7 days → drop from PeerTable        │
//! │    3. scan other descriptors   (mtime cache, unreadable files skipped) │
//! │       └─► PeerTable.upsert_descriptor (freshest lastSeen wins)         │
//! │                                                                         │
//! │  then:                                                                 │
//! │    4. dial every inactive peer, candidate addresses in order           │
//! │    5. reap peers unobserved for 60s that have no session               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use reelsync_core::{now_millis, PeerDescriptor, PeerRecord};
use reelsync_db::{BulletinBoard, BulletinScan};

use crate::collaborators::SubscriptionRegistry;
use crate::config::{DiscoverySettings, SyncConfig};
use crate::engine::ConnectionEngine;
use crate::error::SyncResult;
use crate::peers::PeerTable;
use crate::session::SessionTable;
use crate::socket::local_ipv4_addresses;

type AddressSource = Arc<dyn Fn() -> Vec<Ipv4Addr> + Send + Sync>;

/// Outcome of one heartbeat cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub projects: usize,
    /// Projects whose descriptor file was rewritten.
    pub published: usize,
    /// Devices seen for the first time.
    pub discovered: Vec<String>,
    /// Dial attempts that produced a connection.
    pub connected: Vec<String>,
    pub reaped: Vec<String>,
    pub purged: Vec<String>,
    /// Descriptor files that could not be read this cycle.
    pub skipped_files: usize,
}

struct ProjectScan {
    published: bool,
    purged: Vec<String>,
    scan: BulletinScan,
}

/// Bulletin-board publisher, scanner and dialer.
pub struct PeerRegistry {
    device_id: String,
    device_name: String,
    settings: DiscoverySettings,
    board: Arc<BulletinBoard>,
    peers: Arc<PeerTable>,
    sessions: Arc<SessionTable>,
    engine: Arc<ConnectionEngine>,
    subscriptions: Arc<dyn SubscriptionRegistry>,
    address_source: AddressSource,
    local_ips: Mutex<Option<(Instant, Vec<Ipv4Addr>)>>,
}

impl PeerRegistry {
    pub fn new(
        config: &SyncConfig,
        peers: Arc<PeerTable>,
        sessions: Arc<SessionTable>,
        engine: Arc<ConnectionEngine>,
        subscriptions: Arc<dyn SubscriptionRegistry>,
    ) -> Self {
        PeerRegistry {
            device_id: config.device_id().to_string(),
            device_name: config.device_name().to_string(),
            settings: config.discovery.clone(),
            board: Arc::new(BulletinBoard::new(&config.discovery.peers_dir)),
            peers,
            sessions,
            engine,
            subscriptions,
            address_source: Arc::new(local_ipv4_addresses),
            local_ips: Mutex::new(None),
        }
    }

    /// Replaces interface enumeration (hosts with unusual networking, tests).
    pub fn with_address_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> Vec<Ipv4Addr> + Send + Sync + 'static,
    {
        self.address_source = Arc::new(source);
        self
    }

    pub fn board(&self) -> &Arc<BulletinBoard> {
        &self.board
    }

    /// Local IPv4 addresses, re-enumerated at most once per cache period.
    pub fn local_addresses(&self) -> Vec<Ipv4Addr> {
        let mut cached = self.local_ips.lock();
        if let Some((at, addresses)) = cached.as_ref() {
            if at.elapsed() < self.settings.local_ip_cache() {
                return addresses.clone();
            }
        }

        let addresses = (self.address_source)();
        debug!(addresses = ?addresses, "Enumerated local addresses");
        *cached = Some((Instant::now(), addresses.clone()));
        addresses
    }

    fn own_descriptor(&self, port: u16, now: i64) -> PeerDescriptor {
        PeerDescriptor {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            ip_addresses: self
                .local_addresses()
                .iter()
                .map(|ip| ip.to_string())
                .collect(),
            port,
            last_seen: now,
        }
    }

    // =========================================================================
    // Heartbeat
    // =========================================================================

    /// Runs one full publish / purge / scan / dial / reap cycle.
    pub async fn heartbeat(&self) -> SyncResult<HeartbeatReport> {
        let projects = self.subscriptions.active_projects().await?;
        let mut report = HeartbeatReport {
            projects: projects.len(),
            ..Default::default()
        };

        let now = now_millis();
        let own = self.engine.local_port().map(|port| self.own_descriptor(port, now));

        for project in &projects {
            let scanned = match self.scan_project(project.shared_root.clone(), own.clone(), now).await {
                Ok(scanned) => scanned,
                Err(e) => {
                    warn!(project_id = %project.project_id, error = %e, "Bulletin board cycle failed");
                    continue;
                }
            };

            if scanned.published {
                report.published += 1;
            }
            report.skipped_files += scanned.scan.skipped;

            let max_age_ms = self.settings.descriptor_max_age_ms();
            for device_id in scanned.purged {
                // A stale copy under another file name does not retire a peer
                // that still publishes a fresh descriptor.
                let still_fresh = scanned
                    .scan
                    .descriptors
                    .iter()
                    .any(|d| d.device_id == device_id && !d.is_expired(now, max_age_ms));
                if !still_fresh && self.peers.remove(&device_id).is_some() {
                    info!(device_id = %device_id, "Removed expired peer");
                }
                report.purged.push(device_id);
            }

            for descriptor in scanned.scan.descriptors {
                if descriptor.is_expired(now, max_age_ms) {
                    continue;
                }
                match PeerRecord::from_descriptor(&descriptor) {
                    Ok(record) => {
                        let device_id = record.device_id.clone();
                        if self.peers.upsert_descriptor(record) {
                            info!(
                                device_id = %device_id,
                                project_id = %project.project_id,
                                "Discovered peer"
                            );
                            report.discovered.push(device_id);
                        }
                    }
                    Err(e) => {
                        debug!(device_id = %descriptor.device_id, error = %e, "Ignoring unusable descriptor");
                    }
                }
            }
        }

        report.connected = self.dial_inactive().await;
        report.reaped = self
            .peers
            .reap_stale(self.settings.peer_stale(), |device_id| self.sessions.contains(device_id));
        for device_id in &report.reaped {
            debug!(device_id = %device_id, "Reaped stale peer");
        }

        Ok(report)
    }

    /// Bulletin-board file work for one project, off the async workers.
    async fn scan_project(
        &self,
        root: PathBuf,
        own: Option<PeerDescriptor>,
        now: i64,
    ) -> SyncResult<ProjectScan> {
        let board = Arc::clone(&self.board);
        let device_id = self.device_id.clone();
        let refresh_ms = self.settings.descriptor_refresh_ms();
        let max_age_ms = self.settings.descriptor_max_age_ms();

        let scanned = tokio::task::spawn_blocking(move || {
            let published = match own {
                Some(descriptor) => match board.publish(&root, &descriptor, refresh_ms) {
                    Ok(written) => written,
                    Err(e) => {
                        warn!(root = %root.display(), error = %e, "Failed to publish descriptor");
                        false
                    }
                },
                None => false,
            };

            let purged = board.purge_expired(&root, &device_id, now, max_age_ms);
            let scan = board.scan(&root, &device_id);
            ProjectScan {
                published,
                purged,
                scan,
            }
        })
        .await?;

        Ok(scanned)
    }

    /// Dials every known peer without a session, concurrently.
    async fn dial_inactive(&self) -> Vec<String> {
        let mut dials = Vec::new();
        for peer in self.peers.dial_candidates() {
            if self.sessions.contains(&peer.device_id) {
                continue;
            }
            let engine = Arc::clone(&self.engine);
            dials.push(tokio::spawn(async move {
                let result = engine.connect_peer(&peer).await;
                (peer.device_id, result)
            }));
        }

        let mut connected = Vec::new();
        for dial in dials {
            match dial.await {
                Ok((device_id, Ok(_))) => connected.push(device_id),
                Ok((device_id, Err(e))) => {
                    debug!(device_id = %device_id, error = %e, "Peer not reachable this cycle");
                }
                Err(e) => warn!(error = %e, "Dial task failed"),
            }
        }
        connected
    }

    /// Runs the heartbeat until shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.heartbeat_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.settings.heartbeat_interval_secs,
                "Peer registry started"
            );

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                tokio::select! {
                    _ = ticker.tick() => {
                        match self.heartbeat().await {
                            Ok(report) => debug!(
                                projects = report.projects,
                                peers = self.peers.len(),
                                sessions = self.sessions.len(),
                                "Heartbeat complete"
                            ),
                            Err(e) => warn!(error = %e, "Heartbeat failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            info!("Peer registry stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemorySubscriptions, NoOpListener, ProjectSubscription};
    use reelsync_core::DAY_MS;
    use tempfile::TempDir;

    struct Fixture {
        _share: TempDir,
        root: PathBuf,
        peers: Arc<PeerTable>,
        engine: Arc<ConnectionEngine>,
        registry: PeerRegistry,
    }

    fn fixture() -> Fixture {
        let share = TempDir::new().unwrap();
        let root = share.path().join("project-1");
        std::fs::create_dir_all(&root).unwrap();

        let mut config = SyncConfig::new();
        config.device.id = "A".into();
        config.network.bind_addr = "127.0.0.1".into();
        config.network.preferred_port = 0;
        config.network.port_probe_range = 1;

        let peers = Arc::new(PeerTable::new());
        let sessions = Arc::new(SessionTable::new());
        let (engine, _notices) = ConnectionEngine::new(
            &config,
            Arc::clone(&peers),
            Arc::clone(&sessions),
            Arc::new(NoOpListener),
        );

        let subscriptions = Arc::new(MemorySubscriptions::new());
        subscriptions.subscribe(ProjectSubscription::new("project-1", &root));

        let registry = PeerRegistry::new(
            &config,
            Arc::clone(&peers),
            sessions,
            Arc::clone(&engine),
            subscriptions,
        )
        .with_address_source(|| vec![Ipv4Addr::new(192, 168, 1, 10)]);

        Fixture {
            _share: share,
            root,
            peers,
            engine,
            registry,
        }
    }

    fn write_descriptor(root: &std::path::Path, device_id: &str, last_seen: i64) {
        let dir = root.join("peers");
        std::fs::create_dir_all(&dir).unwrap();
        let descriptor = PeerDescriptor {
            device_id: device_id.into(),
            device_name: format!("{device_id} bay"),
            ip_addresses: vec!["192.0.2.1".into()],
            port: 9,
            last_seen,
        };
        std::fs::write(
            dir.join(format!("{device_id}.json")),
            serde_json::to_vec(&descriptor).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_publishes_own_descriptor_once() {
        let f = fixture();
        f.engine.start().unwrap();

        let first = f.registry.heartbeat().await.unwrap();
        assert_eq!(first.published, 1);

        let written: PeerDescriptor = serde_json::from_slice(
            &std::fs::read(f.root.join("peers").join("A.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(written.ip_addresses, vec!["192.168.1.10".to_string()]);
        assert_eq!(Some(written.port), f.engine.local_port());

        let second = f.registry.heartbeat().await.unwrap();
        assert_eq!(second.published, 0);

        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_descriptor_purged_and_peer_removed() {
        let f = fixture();
        let now = now_millis();

        // X was discovered while still fresh.
        f.peers
            .upsert_descriptor(PeerRecord {
                device_id: "X".into(),
                device_name: "X bay".into(),
                addresses: vec!["192.0.2.1".parse().unwrap()],
                port: 9,
                last_seen: now - 8 * DAY_MS,
                is_active: false,
            });
        write_descriptor(&f.root, "X", now - 8 * DAY_MS);

        let report = f.registry.heartbeat().await.unwrap();
        assert_eq!(report.purged, vec!["X".to_string()]);
        assert!(!f.root.join("peers").join("X.json").exists());
        assert!(f.peers.get("X").is_none());
    }

    #[tokio::test]
    async fn test_stale_copy_does_not_retire_fresh_peer() {
        let f = fixture();
        let now = now_millis();
        write_descriptor(&f.root, "X", now);
        let first = f.registry.heartbeat().await.unwrap();
        assert_eq!(first.discovered, vec!["X".to_string()]);

        // An old copy of X's descriptor under another name.
        let stray = f.root.join("peers").join("X-old.json");
        let mut old: PeerDescriptor =
            serde_json::from_slice(&std::fs::read(f.root.join("peers").join("X.json")).unwrap()).unwrap();
        old.last_seen = now - 8 * DAY_MS;
        std::fs::write(&stray, serde_json::to_vec(&old).unwrap()).unwrap();

        let report = f.registry.heartbeat().await.unwrap();
        assert_eq!(report.purged, vec!["X".to_string()]);
        assert!(report.discovered.is_empty());
        assert!(!stray.exists());
        assert!(f.root.join("peers").join("X.json").exists());
        assert!(f.peers.get("X").is_some());
    }

    #[tokio::test]
    async fn test_unreadable_descriptor_skipped() {
        let f = fixture();
        let dir = f.root.join("peers");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("broken.json"), b"{ half a descriptor").unwrap();

        let report = f.registry.heartbeat().await.unwrap();
        assert_eq!(report.skipped_files, 1);
        assert!(f.peers.is_empty());
    }

    #[test]
    fn test_local_addresses_cached() {
        let f = fixture();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = f.registry.with_address_source(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            vec![Ipv4Addr::new(10, 0, 0, 4)]
        });

        assert_eq!(registry.local_addresses(), vec![Ipv4Addr::new(10, 0, 0, 4)]);
        registry.local_addresses();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
