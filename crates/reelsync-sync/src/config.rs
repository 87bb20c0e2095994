//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     REELSYNC_DEVICE_ID=abc-123                                         │
//! │     REELSYNC_PORT=49200                                                │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/reelsync/sync.toml (Linux)                               │
//! │     ~/Library/Application Support/io.reelsync.reelsync/sync.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated device_id, port 49152, 30s heartbeat, 5s tick       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! clock_skew_tolerance_ms = 10000
//!
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Edit Bay 2"
//!
//! [network]
//! preferred_port = 49152
//! port_probe_range = 100
//! connect_timeout_ms = 3000
//!
//! [discovery]
//! heartbeat_interval_secs = 30
//! peer_stale_secs = 60
//! descriptor_max_age_days = 7
//!
//! [scheduler]
//! tick_interval_secs = 5
//! projects_per_tick = 2
//! max_sync_age_secs = 30
//!
//! [changelog]
//! dir = ".reelsync/changes"
//! archive_after_entries = 500
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use reelsync_core::{CLOCK_SKEW_TOLERANCE_MS, DAY_MS};
use reelsync_db::ChangeLogSettings;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    #[serde(default = "generate_device_id")]
    pub id: String,

    /// Human-readable device name (e.g., "Edit Bay 2").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn generate_device_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_device_name() -> String {
    "ReelSync Workstation".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: generate_device_id(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Network Settings
// =============================================================================

/// Connection engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Address to bind the listener on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// First port tried when binding.
    #[serde(default = "default_preferred_port")]
    pub preferred_port: u16,

    /// Number of consecutive ports probed when the preferred one is taken.
    #[serde(default = "default_port_probe_range")]
    pub port_probe_range: u16,

    /// Outbound connect timeout (milliseconds).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Number of accept tasks sharing the listener.
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: usize,

    /// Interval between PINGs on an idle session (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Close sessions with no inbound traffic for this long (seconds).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Largest accepted frame body (bytes).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Consecutive zero-length frames tolerated before closing.
    #[serde(default = "default_max_zero_length_frames")]
    pub max_zero_length_frames: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_preferred_port() -> u16 {
    49152
}
fn default_port_probe_range() -> u16 {
    100
}
fn default_connect_timeout_ms() -> u64 {
    3000
}
fn default_accept_backlog() -> usize {
    4
}
fn default_ping_interval() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    90
}
fn default_max_frame_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_max_zero_length_frames() -> u32 {
    10
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            bind_addr: default_bind_addr(),
            preferred_port: default_preferred_port(),
            port_probe_range: default_port_probe_range(),
            connect_timeout_ms: default_connect_timeout_ms(),
            accept_backlog: default_accept_backlog(),
            ping_interval_secs: default_ping_interval(),
            idle_timeout_secs: default_idle_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
            max_zero_length_frames: default_max_zero_length_frames(),
        }
    }
}

impl NetworkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

// =============================================================================
// Discovery Settings
// =============================================================================

/// Peer registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Heartbeat tick: publish, scan, dial, reap (seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Drop peers from the live table after this long unseen (seconds).
    #[serde(default = "default_peer_stale")]
    pub peer_stale_secs: u64,

    /// Delete bulletin-board descriptors older than this (days).
    #[serde(default = "default_descriptor_max_age")]
    pub descriptor_max_age_days: u64,

    /// Rewrite an unchanged descriptor once its lastSeen is this old (hours).
    #[serde(default = "default_descriptor_refresh")]
    pub descriptor_refresh_hours: u64,

    /// How long enumerated local addresses are reused (seconds).
    #[serde(default = "default_local_ip_cache")]
    pub local_ip_cache_secs: u64,

    /// Bulletin-board directory under each project's shared root.
    #[serde(default = "default_peers_dir")]
    pub peers_dir: String,
}

fn default_heartbeat_interval() -> u64 {
    30
}
fn default_peer_stale() -> u64 {
    60
}
fn default_descriptor_max_age() -> u64 {
    7
}
fn default_descriptor_refresh() -> u64 {
    24
}
fn default_local_ip_cache() -> u64 {
    300
}
fn default_peers_dir() -> String {
    "peers".to_string()
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            heartbeat_interval_secs: default_heartbeat_interval(),
            peer_stale_secs: default_peer_stale(),
            descriptor_max_age_days: default_descriptor_max_age(),
            descriptor_refresh_hours: default_descriptor_refresh(),
            local_ip_cache_secs: default_local_ip_cache(),
            peers_dir: default_peers_dir(),
        }
    }
}

impl DiscoverySettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn peer_stale(&self) -> Duration {
        Duration::from_secs(self.peer_stale_secs)
    }

    pub fn descriptor_max_age_ms(&self) -> i64 {
        self.descriptor_max_age_days as i64 * DAY_MS
    }

    pub fn descriptor_refresh_ms(&self) -> i64 {
        self.descriptor_refresh_hours as i64 * 60 * 60 * 1000
    }

    pub fn local_ip_cache(&self) -> Duration {
        Duration::from_secs(self.local_ip_cache_secs)
    }
}

// =============================================================================
// Scheduler Settings
// =============================================================================

/// Sync scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Timer tick (seconds).
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Subscriptions examined per tick.
    #[serde(default = "default_projects_per_tick")]
    pub projects_per_tick: usize,

    /// Enqueue a project once its last sync is this old (seconds).
    #[serde(default = "default_max_sync_age")]
    pub max_sync_age_secs: u64,

    /// Extra passes when a notified change is not yet visible.
    #[serde(default = "default_expected_change_retries")]
    pub expected_change_retries: u32,

    /// Delay before each of those passes (milliseconds).
    #[serde(default = "default_expected_change_retry_ms")]
    pub expected_change_retry_ms: u64,
}

fn default_tick_interval() -> u64 {
    5
}
fn default_projects_per_tick() -> usize {
    2
}
fn default_max_sync_age() -> u64 {
    30
}
fn default_expected_change_retries() -> u32 {
    3
}
fn default_expected_change_retry_ms() -> u64 {
    2000
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            tick_interval_secs: default_tick_interval(),
            projects_per_tick: default_projects_per_tick(),
            max_sync_age_secs: default_max_sync_age(),
            expected_change_retries: default_expected_change_retries(),
            expected_change_retry_ms: default_expected_change_retry_ms(),
        }
    }
}

impl SchedulerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn max_sync_age_ms(&self) -> i64 {
        self.max_sync_age_secs as i64 * 1000
    }

    pub fn expected_change_retry(&self) -> Duration {
        Duration::from_millis(self.expected_change_retry_ms)
    }
}

// =============================================================================
// Change-Log Settings
// =============================================================================

/// Change-log layout and compaction thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogConfig {
    /// Log directory under each project's shared root.
    #[serde(default = "default_changelog_dir")]
    pub dir: String,

    /// Compact the active segment at this many entries.
    #[serde(default = "default_archive_after_entries")]
    pub archive_after_entries: usize,

    /// Compact the active segment once its oldest entry is this old (days).
    #[serde(default = "default_archive_after_days")]
    pub archive_after_days: u64,

    /// Legacy full-state file read when no per-device logs exist.
    #[serde(default = "default_legacy_file")]
    pub legacy_file: String,
}

fn default_changelog_dir() -> String {
    ".reelsync/changes".to_string()
}
fn default_archive_after_entries() -> usize {
    500
}
fn default_archive_after_days() -> u64 {
    7
}
fn default_legacy_file() -> String {
    "metadata.json".to_string()
}

impl Default for ChangeLogConfig {
    fn default() -> Self {
        ChangeLogConfig {
            dir: default_changelog_dir(),
            archive_after_entries: default_archive_after_entries(),
            archive_after_days: default_archive_after_days(),
            legacy_file: default_legacy_file(),
        }
    }
}

impl ChangeLogConfig {
    /// Storage-layer settings for the change-log store.
    pub fn store_settings(&self) -> ChangeLogSettings {
        ChangeLogSettings {
            dir: PathBuf::from(&self.dir),
            archive_after_entries: self.archive_after_entries,
            archive_after_ms: self.archive_after_days as i64 * DAY_MS,
            legacy_file: PathBuf::from(&self.legacy_file),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

fn default_clock_skew_tolerance() -> i64 {
    CLOCK_SKEW_TOLERANCE_MS
}

/// Complete sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Expected clock skew between devices (milliseconds). Advisory only:
    /// merge ordering never consults it.
    #[serde(default = "default_clock_skew_tolerance")]
    pub clock_skew_tolerance_ms: i64,

    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Connection engine settings.
    #[serde(default)]
    pub network: NetworkSettings,

    /// Peer registry settings.
    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Change-log settings.
    #[serde(default)]
    pub changelog: ChangeLogConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            clock_skew_tolerance_ms: default_clock_skew_tolerance(),
            device: DeviceConfig::default(),
            network: NetworkSettings::default(),
            discovery: DiscoverySettings::default(),
            scheduler: SchedulerSettings::default(),
            changelog: ChangeLogConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    ///
    /// A device id generated here (no file, or a file without `[device] id`)
    /// is written back to the config file so the device keeps the same
    /// identity across restarts.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        Self::load_with(config_path, |key| std::env::var(key).ok())
    }

    fn load_with<F>(config_path: Option<PathBuf>, lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = config_path.or_else(Self::default_config_path);
        let mut config = Self::default();
        let mut id_generated = true;

        if let Some(path) = &path {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(path)
                    .map_err(|e| SyncError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;
                let raw: toml::Value = toml::from_str(&contents)?;
                id_generated = raw.get("device").and_then(|d| d.get("id")).is_none();
                config = raw.try_into::<SyncConfig>()?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        let generated_id = id_generated.then(|| config.device.id.clone());
        config.apply_overrides(lookup);
        config.validate()?;

        // An environment override wins and is not persisted.
        if let (Some(id), Some(path)) = (generated_id, path) {
            if id == config.device.id {
                info!(device_id = %id, "Persisting generated device ID");
                if let Err(e) = config.save(Some(path)) {
                    warn!(error = %e, "Failed to persist generated device ID");
                }
            }
        }

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    ///
    /// Persisting the generated device id keeps this device's change log
    /// stable across restarts.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(format!("{}: {}", parent.display(), e)))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)
            .map_err(|e| SyncError::ConfigSaveFailed(format!("{}: {}", path.display(), e)))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if self.network.port_probe_range == 0 {
            return Err(SyncError::InvalidConfig(
                "port_probe_range must be greater than 0".into(),
            ));
        }

        if self.network.max_zero_length_frames == 0 {
            return Err(SyncError::InvalidConfig(
                "max_zero_length_frames must be greater than 0".into(),
            ));
        }

        if self.network.accept_backlog == 0 {
            return Err(SyncError::InvalidConfig(
                "accept_backlog must be greater than 0".into(),
            ));
        }

        if self.network.ping_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "ping_interval_secs must be greater than 0".into(),
            ));
        }

        if self.network.idle_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "idle_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.discovery.heartbeat_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "heartbeat_interval_secs must be greater than 0".into(),
            ));
        }

        if self.scheduler.tick_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "tick_interval_secs must be greater than 0".into(),
            ));
        }

        if self.scheduler.projects_per_tick == 0 {
            return Err(SyncError::InvalidConfig(
                "projects_per_tick must be greater than 0".into(),
            ));
        }

        if self.network.bind_addr.parse::<std::net::IpAddr>().is_err() {
            return Err(SyncError::InvalidConfig(format!(
                "bind_addr is not an IP address: {}",
                self.network.bind_addr
            )));
        }

        Ok(())
    }

    /// Applies `REELSYNC_*` overrides read through `lookup`.
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("REELSYNC_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(name) = lookup("REELSYNC_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(port) = lookup("REELSYNC_PORT") {
            match port.parse::<u16>() {
                Ok(p) => {
                    debug!(port = p, "Overriding preferred port from environment");
                    self.network.preferred_port = p;
                }
                Err(_) => warn!(value = %port, "Ignoring invalid REELSYNC_PORT"),
            }
        }

        if let Some(secs) = lookup("REELSYNC_HEARTBEAT_SECS") {
            match secs.parse::<u64>() {
                Ok(s) if s > 0 => self.discovery.heartbeat_interval_secs = s,
                _ => warn!(value = %secs, "Ignoring invalid REELSYNC_HEARTBEAT_SECS"),
            }
        }

        if let Some(secs) = lookup("REELSYNC_TICK_SECS") {
            match secs.parse::<u64>() {
                Ok(s) if s > 0 => self.scheduler.tick_interval_secs = s,
                _ => warn!(value = %secs, "Ignoring invalid REELSYNC_TICK_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "reelsync", "reelsync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the device name.
    pub fn device_name(&self) -> &str {
        &self.device.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.network.preferred_port, 49152);
        assert_eq!(config.network.port_probe_range, 100);
        assert_eq!(config.network.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.network.max_frame_bytes, 10 * 1024 * 1024);
        assert_eq!(config.discovery.heartbeat_interval_secs, 30);
        assert_eq!(config.discovery.descriptor_max_age_ms(), 7 * DAY_MS);
        assert_eq!(config.scheduler.projects_per_tick, 2);
        assert_eq!(config.clock_skew_tolerance_ms, 10_000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();
        assert!(config.validate().is_ok());

        config.device.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        config.device.id = "A".into();
        config.network.port_probe_range = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        config.network.port_probe_range = 100;
        config.scheduler.projects_per_tick = 0;
        assert!(config.validate().is_err());

        config.scheduler.projects_per_tick = 2;
        config.network.bind_addr = "not-an-ip".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let zeroed: [fn(&mut SyncConfig); 4] = [
            |c| c.network.ping_interval_secs = 0,
            |c| c.network.idle_timeout_secs = 0,
            |c| c.discovery.heartbeat_interval_secs = 0,
            |c| c.scheduler.tick_interval_secs = 0,
        ];

        for zero in zeroed {
            let mut config = SyncConfig::default();
            zero(&mut config);
            let err = config.validate().unwrap_err();
            assert!(err.is_config_error(), "unexpected error: {err}");
        }
    }

    #[test]
    fn test_zero_interval_in_toml_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(
            &path,
            r#"
            [device]
            id = "A"

            [network]
            ping_interval_secs = 0

            [scheduler]
            tick_interval_secs = 0
            "#,
        )
        .unwrap();

        let result = SyncConfig::load_with(Some(path), |_| None);
        assert!(result.unwrap_err().is_config_error());
    }

    #[test]
    fn test_generated_device_id_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reelsync").join("sync.toml");

        let first = SyncConfig::load_with(Some(path.clone()), |_| None).unwrap();
        assert!(path.exists());

        let second = SyncConfig::load_with(Some(path.clone()), |_| None).unwrap();
        assert_eq!(first.device_id(), second.device_id());
    }

    #[test]
    fn test_file_without_device_id_gets_one_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "[device]\nname = \"Edit Bay 2\"\n").unwrap();

        let first = SyncConfig::load_with(Some(path.clone()), |_| None).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains(first.device_id()));

        let second = SyncConfig::load_with(Some(path), |_| None).unwrap();
        assert_eq!(second.device_id(), first.device_id());
        assert_eq!(second.device_name(), "Edit Bay 2");
    }

    #[test]
    fn test_env_device_id_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");

        let config = SyncConfig::load_with(Some(path.clone()), |key| {
            (key == "REELSYNC_DEVICE_ID").then(|| "from-env".to_string())
        })
        .unwrap();
        assert_eq!(config.device_id(), "from-env");
        assert!(!path.exists());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("REELSYNC_DEVICE_ID", "device-from-env"),
            ("REELSYNC_PORT", "49300"),
            ("REELSYNC_TICK_SECS", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.device_id(), "device-from-env");
        assert_eq!(config.network.preferred_port, 49300);
        // Zero tick is rejected, default kept.
        assert_eq!(config.scheduler.tick_interval_secs, 5);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "A"

            [scheduler]
            tick_interval_secs = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.device.id, "A");
        assert_eq!(config.device.name, "ReelSync Workstation");
        assert_eq!(config.scheduler.tick_interval_secs, 1);
        assert_eq!(config.scheduler.max_sync_age_secs, 30);
        assert_eq!(config.changelog.dir, ".reelsync/changes");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");

        let mut config = SyncConfig::default();
        config.device.name = "Edit Bay 2".into();
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[device]"));
        assert!(contents.contains("[scheduler]"));

        let loaded: SyncConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.device.id, config.device.id);
        assert_eq!(loaded.device.name, "Edit Bay 2");
    }

    #[test]
    fn test_changelog_store_settings() {
        let settings = ChangeLogConfig::default().store_settings();
        assert_eq!(settings.archive_after_entries, 500);
        assert_eq!(settings.archive_after_ms, 7 * DAY_MS);
        assert_eq!(settings.dir, PathBuf::from(".reelsync/changes"));
    }
}
