//! # Peer Bulletin Board
//!
//! Reachability descriptors exchanged through the shared project location.
//! Each device owns exactly one file, `peers/<device_id>.json`, and reads
//! everyone else's.
//!
//! ## Scan Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Bulletin-Board Scan                                  │
//! │                                                                         │
//! │  read_dir(peers/)                                                      │
//! │       │                                                                 │
//! │       ├── own descriptor?          → skip                              │
//! │       ├── temp file / not .json?   → skip                              │
//! │       ├── mtime unchanged?         → reuse cached descriptor           │
//! │       ├── unreadable / malformed?  → count as skipped, retry next scan │
//! │       ▼                                                                 │
//! │  parse PeerDescriptor, cache by (path, mtime)                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  BulletinScan { descriptors, skipped }                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The share is typically SMB/NFS; reparsing dozens of JSON files every few
//! seconds is wasteful, hence the mtime cache.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use reelsync_core::PeerDescriptor;

use crate::error::{DbError, DbResult};
use crate::fsutil::{is_temp_file, write_atomic};

const DESCRIPTOR_EXTENSION: &str = "json";

/// Result of one bulletin-board scan.
#[derive(Debug, Clone, Default)]
pub struct BulletinScan {
    /// Descriptors of other devices, in file-name order.
    pub descriptors: Vec<PeerDescriptor>,
    /// Files that could not be read or parsed this time.
    pub skipped: usize,
}

#[derive(Debug, Clone)]
struct CachedDescriptor {
    modified: SystemTime,
    descriptor: PeerDescriptor,
}

/// Reads and writes peer descriptors under a project's shared root.
pub struct BulletinBoard {
    dir_name: PathBuf,
    cache: Mutex<HashMap<PathBuf, CachedDescriptor>>,
}

impl BulletinBoard {
    /// Creates a board whose files live in `<root>/<dir_name>/`.
    pub fn new(dir_name: impl Into<PathBuf>) -> Self {
        BulletinBoard {
            dir_name: dir_name.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(&self.dir_name)
    }

    pub fn descriptor_path(&self, root: &Path, device_id: &str) -> PathBuf {
        self.dir(root)
            .join(format!("{}.{}", device_id, DESCRIPTOR_EXTENSION))
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Publishes this device's descriptor if it is missing, stale or changed.
    ///
    /// The file is left alone while it advertises the same endpoint and its
    /// `lastSeen` is younger than `refresh_after_ms`. Returns true if the
    /// file was written.
    pub fn publish(
        &self,
        root: &Path,
        descriptor: &PeerDescriptor,
        refresh_after_ms: i64,
    ) -> DbResult<bool> {
        let path = self.descriptor_path(root, &descriptor.device_id);

        if let Ok(existing) = read_descriptor(&path) {
            let unchanged = existing.same_endpoint(descriptor)
                && existing.device_name == descriptor.device_name;
            let fresh = descriptor.last_seen.saturating_sub(existing.last_seen) < refresh_after_ms;
            if unchanged && fresh {
                return Ok(false);
            }
        }

        let bytes = serde_json::to_vec_pretty(descriptor)?;
        write_atomic(&path, &bytes)?;

        info!(
            device_id = %descriptor.device_id,
            port = descriptor.port,
            addresses = ?descriptor.ip_addresses,
            "Published peer descriptor"
        );
        Ok(true)
    }

    // =========================================================================
    // Scan
    // =========================================================================

    /// Reads every other device's descriptor.
    ///
    /// A missing directory is an empty board, not an error.
    pub fn scan(&self, root: &Path, own_device_id: &str) -> BulletinScan {
        let (files, skipped) = self.read_board(root, own_device_id);
        BulletinScan {
            descriptors: files.into_iter().map(|(_, descriptor)| descriptor).collect(),
            skipped,
        }
    }

    /// Descriptors paired with the file each was read from, plus the count
    /// of files skipped.
    fn read_board(&self, root: &Path, own_device_id: &str) -> (Vec<(PathBuf, PeerDescriptor)>, usize) {
        let dir = self.dir(root);
        let mut files = Vec::new();
        let mut skipped = 0;

        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), error = %e, "Cannot list bulletin board");
                    skipped += 1;
                }
                return (files, skipped);
            }
        };

        let own_name = format!("{}.{}", own_device_id, DESCRIPTOR_EXTENSION);
        let mut paths: Vec<PathBuf> = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                !is_temp_file(path)
                    && path.extension().and_then(|e| e.to_str()) == Some(DESCRIPTOR_EXTENSION)
                    && path.file_name().and_then(|n| n.to_str()) != Some(own_name.as_str())
            })
            .collect();
        paths.sort();

        let mut cache = self.cache.lock();
        cache.retain(|path, _| paths.contains(path));

        for path in paths {
            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Descriptor vanished during scan");
                    skipped += 1;
                    continue;
                }
            };

            if let Some(cached) = cache.get(&path) {
                if cached.modified == modified {
                    files.push((path, cached.descriptor.clone()));
                    continue;
                }
            }

            match read_descriptor(&path) {
                Ok(descriptor) if descriptor.device_id != own_device_id => {
                    cache.insert(
                        path.clone(),
                        CachedDescriptor {
                            modified,
                            descriptor: descriptor.clone(),
                        },
                    );
                    files.push((path, descriptor));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable peer descriptor");
                    skipped += 1;
                }
            }
        }

        (files, skipped)
    }

    // =========================================================================
    // Purge
    // =========================================================================

    /// Deletes other devices' descriptors whose `lastSeen` is older than
    /// `max_age_ms`. The file the descriptor was read from is removed,
    /// whatever its name. Returns the device ids removed.
    pub fn purge_expired(
        &self,
        root: &Path,
        own_device_id: &str,
        now: i64,
        max_age_ms: i64,
    ) -> Vec<String> {
        let mut purged = Vec::new();

        let (files, _) = self.read_board(root, own_device_id);
        for (path, descriptor) in files {
            if !descriptor.is_expired(now, max_age_ms) {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(
                        device_id = %descriptor.device_id,
                        last_seen = descriptor.last_seen,
                        "Purged expired peer descriptor"
                    );
                    self.cache.lock().remove(&path);
                    purged.push(descriptor.device_id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.cache.lock().remove(&path);
                    purged.push(descriptor.device_id);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to purge peer descriptor");
                }
            }
        }

        purged
    }
}

fn read_descriptor(path: &Path) -> DbResult<PeerDescriptor> {
    let bytes = fs::read(path).map_err(|e| DbError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| DbError::MalformedRecord {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
