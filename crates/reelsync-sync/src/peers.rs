//! # Peer Table
//!
//! In-memory directory of known remote devices, fed by two sources:
//! bulletin-board scans and completed HELLO handshakes.
//!
//! ```text
//! bulletin scan ──► upsert_descriptor ──┐
//!                                       ├──► PeerTable (device_id → record)
//! HELLO handshake ──► record_handshake ─┘         │
//!                                                 ├──► dial_candidates (inactive peers)
//!                                                 └──► reap_stale (unseen > 60s, no session)
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use reelsync_core::PeerRecord;

#[derive(Debug, Clone)]
struct PeerEntry {
    record: PeerRecord,
    /// Last local observation (scan or session traffic).
    observed: Instant,
}

/// Lock-guarded map of peer records keyed by device id.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<String, PeerEntry>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a record read from a bulletin-board descriptor.
    ///
    /// The freshest `lastSeen` wins; the entry counts as observed now.
    /// Returns true if the device was not known before.
    pub fn upsert_descriptor(&self, record: PeerRecord) -> bool {
        let mut peers = self.peers.lock();
        match peers.get_mut(&record.device_id) {
            Some(entry) => {
                entry.record.absorb(record);
                entry.observed = Instant::now();
                false
            }
            None => {
                peers.insert(
                    record.device_id.clone(),
                    PeerEntry {
                        record,
                        observed: Instant::now(),
                    },
                );
                true
            }
        }
    }

    /// Creates or refreshes a peer from a completed handshake.
    ///
    /// `ip` is the address the socket actually used and moves to the front
    /// of the candidate list.
    pub fn record_handshake(
        &self,
        device_id: &str,
        device_name: &str,
        ip: IpAddr,
        port: u16,
        now: i64,
    ) -> PeerRecord {
        let mut peers = self.peers.lock();
        let entry = peers
            .entry(device_id.to_string())
            .or_insert_with(|| PeerEntry {
                record: PeerRecord {
                    device_id: device_id.to_string(),
                    device_name: device_name.to_string(),
                    addresses: Vec::new(),
                    port,
                    last_seen: now,
                    is_active: true,
                },
                observed: Instant::now(),
            });

        entry.record.device_name = device_name.to_string();
        entry.record.port = port;
        entry.record.last_seen = entry.record.last_seen.max(now);
        entry.record.is_active = true;
        entry.record.prepend_address(ip);
        entry.observed = Instant::now();
        entry.record.clone()
    }

    /// Flags the peer as having no live session.
    pub fn mark_inactive(&self, device_id: &str) {
        if let Some(entry) = self.peers.lock().get_mut(device_id) {
            entry.record.is_active = false;
        }
    }

    /// Refreshes the local observation time (session traffic).
    pub fn touch(&self, device_id: &str) {
        if let Some(entry) = self.peers.lock().get_mut(device_id) {
            entry.observed = Instant::now();
        }
    }

    pub fn get(&self, device_id: &str) -> Option<PeerRecord> {
        self.peers.lock().get(device_id).map(|e| e.record.clone())
    }

    pub fn remove(&self, device_id: &str) -> Option<PeerRecord> {
        self.peers.lock().remove(device_id).map(|e| e.record)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// All records, ordered by device id.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> =
            self.peers.lock().values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        records
    }

    /// Peers without a live session, ordered by device id.
    pub fn dial_candidates(&self) -> Vec<PeerRecord> {
        self.snapshot()
            .into_iter()
            .filter(|record| !record.is_active)
            .collect()
    }

    /// Drops peers not observed within `max_unobserved` that have no live
    /// session according to `has_session`. Returns the device ids removed.
    pub fn reap_stale<F>(&self, max_unobserved: Duration, has_session: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let mut peers = self.peers.lock();
        let stale: Vec<String> = peers
            .iter()
            .filter(|(device_id, entry)| {
                entry.observed.elapsed() >= max_unobserved && !has_session(device_id)
            })
            .map(|(device_id, _)| device_id.clone())
            .collect();

        for device_id in &stale {
            peers.remove(device_id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(device_id: &str, last_seen: i64) -> PeerRecord {
        PeerRecord {
            device_id: device_id.into(),
            device_name: "Edit Bay".into(),
            addresses: vec!["192.168.1.20".parse().unwrap()],
            port: 49152,
            last_seen,
            is_active: false,
        }
    }

    #[test]
    fn test_upsert_keeps_freshest() {
        let table = PeerTable::new();
        assert!(table.upsert_descriptor(record("X", 10)));

        let mut stale = record("X", 5);
        stale.port = 1;
        assert!(!table.upsert_descriptor(stale));
        assert_eq!(table.get("X").unwrap().port, 49152);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_handshake_prepends_used_address_and_activates() {
        let table = PeerTable::new();
        table.upsert_descriptor(record("X", 10));

        let used: IpAddr = "100.100.1.1".parse().unwrap();
        let updated = table.record_handshake("X", "Edit Bay 2", used, 49160, 20);
        assert!(updated.is_active);
        assert_eq!(updated.addresses[0], used);
        assert_eq!(updated.port, 49160);
        assert!(table.dial_candidates().is_empty());

        table.mark_inactive("X");
        assert_eq!(table.dial_candidates().len(), 1);
    }

    #[test]
    fn test_handshake_creates_unknown_peer() {
        let table = PeerTable::new();
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        let created = table.record_handshake("Y", "Laptop", ip, 49155, 1);
        assert_eq!(created.addresses, vec![ip]);
        assert!(table.get("Y").unwrap().is_active);
    }

    #[test]
    fn test_reap_spares_connected_peers() {
        let table = PeerTable::new();
        table.upsert_descriptor(record("X", 1));
        table.upsert_descriptor(record("Y", 1));

        let reaped = table.reap_stale(Duration::ZERO, |device_id| device_id == "Y");
        assert_eq!(reaped, vec!["X".to_string()]);
        assert!(table.get("Y").is_some());

        let reaped = table.reap_stale(Duration::from_secs(60), |_| false);
        assert!(reaped.is_empty());
    }
}
