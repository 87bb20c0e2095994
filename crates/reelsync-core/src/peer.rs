//! # Peer Records
//!
//! What one device knows about another: identity, candidate addresses and
//! freshness. Two representations exist:
//!
//! - [`PeerDescriptor`] - the JSON file a device publishes on the bulletin
//!   board (`peers/<device_id>.json`)
//! - [`PeerRecord`] - the in-memory entry in the peer table
//!
//! ## Address Preference
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  Candidate Address Ordering                             │
//! │                                                                         │
//! │  1. Private LAN   10/8, 172.16/12, 192.168/16   (same office network)  │
//! │  2. VPN           100.64/10, 25/8, 26/8         (overlay networks)     │
//! │  3. Other         anything routable                                    │
//! │  ✗  Loopback / unspecified / broadcast          (never published)      │
//! │                                                                         │
//! │  Dialers try candidates in this order and stop at the first success.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Address Ranking
// =============================================================================

/// Preference class of a local IPv4 address. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressClass {
    PrivateLan = 0,
    Vpn = 1,
    Other = 2,
}

/// Classifies an address, returning `None` for addresses never advertised.
pub fn rank_address(ip: &Ipv4Addr) -> Option<AddressClass> {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() {
        return None;
    }

    let [a, b, _, _] = ip.octets();

    if ip.is_private() {
        return Some(AddressClass::PrivateLan);
    }

    // 100.64.0.0/10 carrier-grade NAT (Tailscale, ZeroTier style overlays),
    // 25.0.0.0/8 and 26.0.0.0/8 are used by common LAN-over-VPN tools.
    let cgnat = a == 100 && (64..=127).contains(&b);
    if cgnat || a == 25 || a == 26 {
        return Some(AddressClass::Vpn);
    }

    Some(AddressClass::Other)
}

/// Filters, deduplicates and orders addresses by preference.
///
/// Ordering within a class is by numeric address so the output is stable.
pub fn sort_addresses<I>(addresses: I) -> Vec<Ipv4Addr>
where
    I: IntoIterator<Item = Ipv4Addr>,
{
    let mut ranked: Vec<(AddressClass, Ipv4Addr)> = addresses
        .into_iter()
        .filter_map(|ip| rank_address(&ip).map(|class| (class, ip)))
        .collect();

    ranked.sort();
    ranked.dedup();
    ranked.into_iter().map(|(_, ip)| ip).collect()
}

// =============================================================================
// Bulletin-Board Descriptor
// =============================================================================

/// Reachability descriptor published on the shared bulletin board.
///
/// ## File Format
/// ```json
/// {
///   "deviceId": "6c1f...",
///   "deviceName": "Edit Bay 2",
///   "ipAddresses": ["192.168.1.20", "100.101.7.3"],
///   "port": 49152,
///   "lastSeen": 1760000000000
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub device_id: String,
    pub device_name: String,
    pub ip_addresses: Vec<String>,
    pub port: u16,
    pub last_seen: i64,
}

impl PeerDescriptor {
    /// Returns true if `lastSeen` is older than `max_age_ms` at `now`.
    pub fn is_expired(&self, now: i64, max_age_ms: i64) -> bool {
        now.saturating_sub(self.last_seen) > max_age_ms
    }

    /// Returns true if both descriptors advertise the same endpoint.
    ///
    /// `lastSeen` and the display name are ignored.
    pub fn same_endpoint(&self, other: &PeerDescriptor) -> bool {
        self.port == other.port && self.ip_addresses == other.ip_addresses
    }
}

// =============================================================================
// Peer Record
// =============================================================================

/// In-memory view of a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// Remote device identifier.
    pub device_id: String,

    /// Human-readable device name.
    pub device_name: String,

    /// Candidate addresses, most preferred first.
    pub addresses: Vec<IpAddr>,

    /// Listening port of the remote engine.
    pub port: u16,

    /// Last time the peer was heard of (Unix ms).
    pub last_seen: i64,

    /// True while a live session exists.
    pub is_active: bool,
}

impl PeerRecord {
    /// Builds a record from a bulletin-board descriptor.
    ///
    /// Unparseable addresses are dropped. A descriptor with no device id or
    /// no usable address is rejected.
    pub fn from_descriptor(descriptor: &PeerDescriptor) -> CoreResult<Self> {
        if descriptor.device_id.is_empty() {
            return Err(CoreError::EmptyDeviceId);
        }

        let addresses: Vec<IpAddr> = descriptor
            .ip_addresses
            .iter()
            .filter_map(|raw| raw.parse::<IpAddr>().ok())
            .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
            .collect();

        if addresses.is_empty() {
            return Err(CoreError::InvalidDescriptor(format!(
                "descriptor for {} lists no usable address",
                descriptor.device_id
            )));
        }

        Ok(PeerRecord {
            device_id: descriptor.device_id.clone(),
            device_name: descriptor.device_name.clone(),
            addresses,
            port: descriptor.port,
            last_seen: descriptor.last_seen,
            is_active: false,
        })
    }

    /// Moves `ip` to the front of the candidate list (inserting it if new).
    pub fn prepend_address(&mut self, ip: IpAddr) {
        self.addresses.retain(|existing| *existing != ip);
        self.addresses.insert(0, ip);
    }

    /// Candidate socket addresses in dial order.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.port))
            .collect()
    }

    /// Folds a fresher observation of the same device into this record.
    ///
    /// Identity fields come from whichever observation is newer; the active
    /// flag is never cleared here.
    pub fn absorb(&mut self, newer: PeerRecord) {
        if newer.last_seen < self.last_seen {
            return;
        }
        let active = self.is_active || newer.is_active;
        *self = newer;
        self.is_active = active;
    }
}
