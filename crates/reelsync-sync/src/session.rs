//! # Peer Sessions
//!
//! One [`Connection`] per live socket and the [`SessionTable`] mapping each
//! handshaken device to its connection.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Per-Socket State Machine                             │
//! │                                                                         │
//! │  ┌────────────┐  socket up   ┌─────────────┐  HELLO received ┌────────┐ │
//! │  │ Connecting │ ───────────► │ Handshaking │ ──────────────► │ Active │ │
//! │  └────────────┘  HELLO sent  └──────┬──────┘                 └───┬────┘ │
//! │                                     │                            │      │
//! │                      error / GOODBYE / shutdown / replaced       │      │
//! │                                     ▼                            │      │
//! │                               ┌───────────┐ ◄────────────────────┘      │
//! │                               │  Closing  │                             │
//! │                               └─────┬─────┘                             │
//! │                                     │ reader + writer tasks exit        │
//! │                                     ▼                                   │
//! │                               ┌───────────┐                             │
//! │                               │  Closed   │                             │
//! │                               └───────────┘                             │
//! │                                                                         │
//! │  SESSION TABLE (one lock, device_id → connection)                      │
//! │  ─────────────                                                         │
//! │  register: HELLO completes; an older connection for the same device    │
//! │            is returned to the caller, which closes it. When both ends  │
//! │            dialed each other, the socket opened by the lower device    │
//! │            id wins on both sides                                       │
//! │  remove_if: only removes the mapping if it still points at the         │
//! │             closing connection                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::protocol::PeerMessage;

/// Identifier of one socket for the lifetime of the process.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Two sockets of opposite direction handshaking within this window are
/// treated as a cross-dial. Outside it the newer socket always wins, so a
/// restarted peer can replace a half-dead session.
pub const CROSS_DIAL_WINDOW: Duration = Duration::from_secs(5);

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Connection State
// =============================================================================

/// Per-socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Handshaking => write!(f, "handshaking"),
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

// =============================================================================
// Connection
// =============================================================================

/// Shared handle to one socket's reader/writer task pair.
///
/// Dropping every handle does not close the socket; [`Connection::close`]
/// does, by signalling both tasks.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    direction: Direction,
    outgoing: mpsc::Sender<Bytes>,
    close_tx: watch::Sender<bool>,
    inner: Mutex<ConnectionInner>,
}

#[derive(Debug)]
struct ConnectionInner {
    state: ConnectionState,
    device_id: Option<String>,
    last_activity: Instant,
    activated_at: Option<Instant>,
}

impl Connection {
    /// Creates a connection handle plus the receiving ends its tasks own.
    pub fn new(
        remote: SocketAddr,
        direction: Direction,
        send_queue: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>, watch::Receiver<bool>) {
        let (outgoing, outgoing_rx) = mpsc::channel(send_queue.max(1));
        let (close_tx, close_rx) = watch::channel(false);

        let connection = Arc::new(Connection {
            id: next_connection_id(),
            remote,
            direction,
            outgoing,
            close_tx,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Connecting,
                device_id: None,
                last_activity: Instant::now(),
                activated_at: None,
            }),
        });
        (connection, outgoing_rx, close_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn device_id(&self) -> Option<String> {
        self.inner.lock().device_id.clone()
    }

    /// Moves to `state` unless the connection is already closing.
    pub fn set_state(&self, state: ConnectionState) {
        let mut inner = self.inner.lock();
        let closing = matches!(inner.state, ConnectionState::Closing | ConnectionState::Closed);
        if !closing || state == ConnectionState::Closed {
            inner.state = state;
        }
    }

    /// Records the handshake and marks the connection active.
    pub fn activate(&self, device_id: &str) {
        let mut inner = self.inner.lock();
        inner.device_id = Some(device_id.to_string());
        if inner.state == ConnectionState::Handshaking || inner.state == ConnectionState::Connecting {
            inner.state = ConnectionState::Active;
        }
        inner.activated_at.get_or_insert_with(Instant::now);
    }

    /// Time since the first HELLO on this socket, if any.
    pub fn active_for(&self) -> Option<Duration> {
        self.inner.lock().activated_at.map(|at| at.elapsed())
    }

    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }

    pub fn is_open(&self) -> bool {
        !*self.close_tx.borrow()
    }

    /// Queues an encoded frame for the writer task.
    ///
    /// Never waits: a full send queue means the peer has stopped reading.
    pub fn send_frame(&self, frame: Bytes) -> SyncResult<()> {
        if !self.is_open() {
            return Err(SyncError::Disconnected);
        }
        self.outgoing.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SyncError::ChannelError(format!("send queue full for connection {}", self.id))
            }
            mpsc::error::TrySendError::Closed(_) => SyncError::Disconnected,
        })
    }

    pub fn send(&self, message: &PeerMessage) -> SyncResult<()> {
        self.send_frame(message.encode()?)
    }

    /// Signals both socket tasks to stop. Idempotent.
    pub fn close(&self) {
        self.set_state(ConnectionState::Closing);
        if self.close_tx.send_replace(true) {
            return;
        }
        debug!(connection_id = self.id, remote = %self.remote, "Closing connection");
    }
}

// =============================================================================
// Session Table
// =============================================================================

/// Snapshot of one live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub device_id: String,
    pub connection_id: ConnectionId,
    pub remote: SocketAddr,
    pub direction: Direction,
    pub state: ConnectionState,
}

/// Outcome of [`SessionTable::register`].
#[derive(Debug)]
pub enum Registration {
    /// The table now maps the device to the new connection.
    Registered,
    /// The new connection took over; the caller closes the returned one.
    Replaced(Arc<Connection>),
    /// The existing connection won a cross-dial; the caller closes the new one.
    Rejected(Arc<Connection>),
}

/// Whether `existing` stays mapped when `candidate` handshakes for `peer_id`.
///
/// Only sockets of opposite direction that handshook close together are
/// compared; both ends then keep the socket dialed by the lower device id.
fn keeps_existing(local_id: &str, peer_id: &str, existing: &Connection, candidate: &Connection) -> bool {
    if !existing.is_open() || existing.direction() == candidate.direction() {
        return false;
    }
    match existing.active_for() {
        Some(age) if age <= CROSS_DIAL_WINDOW => {}
        _ => return false,
    }
    let preferred = if local_id < peer_id {
        Direction::Outbound
    } else {
        Direction::Inbound
    };
    existing.direction() == preferred
}

/// Device id ↔ live connection map.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Arc<Connection>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `device_id` to `connection` for the device `local_id`.
    ///
    /// An older socket for the same device is normally replaced and returned
    /// for the caller to close. A cross-dial keeps whichever socket the lower
    /// device id opened, so both ends settle on the same one.
    pub fn register(&self, local_id: &str, device_id: &str, connection: Arc<Connection>) -> Registration {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(device_id) {
            if existing.id() == connection.id() {
                return Registration::Registered;
            }
            if keeps_existing(local_id, device_id, existing, &connection) {
                return Registration::Rejected(Arc::clone(existing));
            }
        }
        match sessions.insert(device_id.to_string(), connection) {
            Some(previous) => Registration::Replaced(previous),
            None => Registration::Registered,
        }
    }

    /// Removes the mapping for `device_id` only if it still points at
    /// `connection_id`. Returns true if it was removed.
    pub fn remove_if(&self, device_id: &str, connection_id: ConnectionId) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(device_id) {
            Some(current) if current.id() == connection_id => {
                sessions.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<Connection>> {
        self.sessions.lock().get(device_id).cloned()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.sessions.lock().contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// All live connections, cloned out so callers can send without the lock.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .lock()
            .iter()
            .map(|(device_id, connection)| SessionInfo {
                device_id: device_id.clone(),
                connection_id: connection.id(),
                remote: connection.remote(),
                direction: connection.direction(),
                state: connection.state(),
            })
            .collect();
        infos.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        infos
    }

    /// Empties the table, returning every connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.sessions.lock().drain().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Arc<Connection> {
        dialed(Direction::Inbound)
    }

    fn dialed(direction: Direction) -> Arc<Connection> {
        let (connection, _rx, _close) =
            Connection::new("192.168.1.20:50000".parse().unwrap(), direction, 8);
        connection
    }

    fn handshaken(direction: Direction, device_id: &str) -> Arc<Connection> {
        let connection = dialed(direction);
        connection.set_state(ConnectionState::Handshaking);
        connection.activate(device_id);
        connection
    }

    #[test]
    fn test_register_returns_replaced_connection() {
        let table = SessionTable::new();
        let first = connection();
        let second = connection();

        assert!(matches!(table.register("A", "X", first.clone()), Registration::Registered));
        match table.register("A", "X", second.clone()) {
            Registration::Replaced(replaced) => assert_eq!(replaced.id(), first.id()),
            other => panic!("expected replacement, got {:?}", other),
        }
        assert_eq!(table.get("X").unwrap().id(), second.id());

        // Re-registering the same socket is not a replacement.
        assert!(matches!(table.register("A", "X", second.clone()), Registration::Registered));
    }

    #[test]
    fn test_cross_dial_keeps_lower_id_dialer_on_both_ends() {
        // Socket 1: A dialed B. Socket 2: B dialed A.
        let a_table = SessionTable::new();
        let a_side_1 = handshaken(Direction::Outbound, "B");
        let a_side_2 = handshaken(Direction::Inbound, "B");

        let b_table = SessionTable::new();
        let b_side_1 = handshaken(Direction::Inbound, "A");
        let b_side_2 = handshaken(Direction::Outbound, "A");

        // A sees its own socket first and keeps it.
        a_table.register("A", "B", a_side_1.clone());
        match a_table.register("A", "B", a_side_2.clone()) {
            Registration::Rejected(kept) => assert_eq!(kept.id(), a_side_1.id()),
            other => panic!("expected rejection, got {:?}", other),
        }

        // B sees its own socket first and gives it up.
        b_table.register("B", "A", b_side_2.clone());
        match b_table.register("B", "A", b_side_1.clone()) {
            Registration::Replaced(old) => assert_eq!(old.id(), b_side_2.id()),
            other => panic!("expected replacement, got {:?}", other),
        }

        assert_eq!(a_table.get("B").unwrap().direction(), Direction::Outbound);
        assert_eq!(b_table.get("A").unwrap().direction(), Direction::Inbound);
    }

    #[test]
    fn test_same_direction_duplicate_always_replaces() {
        let table = SessionTable::new();
        let first = handshaken(Direction::Outbound, "X");
        let second = handshaken(Direction::Outbound, "X");
        table.register("A", "X", first);
        assert!(matches!(
            table.register("A", "X", second.clone()),
            Registration::Replaced(_)
        ));
        assert_eq!(table.get("X").unwrap().id(), second.id());
    }

    #[test]
    fn test_closed_preferred_socket_does_not_block_replacement() {
        let table = SessionTable::new();
        let preferred = handshaken(Direction::Outbound, "X");
        table.register("A", "X", preferred.clone());
        preferred.close();

        let inbound = handshaken(Direction::Inbound, "X");
        assert!(matches!(
            table.register("A", "X", inbound.clone()),
            Registration::Replaced(_)
        ));
        assert_eq!(table.get("X").unwrap().id(), inbound.id());
    }

    #[test]
    fn test_remove_if_ignores_stale_connection() {
        let table = SessionTable::new();
        let old = connection();
        let new = connection();
        table.register("A", "X", old.clone());
        table.register("A", "X", new.clone());

        // Cleanup of the replaced socket leaves the new mapping alone.
        assert!(!table.remove_if("X", old.id()));
        assert!(table.contains("X"));

        assert!(table.remove_if("X", new.id()));
        assert!(table.is_empty());
    }

    #[test]
    fn test_connection_state_transitions() {
        let conn = connection();
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.set_state(ConnectionState::Handshaking);
        conn.activate("X");
        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(conn.device_id().as_deref(), Some("X"));

        conn.close();
        assert!(!conn.is_open());
        assert_eq!(conn.state(), ConnectionState::Closing);

        // A closing connection cannot become active again.
        conn.set_state(ConnectionState::Active);
        assert_eq!(conn.state(), ConnectionState::Closing);
        conn.set_state(ConnectionState::Closed);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_send_after_close_fails() {
        let conn = connection();
        conn.close();
        assert!(matches!(
            conn.send(&PeerMessage::ping(1)),
            Err(SyncError::Disconnected)
        ));
    }

    #[test]
    fn test_send_queue_full() {
        let (conn, _rx, _close) =
            Connection::new("192.168.1.20:50000".parse().unwrap(), Direction::Outbound, 1);
        conn.send(&PeerMessage::ping(1)).unwrap();
        assert!(conn.send(&PeerMessage::ping(2)).is_err());
    }
}
