//! # Connection Engine
//!
//! Owns the listening socket and every peer socket: accept, connect, framed
//! send/receive, handshake, keepalive and teardown.
//!
//! ## Task Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       ConnectionEngine Tasks                            │
//! │                                                                         │
//! │  ┌───────────────────────────────────────────────────────────────────┐  │
//! │  │  Accept pool (accept_backlog tasks on one Arc<TcpListener>)       │  │
//! │  └──────────────────────────────┬────────────────────────────────────┘  │
//! │                                 │ accepted            connect(addr)     │
//! │                                 ▼                          │            │
//! │  ┌───────────────────────────────────────────────────────────────────┐  │
//! │  │  Per socket: HELLO queued immediately, then                       │  │
//! │  │                                                                   │  │
//! │  │   driver task (reader)               writer task                  │  │
//! │  │   ─────────────────────              ───────────                  │  │
//! │  │   read ──► FrameDecoder              mpsc<Bytes> ──► write loop   │  │
//! │  │        ──► dispatch                  (re-issues partial writes    │  │
//! │  │   ping tick / idle check              until the frame is flushed) │  │
//! │  │   close signal (watch)               close ──► drain ──► shutdown │  │
//! │  └───────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  DISPATCH                                                              │
//! │  HELLO         → PeerTable.record_handshake, SessionTable.register     │
//! │                  (older socket for the same device is closed; on a     │
//! │                  cross-dial the lower device id's socket survives)     │
//! │  CHANGE_NOTIFY → listener + notice channel (scheduler)                 │
//! │  PING          → PONG echoing the ping timestamp                       │
//! │  GOODBYE       → close                                                 │
//! │                                                                         │
//! │  TEARDOWN: SessionTable.remove_if(device, this socket) → peer marked   │
//! │            inactive → listener.on_peer_disconnected                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Listener callbacks always run after every engine lock is released.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use reelsync_core::{now_millis, PeerRecord};

use crate::collaborators::PeerEventListener;
use crate::config::{NetworkSettings, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::peers::PeerTable;
use crate::protocol::{ChangeNotice, FrameDecoder, HelloPayload, PeerMessage};
use crate::session::{Connection, ConnectionId, ConnectionState, Direction, Registration, SessionTable};
use crate::socket::{bind_listener, connect_with_timeout, tune_stream};

// =============================================================================
// Constants
// =============================================================================

/// Frames queued per socket before sends start failing.
const SEND_QUEUE_FRAMES: usize = 256;

/// Change notices buffered between the engine and the scheduler.
const NOTICE_QUEUE: usize = 256;

/// Receive buffer growth per read.
const READ_CHUNK: usize = 8 * 1024;

/// Time a writer gets to flush queued frames after its socket is closed.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed accept before the next one.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// =============================================================================
// Engine
// =============================================================================

/// What the reader does after dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct LiveConnection {
    connection: Arc<Connection>,
    task: JoinHandle<()>,
}

/// Multiplexes every peer socket of this device.
pub struct ConnectionEngine {
    device_id: String,
    device_name: String,
    network: NetworkSettings,
    clock_skew_tolerance_ms: i64,
    port: AtomicU16,
    peers: Arc<PeerTable>,
    sessions: Arc<SessionTable>,
    listener: Arc<dyn PeerEventListener>,
    notice_tx: mpsc::Sender<ChangeNotice>,
    shutdown_tx: watch::Sender<bool>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    live: Mutex<HashMap<ConnectionId, LiveConnection>>,
    dialing: Mutex<HashSet<String>>,
}

impl ConnectionEngine {
    /// Creates an engine. Nothing is bound until [`ConnectionEngine::start`].
    ///
    /// Returns the engine and the receiver for inbound `CHANGE_NOTIFY`
    /// messages.
    pub fn new(
        config: &SyncConfig,
        peers: Arc<PeerTable>,
        sessions: Arc<SessionTable>,
        listener: Arc<dyn PeerEventListener>,
    ) -> (Arc<Self>, mpsc::Receiver<ChangeNotice>) {
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_QUEUE);
        let (shutdown_tx, _) = watch::channel(false);

        let engine = Arc::new(ConnectionEngine {
            device_id: config.device_id().to_string(),
            device_name: config.device_name().to_string(),
            network: config.network.clone(),
            clock_skew_tolerance_ms: config.clock_skew_tolerance_ms,
            port: AtomicU16::new(0),
            peers,
            sessions,
            listener,
            notice_tx,
            shutdown_tx,
            accept_tasks: Mutex::new(Vec::new()),
            live: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
        });
        (engine, notice_rx)
    }

    /// Binds the listener (probing past taken ports) and starts the accept
    /// pool. Returns the bound port.
    pub fn start(self: &Arc<Self>) -> SyncResult<u16> {
        let bind_ip: IpAddr = self
            .network
            .bind_addr
            .parse()
            .map_err(|_| SyncError::InvalidConfig(format!("bind_addr {}", self.network.bind_addr)))?;

        let listener = bind_listener(
            bind_ip,
            self.network.preferred_port,
            self.network.port_probe_range,
        )?;
        let port = listener.local_addr()?.port();
        self.port.store(port, Ordering::SeqCst);

        let listener = Arc::new(listener);
        let mut accept_tasks = self.accept_tasks.lock();
        for slot in 0..self.network.accept_backlog.max(1) {
            let engine = Arc::clone(self);
            let listener = Arc::clone(&listener);
            accept_tasks.push(tokio::spawn(engine.accept_loop(listener, slot)));
        }

        info!(
            port,
            device_id = %self.device_id,
            accept_tasks = accept_tasks.len(),
            "Connection engine listening"
        );
        Ok(port)
    }

    /// The bound listening port, if started.
    pub fn local_port(&self) -> Option<u16> {
        match self.port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Every open socket, handshaken or not.
    pub fn connection_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.live
            .lock()
            .values()
            .map(|live| Arc::clone(&live.connection))
            .collect()
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    // =========================================================================
    // Accept / Connect
    // =========================================================================

    async fn accept_loop(self: Arc<Self>, listener: Arc<TcpListener>, slot: usize) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, slot, "Accepted connection");
                        if self.attach(stream, remote, Direction::Inbound).is_err() {
                            debug!(remote = %remote, slot, "Dropped connection accepted during shutdown");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, slot, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                _ = shutdown_rx.changed() => {}
            }
        }

        debug!(slot, "Accept task stopped");
    }

    /// Opens an outbound connection to `addr`. No retry.
    ///
    /// The returned connection is still handshaking.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> SyncResult<Arc<Connection>> {
        if self.is_shutting_down() {
            return Err(SyncError::ShuttingDown);
        }

        let stream = connect_with_timeout(addr, self.network.connect_timeout()).await?;
        debug!(addr = %addr, "Outbound connection established");
        self.attach(stream, addr, Direction::Outbound)
    }

    /// Tries each candidate address of `peer` in order, stopping at the
    /// first success.
    pub async fn connect_peer(self: &Arc<Self>, peer: &PeerRecord) -> SyncResult<Arc<Connection>> {
        if !self.dialing.lock().insert(peer.device_id.clone()) {
            return Err(SyncError::Internal(format!(
                "dial to {} already in progress",
                peer.device_id
            )));
        }

        let mut result = Err(SyncError::PeerUnreachable(peer.device_id.clone()));
        for addr in peer.socket_addrs() {
            match self.connect(addr).await {
                Ok(connection) => {
                    info!(device_id = %peer.device_id, addr = %addr, "Connected to peer");
                    result = Ok(connection);
                    break;
                }
                Err(SyncError::ShuttingDown) => {
                    result = Err(SyncError::ShuttingDown);
                    break;
                }
                Err(e) => {
                    debug!(device_id = %peer.device_id, addr = %addr, error = %e, "Candidate address failed");
                }
            }
        }

        self.dialing.lock().remove(&peer.device_id);
        result
    }

    /// Registers a socket and spawns its tasks. HELLO is queued first.
    ///
    /// Fails once shutdown has begun; the flag is checked under the `live`
    /// lock so a socket is either refused here or drained by `shutdown`.
    fn attach(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        direction: Direction,
    ) -> SyncResult<Arc<Connection>> {
        tune_stream(&stream);

        let (connection, outgoing_rx, close_rx) = Connection::new(remote, direction, SEND_QUEUE_FRAMES);
        connection.set_state(ConnectionState::Handshaking);

        let hello = PeerMessage::hello(
            &self.device_id,
            &self.device_name,
            self.local_port().unwrap_or(0),
            now_millis(),
        );
        if let Err(e) = connection.send(&hello) {
            warn!(remote = %remote, error = %e, "Failed to queue HELLO");
        }

        let mut live = self.live.lock();
        if self.is_shutting_down() {
            connection.close();
            connection.set_state(ConnectionState::Closed);
            return Err(SyncError::ShuttingDown);
        }
        let task = tokio::spawn(Arc::clone(self).drive(
            Arc::clone(&connection),
            stream,
            outgoing_rx,
            close_rx,
        ));
        live.insert(
            connection.id(),
            LiveConnection {
                connection: Arc::clone(&connection),
                task,
            },
        );
        Ok(connection)
    }

    // =========================================================================
    // Per-Socket Tasks
    // =========================================================================

    async fn drive(
        self: Arc<Self>,
        connection: Arc<Connection>,
        stream: TcpStream,
        outgoing_rx: mpsc::Receiver<Bytes>,
        close_rx: watch::Receiver<bool>,
    ) {
        let (reader, writer) = stream.into_split();
        let mut writer_task = tokio::spawn(write_loop(
            Arc::clone(&connection),
            writer,
            outgoing_rx,
            close_rx.clone(),
        ));

        match self.read_loop(&connection, reader, close_rx).await {
            Ok(()) => {}
            Err(e) if e.is_protocol_error() => {
                warn!(
                    connection_id = connection.id(),
                    remote = %connection.remote(),
                    error = %e,
                    "Protocol violation, closing connection"
                );
            }
            Err(e) => {
                debug!(
                    connection_id = connection.id(),
                    remote = %connection.remote(),
                    error = %e,
                    "Connection ended"
                );
            }
        }

        connection.close();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
            writer_task.abort();
        }

        self.finish(&connection);
    }

    async fn read_loop(
        &self,
        connection: &Arc<Connection>,
        mut reader: OwnedReadHalf,
        mut close_rx: watch::Receiver<bool>,
    ) -> SyncResult<()> {
        let mut decoder = FrameDecoder::new(
            self.network.max_frame_bytes,
            self.network.max_zero_length_frames,
        );

        let period = self.network.ping_interval();
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *close_rx.borrow() {
                return Ok(());
            }
            decoder.buffer_mut().reserve(READ_CHUNK);

            tokio::select! {
                read = reader.read_buf(decoder.buffer_mut()) => {
                    if read? == 0 {
                        debug!(connection_id = connection.id(), "Peer closed the socket");
                        return Ok(());
                    }
                    connection.touch();

                    loop {
                        match decoder.next_message() {
                            Ok(Some(message)) => {
                                if self.dispatch(connection, message).await == Flow::Close {
                                    return Ok(());
                                }
                            }
                            Ok(None) => break,
                            Err(SyncError::UnknownMessageType(kind)) => {
                                warn!(connection_id = connection.id(), kind, "Ignoring unknown message type");
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                changed = close_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = ping.tick() => {
                    let idle = connection.idle_for();
                    if idle >= self.network.idle_timeout() {
                        info!(
                            connection_id = connection.id(),
                            device_id = ?connection.device_id(),
                            idle_secs = idle.as_secs(),
                            "Closing idle connection"
                        );
                        return Ok(());
                    }
                    connection.send(&PeerMessage::ping(now_millis()))?;
                }
            }
        }
    }

    async fn dispatch(&self, connection: &Arc<Connection>, message: PeerMessage) -> Flow {
        trace!(connection_id = connection.id(), msg_type = message.type_name(), "Received message");

        let handshaken = connection.device_id();
        if let Some(device_id) = &handshaken {
            self.peers.touch(device_id);
        }

        match message {
            PeerMessage::Hello(hello) => self.on_hello(connection, hello),
            PeerMessage::Goodbye(goodbye) => {
                info!(device_id = %goodbye.device_id, "Peer said goodbye");
                Flow::Close
            }
            _ if handshaken.is_none() => {
                debug!(
                    connection_id = connection.id(),
                    msg_type = message.type_name(),
                    "Ignoring message before handshake"
                );
                Flow::Continue
            }
            PeerMessage::ChangeNotify(notice) => {
                debug!(
                    project_id = %notice.project_id,
                    device_id = %notice.device_id,
                    timestamp = notice.timestamp,
                    "Change notification"
                );
                self.listener.on_change_notify(&notice);
                if self.notice_tx.send(notice).await.is_err() {
                    debug!("Notice receiver dropped");
                }
                Flow::Continue
            }
            PeerMessage::Ping(ping) => {
                if let Err(e) = connection.send(&PeerMessage::pong(ping.timestamp, now_millis())) {
                    debug!(connection_id = connection.id(), error = %e, "Failed to queue PONG");
                }
                Flow::Continue
            }
            PeerMessage::Pong(pong) => {
                trace!(rtt_ms = now_millis() - pong.ping_timestamp, "Pong");
                Flow::Continue
            }
        }
    }

    fn on_hello(&self, connection: &Arc<Connection>, hello: HelloPayload) -> Flow {
        if hello.device_id == self.device_id {
            warn!(remote = %connection.remote(), "Connected to self, closing");
            return Flow::Close;
        }
        if let Some(existing) = connection.device_id() {
            if existing != hello.device_id {
                warn!(
                    connection_id = connection.id(),
                    expected = %existing,
                    got = %hello.device_id,
                    "Device changed identity mid-session"
                );
                return Flow::Close;
            }
        }

        let now = now_millis();
        let skew = (now - hello.timestamp).abs();
        if skew > self.clock_skew_tolerance_ms {
            debug!(device_id = %hello.device_id, skew_ms = skew, "Peer clock skew above tolerance");
        }

        let record = self.peers.record_handshake(
            &hello.device_id,
            &hello.device_name,
            connection.remote().ip(),
            hello.port,
            now,
        );
        connection.activate(&hello.device_id);

        match self
            .sessions
            .register(&self.device_id, &hello.device_id, Arc::clone(connection))
        {
            Registration::Registered => {}
            Registration::Replaced(replaced) => {
                info!(
                    device_id = %hello.device_id,
                    old_connection = replaced.id(),
                    new_connection = connection.id(),
                    "Replacing existing session"
                );
                replaced.close();
            }
            Registration::Rejected(kept) => {
                debug!(
                    device_id = %hello.device_id,
                    kept_connection = kept.id(),
                    dropped_connection = connection.id(),
                    "Cross-dial, keeping the lower device id's socket"
                );
                return Flow::Close;
            }
        }

        info!(
            device_id = %hello.device_id,
            device_name = %hello.device_name,
            remote = %connection.remote(),
            direction = ?connection.direction(),
            "Peer session active"
        );
        self.listener.on_peer_connected(&record);
        Flow::Continue
    }

    /// Teardown after both socket tasks have stopped.
    fn finish(&self, connection: &Arc<Connection>) {
        connection.set_state(ConnectionState::Closed);
        self.live.lock().remove(&connection.id());

        if let Some(device_id) = connection.device_id() {
            if self.sessions.remove_if(&device_id, connection.id()) {
                self.peers.mark_inactive(&device_id);
                info!(device_id = %device_id, "Peer session closed");
                self.listener.on_peer_disconnected(&device_id);
            }
        }
    }

    // =========================================================================
    // Broadcast / Shutdown
    // =========================================================================

    /// Queues `message` on every active session. Returns how many accepted it.
    pub fn broadcast(&self, message: &PeerMessage) -> SyncResult<usize> {
        let frame = message.encode()?;
        let mut delivered = 0;

        for connection in self.sessions.connections() {
            match connection.send_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    device_id = ?connection.device_id(),
                    msg_type = message.type_name(),
                    error = %e,
                    "Broadcast send failed"
                ),
            }
        }
        Ok(delivered)
    }

    /// Says GOODBYE to every session, closes every socket and joins every
    /// engine task.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(device_id = %self.device_id, "Connection engine shutting down");

        let goodbye = PeerMessage::goodbye(&self.device_id, now_millis());
        for connection in self.sessions.connections() {
            if let Err(e) = connection.send(&goodbye) {
                debug!(connection_id = connection.id(), error = %e, "Failed to queue GOODBYE");
            }
        }

        let accept_tasks: Vec<JoinHandle<()>> = self.accept_tasks.lock().drain(..).collect();
        for task in accept_tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Accept task failed");
            }
        }

        let live: Vec<LiveConnection> = self.live.lock().drain().map(|(_, live)| live).collect();
        for entry in &live {
            entry.connection.close();
        }
        for entry in live {
            if let Err(e) = entry.task.await {
                warn!(connection_id = entry.connection.id(), error = %e, "Connection task failed");
            }
        }

        self.port.store(0, Ordering::SeqCst);
        info!("Connection engine stopped");
    }
}

// =============================================================================
// Writer
// =============================================================================

async fn write_loop(
    connection: Arc<Connection>,
    mut writer: OwnedWriteHalf,
    mut outgoing_rx: mpsc::Receiver<Bytes>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        if *close_rx.borrow() {
            break;
        }

        tokio::select! {
            biased;
            frame = outgoing_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!(connection_id = connection.id(), error = %e, "Write failed");
                        connection.close();
                        return;
                    }
                }
                None => break,
            },
            changed = close_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    // Flush frames queued before the close, GOODBYE among them.
    while let Ok(frame) = outgoing_rx.try_recv() {
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Writes one frame, re-issuing the write for the remainder after a short
/// write until every byte is transferred.
async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    let mut written = 0;
    while written < frame.len() {
        let n = writer.write(&frame[written..]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        written += n;
        if written < frame.len() {
            trace!(written, total = frame.len(), "Partial write");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;
    use crate::collaborators::NoOpListener;

    fn config(device_id: &str) -> SyncConfig {
        let mut config = SyncConfig::new();
        config.device.id = device_id.to_string();
        config.device.name = format!("Bay {}", device_id);
        config.network.bind_addr = "127.0.0.1".to_string();
        config.network.preferred_port = 0;
        config.network.port_probe_range = 1;
        config.network.accept_backlog = 2;
        config
    }

    fn engine(device_id: &str) -> (Arc<ConnectionEngine>, mpsc::Receiver<ChangeNotice>) {
        ConnectionEngine::new(
            &config(device_id),
            Arc::new(PeerTable::new()),
            Arc::new(SessionTable::new()),
            Arc::new(NoOpListener),
        )
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_handshake_registers_both_sides() {
        let (a, _a_rx) = engine("A");
        let (b, _b_rx) = engine("B");
        a.start().unwrap();
        let b_port = b.start().unwrap();

        a.connect(SocketAddr::from(([127, 0, 0, 1], b_port))).await.unwrap();

        wait_for(|| a.sessions.contains("B") && b.sessions.contains("A")).await;
        let b_seen_by_a = a.peers.get("B").unwrap();
        assert!(b_seen_by_a.is_active);
        assert_eq!(b_seen_by_a.port, b_port);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_change_notify_reaches_notice_channel() {
        let (a, _a_rx) = engine("A");
        let (b, mut b_rx) = engine("B");
        a.start().unwrap();
        let b_port = b.start().unwrap();

        a.connect(SocketAddr::from(([127, 0, 0, 1], b_port))).await.unwrap();
        wait_for(|| a.sessions.contains("B")).await;

        let sent = a.broadcast(&PeerMessage::change_notify("proj", "A", 1000)).unwrap();
        assert_eq!(sent, 1);

        let notice = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.project_id, "proj");
        assert_eq!(notice.timestamp, 1000);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_says_goodbye() {
        let (a, _a_rx) = engine("A");
        let (b, _b_rx) = engine("B");
        a.start().unwrap();
        let b_port = b.start().unwrap();

        a.connect(SocketAddr::from(([127, 0, 0, 1], b_port))).await.unwrap();
        wait_for(|| b.sessions.contains("A")).await;

        a.shutdown().await;
        wait_for(|| !b.sessions.contains("A")).await;
        assert!(!b.peers.get("A").unwrap().is_active);
        assert!(a.connect(SocketAddr::from(([127, 0, 0, 1], b_port))).await.is_err());

        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_peer_tries_every_candidate() {
        let (a, _a_rx) = engine("A");
        a.start().unwrap();

        let closed = bind_listener(IpAddr::from([127, 0, 0, 1]), 0, 1).unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let peer = PeerRecord {
            device_id: "Z".into(),
            device_name: "Gone".into(),
            addresses: vec![IpAddr::from([127, 0, 0, 1])],
            port,
            last_seen: 0,
            is_active: false,
        };
        let err = a.connect_peer(&peer).await.unwrap_err();
        assert!(matches!(err, SyncError::PeerUnreachable(_)));
        assert!(err.is_retryable());

        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_attach_after_shutdown_is_refused() {
        let (a, _a_rx) = engine("A");
        a.start().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let stream = dialed.unwrap();
        let (mut far_end, _) = accepted.unwrap();

        // A dial that finishes after shutdown has drained the live set.
        a.shutdown().await;
        let err = a.attach(stream, addr, Direction::Outbound).unwrap_err();
        assert!(matches!(err, SyncError::ShuttingDown));
        assert_eq!(a.connection_count(), 0);

        // The socket is dropped without ever sending HELLO.
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), far_end.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty());
    }

    /// Accepts at most `per_call` bytes per write.
    struct Trickle {
        accepted: Vec<u8>,
        per_call: usize,
        calls: usize,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let n = buf.len().min(self.per_call);
            self.accepted.extend_from_slice(&buf[..n]);
            self.calls += 1;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_short_writes_continue_until_frame_is_sent() {
        let frame = PeerMessage::change_notify("proj", "A", 1000).encode().unwrap();
        let mut writer = Trickle {
            accepted: Vec::new(),
            per_call: 3,
            calls: 0,
        };

        write_frame(&mut writer, &frame).await.unwrap();

        assert_eq!(writer.accepted, frame.to_vec());
        assert_eq!(writer.calls, (frame.len() + 2) / 3);

        let mut decoder = FrameDecoder::new(1024, 10);
        decoder.extend(&writer.accepted);
        match decoder.next_message().unwrap() {
            Some(PeerMessage::ChangeNotify(notice)) => {
                assert_eq!(notice.project_id, "proj");
                assert_eq!(notice.timestamp, 1000);
            }
            other => panic!("expected CHANGE_NOTIFY, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_byte_write_is_an_error() {
        let mut writer = Trickle {
            accepted: Vec::new(),
            per_call: 0,
            calls: 0,
        };
        let err = write_frame(&mut writer, b"frame").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WriteZero);
        assert_eq!(writer.calls, 1);
    }
}
