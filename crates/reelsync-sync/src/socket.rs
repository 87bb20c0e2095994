//! Socket plumbing for the connection engine: exclusive port binding with
//! linear probing, bounded connects, per-socket options, and local address
//! enumeration for peer descriptors.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use reelsync_core::sort_addresses;

use crate::error::{SyncError, SyncResult};

const LISTEN_BACKLOG: i32 = 128;
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

// =============================================================================
// Listen
// =============================================================================

/// Binds the first free port in `preferred..preferred + range`.
///
/// Address reuse is disabled so two engines on one host can never share a
/// port. A preferred port of 0 asks the OS for any free port.
pub fn bind_listener(bind_ip: IpAddr, preferred: u16, range: u16) -> SyncResult<TcpListener> {
    let last = preferred.saturating_add(range.saturating_sub(1));

    for port in preferred..=last {
        let addr = SocketAddr::new(bind_ip, port);
        match bind_exclusive(addr) {
            Ok(listener) => {
                debug!(addr = %addr, "Bound listener");
                return Ok(listener);
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "Port unavailable, probing next");
                if port == 0 {
                    break;
                }
            }
        }
    }

    Err(SyncError::BindFailed {
        first: preferred,
        last,
    })
}

fn bind_exclusive(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(false)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

// =============================================================================
// Connect
// =============================================================================

/// Connects to `addr`, giving up after `timeout`. No retry.
pub async fn connect_with_timeout(addr: SocketAddr, timeout: Duration) -> SyncResult<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(SyncError::ConnectFailed {
            addr,
            reason: e.to_string(),
        }),
        Err(_) => Err(SyncError::ConnectTimeout {
            addr,
            millis: timeout.as_millis() as u64,
        }),
    }
}

/// Enables `TCP_NODELAY` and keepalive on an accepted or connected socket.
///
/// Failures are logged; the socket stays usable without them.
pub fn tune_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "Failed to set TCP_NODELAY");
    }

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "Failed to enable TCP keepalive");
    }
}

// =============================================================================
// Local Addresses
// =============================================================================

/// Non-loopback IPv4 addresses of this host, most preferred first.
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => sort_addresses(interfaces.into_iter().filter_map(|iface| {
            match iface.ip() {
                IpAddr::V4(ip) if !iface.is_loopback() => Some(ip),
                _ => None,
            }
        })),
        Err(e) => {
            warn!(error = %e, "Failed to enumerate network interfaces");
            Vec::new()
        }
    }
}
