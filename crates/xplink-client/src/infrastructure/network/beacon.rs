//! Multicast beacon discovery of the simulator.
//!
//! The simulator announces itself on a well-known multicast group with a
//! small binary beacon (see [`xplink_core::protocol::beacon`] for the
//! packet layout). The listener here joins the group, waits for the first
//! parseable beacon, and reports the simulator's endpoint: the UDP source
//! address supplies the host, the beacon payload supplies the API port.
//!
//! The socket work runs on a dedicated thread so the blocking `recv_from`
//! never stalls the Tokio runtime. The thread polls with a short read
//! timeout and re-checks the shared `running` flag on every timeout, so
//! shutdown is observed within half a second.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use xplink_core::protocol::beacon::{
    parse_beacon, BeaconError, BEACON_MULTICAST_GROUP, BEACON_PORT,
};

/// How long a single blocking `recv_from` waits before re-checking the
/// `running` flag.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// No beacon arrived within the caller's wait window. Non-fatal; the
    /// reconnect loop retries on its own schedule.
    #[error("no simulator beacon received within {waited:?}")]
    NotFound { waited: Duration },

    /// A beacon arrived but advertised a protocol the client cannot speak.
    /// Retrying will not help until the simulator is upgraded.
    #[error("simulator beacon protocol {major}.{minor} (host type {host_id}) is not supported")]
    VersionNotSupported { major: u8, minor: u8, host_id: i32 },

    /// The listener thread ended without delivering a beacon (socket error
    /// or shutdown).
    #[error("beacon listener exited before a beacon arrived")]
    ListenerExited,
}

/// A located simulator, ready to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorEndpoint {
    /// Host to reach the web API on. From discovery this is the beacon's
    /// source IP; from configuration it may be any resolvable name.
    pub host: String,
    /// TCP port of the simulator's web API.
    pub port: u16,
    /// Hostname the simulator advertised about itself.
    pub hostname: String,
}

/// One message from the listener thread to the async side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconEvent {
    /// A supported beacon arrived.
    Located(SimulatorEndpoint),
    /// A beacon arrived but its protocol line is unsupported.
    Unsupported { major: u8, minor: u8, host_id: i32 },
}

/// Joins the beacon multicast group on `port` and spawns a background thread
/// that delivers the first decisive [`BeaconEvent`], then exits.
///
/// Malformed packets (wrong magic, truncated) are logged and skipped; an
/// unsupported protocol line is decisive because waiting longer cannot fix
/// it.
///
/// # Errors
///
/// Returns [`DiscoveryError::Bind`] if the socket cannot be set up.
pub fn start_beacon_listener(
    port: u16,
    running: Arc<AtomicBool>,
) -> Result<mpsc::Receiver<BeaconEvent>, DiscoveryError> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let socket = UdpSocket::bind(addr).map_err(|source| DiscoveryError::Bind { addr, source })?;
    // A failed join still leaves a usable socket (directly addressed
    // datagrams arrive either way), so it downgrades to a warning.
    if let Err(e) = socket.join_multicast_v4(&BEACON_MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED) {
        warn!("could not join multicast group {BEACON_MULTICAST_GROUP}: {e}");
    }
    socket.set_read_timeout(Some(POLL_INTERVAL)).ok();

    let (tx, rx) = mpsc::channel(64);

    std::thread::Builder::new()
        .name("xplink-beacon".to_string())
        .spawn(move || {
            beacon_loop(socket, tx, running);
        })
        .expect("failed to spawn beacon listener thread");

    debug!("beacon listener joined {BEACON_MULTICAST_GROUP} on UDP {addr}");
    Ok(rx)
}

/// The receive loop executed on the listener thread. Returns after the first
/// decisive event, a socket error, or a cleared `running` flag.
fn beacon_loop(socket: UdpSocket, tx: mpsc::Sender<BeaconEvent>, running: Arc<AtomicBool>) {
    let mut buf = [0u8; 512];

    while running.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                warn!("beacon socket receive failed: {e}");
                return;
            }
        };

        match parse_beacon(&buf[..len]) {
            Ok(beacon) => {
                if !beacon.version_supported() {
                    warn!(
                        "simulator build {} is outside the tested range; continuing anyway",
                        beacon.version
                    );
                }
                debug!(
                    "beacon from {src}: {} (build {}) on port {}",
                    beacon.hostname, beacon.version, beacon.port
                );
                let endpoint = SimulatorEndpoint {
                    host: src.ip().to_string(),
                    port: beacon.port,
                    hostname: beacon.hostname,
                };
                // A closed channel means the waiter gave up; nothing to do.
                let _ = tx.blocking_send(BeaconEvent::Located(endpoint));
                return;
            }
            Err(BeaconError::UnsupportedVersion {
                major,
                minor,
                host_id,
            }) => {
                let _ = tx.blocking_send(BeaconEvent::Unsupported {
                    major,
                    minor,
                    host_id,
                });
                return;
            }
            Err(err) => {
                debug!("ignoring malformed packet from {src}: {err}");
            }
        }
    }
}

/// Waits up to `wait` for one beacon on `port`.
///
/// # Errors
///
/// [`DiscoveryError::NotFound`] when the window elapses beacon-less,
/// [`DiscoveryError::VersionNotSupported`] when the simulator speaks an
/// unsupported protocol, plus the socket-setup errors of
/// [`start_beacon_listener`].
pub async fn wait_for_beacon(
    port: u16,
    wait: Duration,
    running: Arc<AtomicBool>,
) -> Result<SimulatorEndpoint, DiscoveryError> {
    let mut rx = start_beacon_listener(port, running)?;
    match tokio::time::timeout(wait, rx.recv()).await {
        Ok(Some(BeaconEvent::Located(endpoint))) => Ok(endpoint),
        Ok(Some(BeaconEvent::Unsupported {
            major,
            minor,
            host_id,
        })) => Err(DiscoveryError::VersionNotSupported {
            major,
            minor,
            host_id,
        }),
        Ok(None) => Err(DiscoveryError::ListenerExited),
        Err(_) => Err(DiscoveryError::NotFound { waited: wait }),
    }
}

/// Standard discovery wait used by the connection supervisor.
///
/// # Errors
///
/// Same conditions as [`wait_for_beacon`].
pub async fn discover_simulator(
    wait: Duration,
    running: Arc<AtomicBool>,
) -> Result<SimulatorEndpoint, DiscoveryError> {
    wait_for_beacon(BEACON_PORT, wait, running).await
}

/// Distinguishes the read-timeout errno from real socket failures.
/// (`WouldBlock` on Unix, `TimedOut` on Windows.)
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
