//! Decoder for the simulator's multicast discovery beacon.
//!
//! The simulator announces itself on a well-known multicast group. Each
//! packet has a fixed binary header followed by the machine's hostname:
//!
//! ```text
//! [magic:5][major:1][minor:1][host_id:4][version:4][role:4][port:2][hostname:NUL-terminated]
//! ```
//!
//! Magic is the ASCII tag `BECN\0`. All multi-byte integers are
//! little-endian. `version` is the simulator build number (e.g. `121103`
//! for 12.1.1r3); `port` is the TCP port the web API listens on.

use thiserror::Error;

// ── Discovery constants ───────────────────────────────────────────────────────

/// Multicast group the simulator announces itself on.
pub const BEACON_MULTICAST_GROUP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(239, 255, 1, 1);

/// UDP port of the multicast group.
pub const BEACON_PORT: u16 = 49707;

/// How long discovery waits for a packet before reporting the simulator
/// as not running.
pub const BEACON_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Leading magic tag of every beacon packet.
pub const BEACON_MAGIC: &[u8; 5] = b"BECN\0";

/// Lowest simulator build number the streaming API is known to work with.
pub const SIM_MIN_VERSION: i32 = 121100;

/// Highest simulator build number this client has been tested against.
pub const SIM_MAX_VERSION: i32 = 121399;

/// Fixed header length plus the hostname's NUL terminator.
const MIN_BEACON_LEN: usize = 22;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can occur while decoding a beacon packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BeaconError {
    /// The datagram is shorter than the fixed header.
    #[error("beacon too short: need at least {needed} bytes, got {available}")]
    TooShort { needed: usize, available: usize },

    /// The packet does not start with the `BECN\0` tag.
    #[error("bad beacon magic: {0:02X?}")]
    BadMagic([u8; 5]),

    /// The header version fields identify a beacon layout this decoder
    /// does not understand. Not retried automatically.
    #[error("unsupported beacon: major {major}, minor {minor}, host id {host_id}")]
    UnsupportedVersion { major: u8, minor: u8, host_id: i32 },

    /// The hostname bytes are not valid UTF-8.
    #[error("beacon hostname is not valid UTF-8")]
    MalformedHostname,
}

// ── Beacon ────────────────────────────────────────────────────────────────────

/// A decoded discovery beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    /// Beacon layout major version. Only `1` is accepted.
    pub major: u8,
    /// Beacon layout minor version. `1` and `2` are accepted.
    pub minor: u8,
    /// Identifies the announcing application; the simulator itself is `1`.
    pub host_id: i32,
    /// Simulator build number, e.g. `121103`.
    pub version: i32,
    /// Role of the announcing instance (master/extern visual/IOS).
    pub role: u32,
    /// TCP port the web API listens on.
    pub port: u16,
    /// Hostname of the machine running the simulator.
    pub hostname: String,
}

impl Beacon {
    /// Whether the announced build number falls in the band this client
    /// supports. Out-of-band builds still connect; callers log a warning
    /// and continue.
    pub fn version_supported(&self) -> bool {
        (SIM_MIN_VERSION..=SIM_MAX_VERSION).contains(&self.version)
    }
}

/// Decodes one multicast datagram into a [`Beacon`].
///
/// # Errors
///
/// Returns [`BeaconError`] if the datagram is truncated, carries the wrong
/// magic, announces an unsupported header version, or holds a non-UTF-8
/// hostname.
///
/// # Examples
///
/// ```rust
/// use xplink_core::protocol::beacon::parse_beacon;
///
/// let mut packet = b"BECN\0".to_vec();
/// packet.extend_from_slice(&[1, 2]); // major, minor
/// packet.extend_from_slice(&1i32.to_le_bytes()); // host id
/// packet.extend_from_slice(&121103i32.to_le_bytes()); // build number
/// packet.extend_from_slice(&1u32.to_le_bytes()); // role
/// packet.extend_from_slice(&8086u16.to_le_bytes()); // port
/// packet.extend_from_slice(b"simpc\0");
///
/// let beacon = parse_beacon(&packet).unwrap();
/// assert_eq!(beacon.hostname, "simpc");
/// assert_eq!(beacon.port, 8086);
/// assert!(beacon.version_supported());
/// ```
pub fn parse_beacon(buf: &[u8]) -> Result<Beacon, BeaconError> {
    require_len(buf, MIN_BEACON_LEN)?;

    let mut magic = [0u8; 5];
    magic.copy_from_slice(&buf[..5]);
    if &magic != BEACON_MAGIC {
        return Err(BeaconError::BadMagic(magic));
    }

    let major = buf[5];
    let minor = buf[6];
    let host_id = read_i32(buf, 7);
    let version = read_i32(buf, 11);
    let role = read_u32(buf, 15);
    let port = read_u16(buf, 19);

    if major != 1 || minor > 2 || host_id != 1 {
        return Err(BeaconError::UnsupportedVersion {
            major,
            minor,
            host_id,
        });
    }

    // Hostname runs to the first NUL; a packet without one is tolerated
    // and the whole tail is taken.
    let tail = &buf[21..];
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    let hostname = std::str::from_utf8(&tail[..end])
        .map_err(|_| BeaconError::MalformedHostname)?
        .to_string();

    Ok(Beacon {
        major,
        minor,
        host_id,
        version,
        role,
        port,
        hostname,
    })
}

// ── Byte-reading helpers ──────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize) -> Result<(), BeaconError> {
    if buf.len() < needed {
        return Err(BeaconError::TooShort {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

// ── Tests ─────────────────────────────────────────────────────────────────────
