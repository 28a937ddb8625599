use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

/// Length of the single accepted connection ID class, in bytes.
///
/// Datagrams carrying any other ID length cannot be routed safely and are
/// dropped before any stateful lookup.
pub const CONNECTION_ID_LEN: usize = 8;

/// A protocol version identifier as carried on the wire.
pub type Version = u32;

/// Versions this dispatcher is willing to speak, in preference order.
///
/// The first entry is the preferred version, assumed for first-contact
/// datagrams that omit an explicit version.
pub const DEFAULT_SUPPORTED_VERSIONS: &[Version] = &[39, 38, 37, 36];

/// Peer-chosen identifier naming a logical connection.
///
/// Opaque to the dispatcher beyond equality and hashing; all routing decisions
/// key off this value.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId([u8; CONNECTION_ID_LEN]);

impl ConnectionId {
    /// Construct from raw bytes
    pub const fn new(bytes: [u8; CONNECTION_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of the ID
    pub fn as_bytes(&self) -> &[u8; CONNECTION_ID_LEN] {
        &self.0
    }

    pub(crate) fn to_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(x: u64) -> Self {
        Self(x.to_be_bytes())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A received or buffered UDP datagram together with its addressing
#[derive(Clone, Debug)]
pub struct Datagram {
    /// The raw datagram contents, including the public header
    pub contents: Bytes,
    /// Local address the datagram was received on
    pub server_addr: SocketAddr,
    /// Remote address the datagram was received from
    pub client_addr: SocketAddr,
}

/// Protocol-level error code reported when a connection terminates
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// Graceful termination
    pub const NO_ERROR: Self = Self(0);
    /// Unspecified internal failure
    pub const INTERNAL_ERROR: Self = Self(1);
    /// The handshake was rejected or could not complete
    pub const HANDSHAKE_FAILED: Self = Self(2);
    /// The server cannot accept additional connections right now
    pub const SERVER_BUSY: Self = Self(3);
    /// The peer is shutting down
    pub const PEER_GOING_AWAY: Self = Self(4);
    /// The connection timed out with no activity
    pub const NETWORK_IDLE_TIMEOUT: Self = Self(5);
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NO_ERROR => "NO_ERROR",
            Self::INTERNAL_ERROR => "INTERNAL_ERROR",
            Self::HANDSHAKE_FAILED => "HANDSHAKE_FAILED",
            Self::SERVER_BUSY => "SERVER_BUSY",
            Self::PEER_GOING_AWAY => "PEER_GOING_AWAY",
            Self::NETWORK_IDLE_TIMEOUT => "NETWORK_IDLE_TIMEOUT",
            Self(code) => return write!(f, "ERROR_{code}"),
        };
        f.write_str(name)
    }
}
