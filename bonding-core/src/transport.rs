//! Transport seam between the bonding engine and the node that owns sockets.
//!
//! The engine never touches sockets itself. This module defines what it needs
//! from the surrounding node:
//! - `Path`: one (local socket, remote address) route with atomic traffic stamps
//! - `PacketKind`: the coarse verb of a packet being recorded
//! - `PeerIdentity` / `PeerInfo`: who a bond belongs to
//! - `PeerTransport`: a way to emit an encoded control message on a given path
//! - `MonotonicClock`: millisecond time source used by the maintenance driver

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Opaque handle of a local socket, as assigned by the node.
pub type LocalSocket = i64;

/// Shared handle to a physical path.
pub type PathRef = Arc<Path>;

/// A single physical route to a peer.
///
/// Paths are created by the transport when a packet first arrives over a
/// new (local socket, remote address) pair. The bond only observes them.
#[derive(Debug)]
pub struct Path {
    local_socket: LocalSocket,
    address: SocketAddr,
    created: i64,
    last_in: AtomicI64,
    last_out: AtomicI64,
}

impl Path {
    /// Create a path that has just received its first packet at `now`.
    pub fn new(local_socket: LocalSocket, address: SocketAddr, now: i64) -> Self {
        Self {
            local_socket,
            address,
            created: now,
            last_in: AtomicI64::new(now),
            last_out: AtomicI64::new(0),
        }
    }

    /// Convenience constructor returning a shared handle.
    pub fn shared(local_socket: LocalSocket, address: SocketAddr, now: i64) -> PathRef {
        Arc::new(Self::new(local_socket, address, now))
    }

    pub fn local_socket(&self) -> LocalSocket {
        self.local_socket
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    /// Stamp an inbound packet.
    pub fn received(&self, now: i64) {
        self.last_in.fetch_max(now, Ordering::Relaxed);
    }

    /// Stamp an outbound packet.
    pub fn sent(&self, now: i64) {
        self.last_out.fetch_max(now, Ordering::Relaxed);
    }

    pub fn last_in(&self) -> i64 {
        self.last_in.load(Ordering::Relaxed)
    }

    pub fn last_out(&self) -> i64 {
        self.last_out.load(Ordering::Relaxed)
    }

    /// Whether anything has been heard on this path within `timeout` ms.
    pub fn is_alive(&self, now: i64, timeout: i64) -> bool {
        now - self.last_in() < timeout
    }

    /// Two paths are the same route if socket and address agree.
    pub fn same_route(&self, other: &Path) -> bool {
        self.local_socket == other.local_socket && self.address == other.address
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.local_socket)
    }
}

/// Coarse classification of a packet for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// User payload (counts toward negotiation traffic totals)
    Frame,
    /// Protocol acknowledgement
    Ack,
    /// QoS measurement carrying latency samples
    QosMeasurement,
    /// Path negotiation request
    PathNegotiationRequest,
    /// Heartbeat
    Echo,
    /// Any other protocol verb
    Other,
}

impl PacketKind {
    /// Control traffic generated by the bond itself is never sampled for QoS.
    pub fn is_qos_sampled(&self) -> bool {
        !matches!(self, PacketKind::Ack | PacketKind::QosMeasurement)
    }
}

/// Numeric identity of a node. Ordering is used to break negotiation ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerIdentity(pub u64);

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl FromStr for PeerIdentity {
    type Err = ParseIntError;

    /// Parse the hexadecimal form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim_start_matches("0x"), 16).map(PeerIdentity)
    }
}

/// What the bond needs to know about the peer it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub identity: PeerIdentity,
    /// Leaf peers are end nodes; their liveness is judged on the failover interval.
    pub is_leaf: bool,
}

impl PeerInfo {
    pub fn leaf(identity: u64) -> Self {
        Self {
            identity: PeerIdentity(identity),
            is_leaf: true,
        }
    }

    pub fn root(identity: u64) -> Self {
        Self {
            identity: PeerIdentity(identity),
            is_leaf: false,
        }
    }
}

/// Outbound seam used for control messages the bond generates on its own
/// (QoS measurements, negotiation requests, heartbeats).
///
/// Implementations must not call back into the bond.
pub trait PeerTransport: Send + Sync {
    /// Emit `payload` to `peer` over exactly `path`.
    fn send_raw(&self, peer: PeerIdentity, path: &Path, payload: &[u8]);
}

/// Transport that drops everything. Useful when only selection is exercised.
#[derive(Debug, Default)]
pub struct NullTransport;

impl PeerTransport for NullTransport {
    fn send_raw(&self, peer: PeerIdentity, path: &Path, payload: &[u8]) {
        tracing::trace!(peer = %peer, path = %path, len = payload.len(), "dropping control message");
    }
}

/// Millisecond clock anchored at construction time.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
    offset: i64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset: 0,
        }
    }

    /// Clock whose first reading is `start` rather than zero.
    pub fn starting_at(start: i64) -> Self {
        Self {
            epoch: Instant::now(),
            offset: start,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.offset + self.epoch.elapsed().as_millis() as i64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
