//! Core library for the Bonding overlay network.
//!
//! This library is the multipath bonding engine of an overlay node: for each
//! remote peer it aggregates several physical paths into one logical,
//! fault-tolerant, load-balanced connection.
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! - `transport`: The seam to the node that owns sockets (paths, peers, control-message sending)
//! - `proto`: Control payloads exchanged between bonded peers (echo, QoS, path negotiation)
//! - `link`: Local interfaces and their user preferences
//! - `flow`: Flow records and the bounded flow table
//! - `quality`: Sample windows, quality weights and allocation math
//! - `scheduler`: Policy vocabulary and pure selection primitives
//! - `params`: Bond tunables and named constants
//! - `bond`: The per-peer bonding state machine
//! - `registry`: Peer-to-bond and policy-to-link bookkeeping
//! - `control`: Configuration, interface resolution and status snapshots
//! - `maintenance`: Async periodic driver for the registry
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bonding_core::{BondRegistry, BondingPolicy, NullTransport, Path, PeerIdentity, PeerInfo, StaticInterfaces};
//!
//! let interfaces = StaticInterfaces::new().with(1, "eth0").with(2, "wlan0");
//! let registry = BondRegistry::new(PeerIdentity(1), Arc::new(interfaces), Arc::new(NullTransport));
//! registry.set_default_policy(BondingPolicy::BalanceXor);
//!
//! let bond = registry.get_or_create_bond(PeerInfo::root(2)).unwrap();
//! bond.nominate_path(&Path::shared(1, "192.0.2.1:9993".parse().unwrap(), 0), 0);
//! let path = bond.get_appropriate_path(10, Some(42));
//! ```

pub mod bond;
pub mod control;
pub mod flow;
pub mod link;
pub mod maintenance;
pub mod params;
pub mod proto;
pub mod quality;
pub mod registry;
pub mod scheduler;
pub mod transport;

pub use bond::{Bond, BondError, BondHealth, UserPreferences};
pub use control::{
    BondStatus, BondingConfig, ConfigError, InterfaceResolver, PathStatus, StaticInterfaces,
};
pub use link::{AddressFamilyPreference, Link, LinkMode};
pub use params::BondParameters;
pub use proto::{ControlMessage, ProtocolError, QosRecord};
pub use registry::{BondRegistry, LinkDirectory, PolicyTemplate};
pub use scheduler::{BondingPolicy, FlowRebalanceStrategy, ReselectionPolicy};
pub use transport::{
    MonotonicClock, NullTransport, PacketKind, Path, PathRef, PeerIdentity, PeerInfo,
    PeerTransport,
};
