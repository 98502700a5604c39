use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

use super::*;
use crate::control::StaticInterfaces;
use crate::link::{Link, LinkMode};
use crate::params::MAX_PEER_NETWORK_PATHS;

/// Transport that keeps every control message it is asked to send.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<(SocketAddr, ControlMessage)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(SocketAddr, ControlMessage)> {
        self.sent.lock().clone()
    }
}

impl PeerTransport for RecordingTransport {
    fn send_raw(&self, _peer: PeerIdentity, path: &Path, payload: &[u8]) {
        let message = ControlMessage::decode(payload).expect("bond emitted undecodable payload");
        self.sent.lock().push((path.address(), message));
    }
}

pub(crate) fn path(socket: i64, addr: &str) -> PathRef {
    Path::shared(socket, addr.parse().unwrap(), 0)
}

/// Bond whose local socket `n` resolves to `interfaces[n - 1]`.
pub(crate) fn test_bond_with_transport(
    policy: BondingPolicy,
    peer: PeerInfo,
    interfaces: &[&str],
    transport: Arc<dyn PeerTransport>,
) -> Bond {
    let resolver = interfaces
        .iter()
        .enumerate()
        .fold(StaticInterfaces::new(), |r, (i, name)| r.with(i as i64 + 1, *name));
    let links = Arc::new(LinkDirectory::new(Arc::new(resolver)));
    Bond::new(
        peer,
        PeerIdentity(1),
        policy.as_str(),
        BondParameters::for_policy(policy),
        links,
        transport,
    )
}

pub(crate) fn test_bond(policy: BondingPolicy, peer: PeerInfo, interfaces: &[&str]) -> Bond {
    test_bond_with_transport(policy, peer, interfaces, Arc::new(crate::transport::NullTransport))
}

/// Bond with one nominated path per interface, on sockets 1..=n.
pub(crate) fn bond_with_paths(
    policy: BondingPolicy,
    interfaces: &[&str],
    now: i64,
) -> (Bond, Vec<PathRef>) {
    let bond = test_bond(policy, PeerInfo::root(2), interfaces);
    let paths: Vec<PathRef> = (0..interfaces.len())
        .map(|i| path(i as i64 + 1, &format!("10.0.{i}.1:9993")))
        .collect();
    for p in &paths {
        bond.nominate_path(p, now);
    }
    (bond, paths)
}

#[test]
fn test_nominate_ignores_duplicates() {
    let (bond, paths) = bond_with_paths(BondingPolicy::BalanceRr, &["eth0"], 0);
    bond.nominate_path(&paths[0], 10);
    bond.nominate_path(&path(1, "10.0.0.1:9993"), 20);
    assert_eq!(bond.status().paths.len(), 1);
}

#[test]
fn test_nominate_beyond_capacity_is_silent() {
    let bond = test_bond(BondingPolicy::BalanceRr, PeerInfo::root(2), &["eth0"]);
    for i in 0..(MAX_PEER_NETWORK_PATHS + 5) {
        let addr = format!("10.1.{}.{}:9993", i / 250, i % 250 + 1);
        bond.nominate_path(&path(1, &addr), 0);
    }
    assert_eq!(bond.status().paths.len(), MAX_PEER_NETWORK_PATHS);
}

#[test]
fn test_nominate_respects_policy_links() {
    let bond = test_bond(BondingPolicy::BalanceXor, PeerInfo::root(2), &["eth0", "wlan0"]);
    bond.links
        .add_link(bond.policy_alias(), Link::new("eth0", LinkMode::Primary));
    bond.nominate_path(&path(2, "10.0.1.1:9993"), 0);
    assert!(bond.status().paths.is_empty());
    bond.nominate_path(&path(1, "10.0.0.1:9993"), 0);
    assert_eq!(bond.status().paths.len(), 1);

    // unknown socket has no interface at all
    bond.nominate_path(&path(9, "10.0.9.1:9993"), 0);
    assert_eq!(bond.status().paths.len(), 1);
}

#[test]
fn test_implicit_links_are_spares() {
    let (bond, _) = bond_with_paths(BondingPolicy::ActiveBackup, &["eth0"], 0);
    let link = bond.links.link_by_name(bond.policy_alias(), "eth0").unwrap();
    assert_eq!(link.mode(), LinkMode::Spare);
    assert!(!link.is_user_specified());
}

#[test]
fn test_active_backup_uses_active_path() {
    let (bond, paths) = bond_with_paths(BondingPolicy::ActiveBackup, &["eth0", "eth1"], 0);
    assert!(bond.get_appropriate_path(0, None).is_none());
    bond.process_background_tasks(40);
    let chosen = bond.get_appropriate_path(40, None).unwrap();
    assert!(chosen.same_route(&paths[0]));
    assert!(bond.active_path().unwrap().same_route(&paths[0]));
}

#[test]
fn test_outgoing_bytes_counted_on_existing_flow() {
    let (bond, paths) = bond_with_paths(BondingPolicy::BalanceXor, &["eth0", "eth1"], 0);
    let p = bond.get_appropriate_path(5, Some(3)).unwrap();
    bond.record_outgoing_packet(&p, 1, 1200, PacketKind::Frame, Some(3), 6);
    bond.record_outgoing_packet(&p, 2, 300, PacketKind::Frame, Some(99), 6);
    let flows = bond.flows.lock();
    assert_eq!(flows.get(3).unwrap().bytes_out(), 1200);
    assert!(flows.get(99).is_none());
    assert_eq!(p.last_out(), 6);
    assert_eq!(paths.len(), 2);
}

#[test]
fn test_incoming_packet_creates_flow_on_arrival_path() {
    let (bond, paths) = bond_with_paths(BondingPolicy::BalanceAware, &["eth0", "eth1"], 0);
    bond.record_incoming_packet(&paths[1], 7, 500, PacketKind::Frame, Some(42), 100);
    assert!(bond.flow_path(42).unwrap().same_route(&paths[1]));
    assert_eq!(paths[1].last_in(), 100);
}

#[test]
fn test_receive_control_dispatch() {
    let (bond, paths) = bond_with_paths(BondingPolicy::BalanceAware, &["eth0"], 0);
    bond.receive_control(&paths[0], &ControlMessage::Echo.encode(), 500)
        .unwrap();
    assert_eq!(paths[0].last_in(), 500);

    bond.record_outgoing_packet(&paths[0], 3, 100, PacketKind::Frame, None, 1000);
    let qos = ControlMessage::QosMeasurement(vec![QosRecord {
        packet_id: 3,
        holding_time: 10,
    }]);
    bond.receive_control(&paths[0], &qos.encode(), 1050).unwrap();
    assert_eq!(bond.paths.lock().slot(0).unwrap().latency.mean(), 20.0);

    assert!(bond.receive_control(&paths[0], &[0xff, 0x00], 1100).is_err());
}

#[test]
fn test_invalid_weights_keep_previous() {
    let (bond, _) = bond_with_paths(BondingPolicy::BalanceAware, &["eth0"], 0);
    let before = *bond.params().weights();
    assert!(bond.set_quality_weights(&[0.5, 0.5, 0.5, 0.0, 0.0]).is_err());
    assert_eq!(*bond.params().weights(), before);
    assert!(bond.set_quality_weights(&[0.2; 5]).is_ok());
}

#[test]
fn test_failover_interval_drives_monitor_interval() {
    let (bond, _) = bond_with_paths(BondingPolicy::ActiveBackup, &["eth0"], 0);
    bond.set_failover_interval(1000);
    assert_eq!(bond.monitor_interval(), 250);
}

#[test]
fn test_background_tasks_are_rate_limited() {
    let (bond, _) = bond_with_paths(BondingPolicy::ActiveBackup, &["eth0", "eth1"], 0);
    bond.process_background_tasks(100);
    assert!(bond.active_path().is_some());
    bond.paths.lock().active = None;
    bond.process_background_tasks(110);
    assert!(bond.active_path().is_none());
    bond.process_background_tasks(130);
    assert!(bond.active_path().is_some());
}

#[test]
fn test_expired_path_releases_flows() {
    let (bond, paths) = bond_with_paths(BondingPolicy::BalanceXor, &["eth0", "eth1"], 0);
    for id in 0..6 {
        bond.get_appropriate_path(0, Some(id));
    }
    let now = crate::params::EXPIRED_PATH_WINDOW + 1;
    paths[0].received(now);
    for id in 0..6 {
        bond.get_appropriate_path(now - 1000, Some(id));
    }
    bond.process_background_tasks(now);
    assert_eq!(bond.status().paths.len(), 1);
    for id in 0..6 {
        assert!(bond.flow_path(id).unwrap().same_route(&paths[0]));
    }
}

#[test]
fn test_links_declared_after_nomination_take_effect() {
    let (bond, paths) = bond_with_paths(BondingPolicy::ActiveBackup, &["eth0", "eth1"], 0);
    assert!(!bond.paths.lock().slot(0).unwrap().link.is_user_specified());

    let alias = bond.policy_alias().to_string();
    bond.links
        .add_link(&alias, Link::new("eth1", LinkMode::Primary).with_monitor_interval(200));
    bond.process_background_tasks(100);

    assert!(bond.user_preferences().primary);
    let state = bond.paths.lock();
    let index = state.index_of(&paths[1]).unwrap();
    let slot = state.slot(index).unwrap();
    assert!(slot.link.is_user_specified());
    assert!(slot.is_primary());
    assert_eq!(slot.monitor_interval, 200);
}

#[test]
fn test_monitor_interval_honors_link_override() {
    let bond = test_bond(BondingPolicy::ActiveBackup, PeerInfo::root(2), &["eth0", "eth1"]);
    let alias = bond.policy_alias().to_string();
    bond.links.add_link(&alias, Link::new("eth0", LinkMode::Primary).with_monitor_interval(100));
    bond.links.add_link(&alias, Link::new("eth1", LinkMode::Spare));
    assert_eq!(bond.monitor_interval(), bond.params().monitor_interval());

    bond.nominate_path(&path(2, "10.0.2.1:9993"), 0);
    assert_eq!(bond.monitor_interval(), bond.params().monitor_interval());
    bond.nominate_path(&path(1, "10.0.1.1:9993"), 0);
    assert_eq!(bond.monitor_interval(), 100);
}
