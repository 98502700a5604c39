//! Per-peer bond: the state machine that decides which path carries each packet.
//!
//! A bond owns up to `MAX_PEER_NETWORK_PATHS` nominated path slots. Each
//! maintenance pass:
//! - curates the slots (liveness, eligibility, expiry) and rebuilds the bonded set
//! - estimates path quality and turns it into per-path allocations
//! - emits heartbeats and QoS measurements
//! - runs the policy's own tasks (failover queue, flow rebalancing, negotiation)
//!
//! State is split across two locks: `paths` (slots, bonded set, policy state)
//! and `flows` (the flow table). When both are needed `paths` is taken first.
//! Control messages produced under the lock are sent after it is released.

mod active_backup;
mod balance;
mod curate;
mod quality;
mod select;
mod slot;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

use crate::control::BondStatus;
use crate::flow::{FlowId, FlowTable};
use crate::params::{
    BondParameters, BACKGROUND_TASK_MIN_INTERVAL, FLOW_MAX_COUNT, MAX_PEER_NETWORK_PATHS,
    PATH_NEGOTIATION_CHECK_INTERVAL,
};
use crate::proto::{ControlMessage, ProtocolError, QosRecord};
use crate::registry::LinkDirectory;
use crate::scheduler::{BondingPolicy, ReselectionPolicy, RoundRobinCursor};
use crate::transport::{PacketKind, Path, PathRef, PeerIdentity, PeerInfo, PeerTransport};

use slot::PathSlot;

/// Bond-level errors
#[derive(Debug, thiserror::Error)]
pub enum BondError {
    #[error("Quality weights must sum to 1.0, got {sum}")]
    InvalidWeights { sum: f32 },

    #[error("Expected {expected} quality weights, got {actual}")]
    WrongWeightCount { expected: usize, actual: usize },

    #[error("Unknown bonding policy: {0}")]
    UnknownPolicy(String),
}

/// What the user declared for the links of a policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserPreferences {
    /// At least one link was listed explicitly
    pub links: bool,
    /// At least one listed link is a primary
    pub primary: bool,
    /// At least one listed link names a failover target
    pub failover: bool,
    /// At least one listed link declares a speed
    pub speeds: bool,
}

/// Fault tolerance summary computed during curation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BondHealth {
    pub healthy: bool,
    pub alive_links: usize,
    pub total_links: usize,
}

/// True if `last` is unset or at least `interval` ms ago.
pub(crate) fn elapsed(last: Option<i64>, now: i64, interval: i64) -> bool {
    last.map_or(true, |t| now - t >= interval)
}

/// Everything guarded by the paths lock.
pub(crate) struct PathState {
    pub peer: PeerInfo,
    pub local: PeerIdentity,
    pub params: BondParameters,
    pub prefs: UserPreferences,

    pub slots: Vec<Option<PathSlot>>,
    /// Bonded-index map: bonded position -> slot index
    pub bonded: Vec<usize>,
    /// Slots removed by the last curation whose flows must be released
    pub removed: Vec<usize>,
    pub health: BondHealth,
    pub rng: StdRng,

    pub active: Option<usize>,
    /// Sorted ascending by failover score; the head is the last element
    pub failover_queue: Vec<usize>,
    pub last_active_change: i64,

    pub rr: RoundRobinCursor,
    pub total_underload: u32,

    pub local_utility: i16,
    pub negotiated: Option<usize>,
    pub negotiation_requests_sent: u32,
    pub last_negotiation_request: i64,
    pub last_negotiation_check: Option<i64>,
    pub negotiation_cutoff_count: u32,
    pub last_negotiation_received: Option<i64>,

    pub qos_cutoff_count: u32,
    pub last_qos_rate_check: Option<i64>,

    pub last_background_task: Option<i64>,
    pub last_quality_estimation: Option<i64>,
    pub last_flow_stat_reset: Option<i64>,
    pub last_flow_rebalance: Option<i64>,
    pub last_frame: i64,
}

impl PathState {
    fn new(peer: PeerInfo, local: PeerIdentity, params: BondParameters) -> Self {
        Self {
            peer,
            local,
            params,
            prefs: UserPreferences::default(),
            slots: (0..MAX_PEER_NETWORK_PATHS).map(|_| None).collect(),
            bonded: Vec::with_capacity(MAX_PEER_NETWORK_PATHS),
            removed: Vec::new(),
            health: BondHealth::default(),
            rng: StdRng::from_entropy(),
            active: None,
            failover_queue: Vec::new(),
            last_active_change: 0,
            rr: RoundRobinCursor::new(),
            total_underload: 0,
            local_utility: 0,
            negotiated: None,
            negotiation_requests_sent: 0,
            last_negotiation_request: 0,
            last_negotiation_check: None,
            negotiation_cutoff_count: 0,
            last_negotiation_received: None,
            qos_cutoff_count: 0,
            last_qos_rate_check: None,
            last_background_task: None,
            last_quality_estimation: None,
            last_flow_stat_reset: None,
            last_flow_rebalance: None,
            last_frame: 0,
        }
    }

    pub fn slot(&self, index: usize) -> Option<&PathSlot> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut PathSlot> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    pub fn index_of(&self, path: &Path) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.path.same_route(path)))
    }

    pub fn occupied(&self) -> impl Iterator<Item = (usize, &PathSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    pub fn is_bonded_and_eligible(&self, index: usize) -> bool {
        self.slot(index).is_some_and(|s| s.bonded && s.eligible)
    }

    /// Whether the negotiation protocol runs for this bond.
    pub fn negotiation_enabled(&self) -> bool {
        self.params.policy == BondingPolicy::ActiveBackup
            && self.params.reselection == ReselectionPolicy::Optimize
            && self.params.path_negotiation
    }
}

/// Bond with a single remote peer.
pub struct Bond {
    peer: PeerInfo,
    policy_alias: String,
    links: Arc<LinkDirectory>,
    transport: Arc<dyn PeerTransport>,
    paths: Mutex<PathState>,
    flows: Mutex<FlowTable>,
}

impl Bond {
    /// Create a bond for `peer` running `params` under the policy alias `policy_alias`.
    pub fn new(
        peer: PeerInfo,
        local: PeerIdentity,
        policy_alias: impl Into<String>,
        params: BondParameters,
        links: Arc<LinkDirectory>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            peer,
            policy_alias: policy_alias.into(),
            links,
            transport,
            paths: Mutex::new(PathState::new(peer, local, params)),
            flows: Mutex::new(FlowTable::new(FLOW_MAX_COUNT)),
        }
    }

    pub fn peer(&self) -> PeerInfo {
        self.peer
    }

    pub fn policy(&self) -> BondingPolicy {
        self.paths.lock().params.policy
    }

    pub fn policy_alias(&self) -> &str {
        &self.policy_alias
    }

    pub fn params(&self) -> BondParameters {
        self.paths.lock().params.clone()
    }

    /// Shortest of the bond-wide interval and any per-link override.
    pub fn monitor_interval(&self) -> u32 {
        let state = self.paths.lock();
        state
            .occupied()
            .map(|(_, s)| s.monitor_interval)
            .filter(|&interval| interval > 0)
            .fold(state.params.monitor_interval(), u32::min)
    }

    pub fn set_user_preferences(&self, prefs: UserPreferences) {
        self.paths.lock().prefs = prefs;
    }

    pub fn user_preferences(&self) -> UserPreferences {
        self.paths.lock().prefs
    }

    pub fn set_failover_interval(&self, interval: u32) {
        self.paths.lock().params.set_failover_interval(interval);
    }

    /// Replace the quality weights. Invalid vectors are rejected and the
    /// previous weights stay in effect.
    pub fn set_quality_weights(&self, weights: &[f32]) -> Result<(), BondError> {
        let result = self.paths.lock().params.set_weights(weights);
        if let Err(e) = &result {
            tracing::warn!(peer = %self.peer.identity, "rejected quality weights: {e}");
        }
        result
    }

    /// Make random draws reproducible.
    pub fn reseed(&self, seed: u64) {
        self.paths.lock().rng = StdRng::seed_from_u64(seed);
    }

    /// Offer a newly learned path to the bond.
    ///
    /// Paths on links outside the policy's link list, duplicates, and paths
    /// beyond the slot capacity are ignored.
    pub fn nominate_path(&self, path: &PathRef, now: i64) {
        let Some(link) = self
            .links
            .link_for_socket(&self.policy_alias, path.local_socket())
        else {
            tracing::debug!(peer = %self.peer.identity, path = %path, "no interface for local socket, not nominating");
            return;
        };
        if !self.links.link_allowed(&self.policy_alias, &link) {
            tracing::debug!(
                peer = %self.peer.identity,
                path = %path,
                interface = link.interface_name(),
                "link not part of policy, not nominating"
            );
            return;
        }

        let mut state = self.paths.lock();
        if state.index_of(path).is_some() {
            return;
        }
        let Some(free) = state.slots.iter().position(Option::is_none) else {
            tracing::debug!(peer = %self.peer.identity, path = %path, "no free path slot");
            return;
        };
        tracing::info!(
            peer = %self.peer.identity,
            path = %path,
            interface = link.interface_name(),
            slot = free,
            "nominated path"
        );
        state.slots[free] = Some(PathSlot::new(path.clone(), link, now));
        state.apply_user_prefs();
        state.curate(now, true);
        self.release_removed_flows(&mut state);
        state.estimate_path_quality(now);
    }

    /// Path the next outbound packet should use, if the policy picks one.
    ///
    /// `None` means the caller should fall back to its own default path
    /// (or, for broadcast, send on every path in `bonded_paths`).
    pub fn get_appropriate_path(&self, now: i64, flow_id: Option<FlowId>) -> Option<PathRef> {
        let mut state = self.paths.lock();
        select::appropriate_path(&mut state, &self.flows, now, flow_id)
    }

    /// Every bonded path, in bonded order.
    pub fn bonded_paths(&self) -> Vec<PathRef> {
        let state = self.paths.lock();
        state
            .bonded
            .iter()
            .filter_map(|&i| state.slot(i).map(|s| s.path.clone()))
            .collect()
    }

    /// Every nominated path, bonded or not.
    pub fn paths(&self) -> Vec<PathRef> {
        let state = self.paths.lock();
        state.occupied().map(|(_, s)| s.path.clone()).collect()
    }

    pub fn active_path(&self) -> Option<PathRef> {
        let state = self.paths.lock();
        state
            .active
            .and_then(|i| state.slot(i))
            .map(|s| s.path.clone())
    }

    /// Failover candidates, best first.
    pub fn failover_queue(&self) -> Vec<PathRef> {
        let state = self.paths.lock();
        state
            .failover_queue
            .iter()
            .rev()
            .filter_map(|&i| state.slot(i).map(|s| s.path.clone()))
            .collect()
    }

    pub fn health(&self) -> BondHealth {
        self.paths.lock().health
    }

    pub fn is_healthy(&self) -> bool {
        self.paths.lock().health.healthy
    }

    pub fn flow_count(&self) -> usize {
        self.flows.lock().len()
    }

    /// Slot a flow is pinned to, as the path it names.
    pub fn flow_path(&self, flow_id: FlowId) -> Option<PathRef> {
        let state = self.paths.lock();
        let flows = self.flows.lock();
        flows
            .get(flow_id)
            .and_then(|f| f.assigned())
            .and_then(|i| state.slot(i))
            .map(|s| s.path.clone())
    }

    pub fn record_outgoing_packet(
        &self,
        path: &Path,
        packet_id: u64,
        payload_len: u16,
        kind: PacketKind,
        flow_id: Option<FlowId>,
        now: i64,
    ) {
        let mut state = self.paths.lock();
        let Some(index) = state.index_of(path) else {
            return;
        };
        path.sent(now);
        if kind == PacketKind::Frame {
            state.last_frame = now;
        }
        if let Some(slot) = state.slot_mut(index) {
            slot.record_outgoing(packet_id, kind, now);
        }
        if let (true, Some(id)) = (state.params.flow_hashing, flow_id) {
            if let Some(flow) = self.flows.lock().get_mut(id) {
                flow.record_out(payload_len, now);
            }
        }
    }

    pub fn record_incoming_packet(
        &self,
        path: &Path,
        packet_id: u64,
        payload_len: u16,
        kind: PacketKind,
        flow_id: Option<FlowId>,
        now: i64,
    ) {
        let mut state = self.paths.lock();
        let Some(index) = state.index_of(path) else {
            return;
        };
        path.received(now);
        if let Some(slot) = state.slot_mut(index) {
            slot.record_incoming(packet_id, kind, now);
        }
        if !(state.params.flow_hashing && state.params.policy.is_balance()) {
            return;
        }
        let Some(id) = flow_id else {
            return;
        };
        let mut flows = self.flows.lock();
        if !flows.contains(id) {
            let preferred = state.is_bonded_and_eligible(index).then_some(index);
            select::create_flow(&mut state, &mut flows, id, preferred, now);
        }
        if let Some(flow) = flows.get_mut(id) {
            flow.record_in(payload_len, now);
        }
    }

    /// A packet on `path` failed authentication or decoding.
    pub fn record_incoming_invalid_packet(&self, path: &Path) {
        let mut state = self.paths.lock();
        if let Some(slot) = state.index_of(path).and_then(|i| state.slot_mut(i)) {
            slot.record_invalid();
        }
    }

    /// Apply a QoS measurement the peer sent over `path`.
    pub fn received_qos(&self, path: &Path, now: i64, records: &[QosRecord]) {
        let mut state = self.paths.lock();
        if !state.rate_gate_qos(now) {
            tracing::debug!(peer = %self.peer.identity, path = %path, "qos measurement rate limited");
            return;
        }
        let Some(index) = state.index_of(path) else {
            return;
        };
        if let Some(slot) = state.slot_mut(index) {
            let matched = slot.receive_qos(now, records);
            tracing::trace!(peer = %self.peer.identity, path = %path, matched, "qos measurement applied");
        }
    }

    /// Build the QoS measurement owed to the peer for `path`, if any records are pending.
    pub fn generate_qos_measurement(&self, path: &Path, now: i64) -> Option<ControlMessage> {
        let mut state = self.paths.lock();
        let index = state.index_of(path)?;
        let slot = state.slot_mut(index)?;
        let records = slot.drain_qos_records(now);
        (!records.is_empty()).then_some(ControlMessage::QosMeasurement(records))
    }

    /// The peer asks us to move our active path to `path`.
    pub fn process_incoming_path_negotiation_request(
        &self,
        path: &Path,
        remote_utility: i16,
        now: i64,
    ) {
        let mut state = self.paths.lock();
        if !state.rate_gate_path_negotiation(now) {
            tracing::debug!(peer = %self.peer.identity, path = %path, "path negotiation request rate limited");
            return;
        }
        state.process_negotiation_request(path, remote_utility);
    }

    /// Decode a control payload received on `path` and act on it.
    pub fn receive_control(&self, path: &Path, payload: &[u8], now: i64) -> Result<(), ProtocolError> {
        match ControlMessage::decode(payload)? {
            ControlMessage::Echo => {
                path.received(now);
            }
            ControlMessage::QosMeasurement(records) => self.received_qos(path, now, &records),
            ControlMessage::PathNegotiationRequest { utility } => {
                self.process_incoming_path_negotiation_request(path, utility, now)
            }
        }
        Ok(())
    }

    /// Move an active-backup bond to the head of its failover queue.
    pub fn force_rotate_active(&self, now: i64) -> bool {
        let mut state = self.paths.lock();
        if state.params.policy != BondingPolicy::ActiveBackup {
            return false;
        }
        state.force_rotate(now)
    }

    /// Periodic maintenance; safe to call more often than needed.
    pub fn process_background_tasks(&self, now: i64) {
        let mut outbound: Vec<(PathRef, ControlMessage)> = Vec::new();
        {
            let mut state = self.paths.lock();
            if !elapsed(state.last_background_task, now, BACKGROUND_TASK_MIN_INTERVAL) {
                return;
            }
            state.last_background_task = Some(now);

            self.refresh_links(&mut state);
            state.apply_user_prefs();
            state.curate(now, false);
            self.release_removed_flows(&mut state);

            let estimation_interval = i64::from(state.params.quality_estimation_interval());
            if elapsed(state.last_quality_estimation, now, estimation_interval) {
                state.estimate_path_quality(now);
            }

            state.queue_heartbeats(now, &mut outbound);
            state.queue_qos_measurements(now, &mut outbound);

            match state.params.policy {
                BondingPolicy::ActiveBackup => {
                    state.process_active_backup_tasks(now);
                    if state.negotiation_enabled()
                        && elapsed(state.last_negotiation_check, now, PATH_NEGOTIATION_CHECK_INTERVAL)
                    {
                        state.last_negotiation_check = Some(now);
                        if let Some(request) = state.path_negotiation_check(now) {
                            outbound.push(request);
                        }
                    }
                }
                policy if policy.is_balance() => {
                    let mut flows = self.flows.lock();
                    state.process_balance_tasks(&mut flows, now);
                }
                _ => {}
            }
        }

        for (path, message) in outbound {
            self.transport
                .send_raw(self.peer.identity, &path, &message.encode());
        }
    }

    /// Follow links declared after their paths were nominated.
    fn refresh_links(&self, state: &mut PathState) {
        state.prefs = self.links.preferences(&self.policy_alias);
        for slot in state.slots.iter_mut().flatten() {
            let Some(link) = self
                .links
                .link_by_name(&self.policy_alias, slot.link.interface_name())
            else {
                continue;
            };
            if !Arc::ptr_eq(&link, &slot.link) {
                tracing::debug!(
                    peer = %self.peer.identity,
                    path = %slot.path,
                    interface = link.interface_name(),
                    mode = %link.mode(),
                    "link redefined"
                );
                slot.link = link;
            }
        }
    }

    pub fn status(&self) -> BondStatus {
        let state = self.paths.lock();
        BondStatus {
            peer: self.peer.identity,
            policy: state.params.policy,
            policy_alias: self.policy_alias.clone(),
            healthy: state.health.healthy,
            alive_links: state.health.alive_links,
            total_links: state.health.total_links,
            active: state.active.and_then(|i| state.slot(i)).map(|s| s.path.address()),
            flows: self.flows.lock().len(),
            paths: state
                .occupied()
                .map(|(i, s)| s.status(i, state.active == Some(i)))
                .collect(),
        }
    }

    fn release_removed_flows(&self, state: &mut PathState) {
        if state.removed.is_empty() {
            return;
        }
        let removed = std::mem::take(&mut state.removed);
        let mut flows = self.flows.lock();
        for flow in flows.iter_mut() {
            if flow.assigned().is_some_and(|i| removed.contains(&i)) {
                flow.unassign();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests;
