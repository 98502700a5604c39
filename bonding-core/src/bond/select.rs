//! Hot-path selection: which path carries the next packet, and flow placement.

use parking_lot::Mutex;
use rand::Rng;

use crate::flow::{Flow, FlowId, FlowTable};
use crate::scheduler::{weighted_draw, xor_index, BondingPolicy};
use crate::transport::PathRef;

use super::PathState;

pub(super) fn appropriate_path(
    state: &mut PathState,
    flows: &Mutex<FlowTable>,
    now: i64,
    flow_id: Option<FlowId>,
) -> Option<PathRef> {
    let index = match state.params.policy {
        BondingPolicy::None | BondingPolicy::Broadcast => None,
        BondingPolicy::ActiveBackup => state.active,
        BondingPolicy::BalanceRr => {
            if !state.params.flow_hashing && state.params.packets_per_link == 0 {
                random_bonded(state)
            } else {
                let ppl = state.params.packets_per_link;
                let position = {
                    let PathState {
                        rr, bonded, slots, ..
                    } = &mut *state;
                    rr.next(ppl, bonded.len(), |pos| {
                        slots
                            .get(bonded[pos])
                            .and_then(Option::as_ref)
                            .is_some_and(|s| s.eligible)
                    })
                };
                position.map(|pos| state.bonded[pos])
            }
        }
        BondingPolicy::BalanceXor | BondingPolicy::BalanceAware => match flow_id {
            Some(id) if state.params.flow_hashing => {
                let mut flows = flows.lock();
                flow_slot(state, &mut flows, id, now)
            }
            _ => random_bonded(state),
        },
    };
    index.and_then(|i| state.slot(i)).map(|s| s.path.clone())
}

fn random_bonded(state: &mut PathState) -> Option<usize> {
    if state.bonded.is_empty() {
        return None;
    }
    let pos = state.rng.gen_range(0..state.bonded.len());
    Some(state.bonded[pos])
}

/// Slot for an existing flow, reassigning it if its slot left the bond, or a
/// slot for a brand new flow.
fn flow_slot(state: &mut PathState, flows: &mut FlowTable, id: FlowId, now: i64) -> Option<usize> {
    let current = flows.get(id).map(Flow::assigned);
    match current {
        Some(Some(slot)) if state.is_bonded_and_eligible(slot) => {
            if let Some(flow) = flows.get_mut(id) {
                flow.touch(now);
            }
            Some(slot)
        }
        Some(_) => {
            reassign_flow(state, flows, id, None, now);
            flows.get(id).and_then(Flow::assigned)
        }
        None => create_flow(state, flows, id, None, now),
    }
}

/// Pick a bonded slot for a flow under the current policy.
pub(super) fn choose_slot_for_flow(
    state: &mut PathState,
    id: FlowId,
    exclude: Option<usize>,
) -> Option<usize> {
    if state.bonded.is_empty() {
        return None;
    }
    match state.params.policy {
        BondingPolicy::BalanceXor => {
            xor_index(id, state.bonded.len()).map(|pos| state.bonded[pos])
        }
        BondingPolicy::BalanceAware => {
            let candidates: Vec<(usize, u8, u8)> = state
                .bonded
                .iter()
                .copied()
                .filter(|&i| Some(i) != exclude)
                .filter_map(|i| state.slot(i).filter(|s| s.eligible).map(|s| (i, s)))
                .map(|(i, s)| (i, s.affinity, s.allocation))
                .collect();
            let by_affinity: Vec<(usize, u32)> =
                candidates.iter().map(|&(i, a, _)| (i, u32::from(a))).collect();
            let by_allocation: Vec<(usize, u32)> =
                candidates.iter().map(|&(i, _, a)| (i, u32::from(a))).collect();
            let entropy = u32::from(state.rng.gen::<u8>());
            let drawn = if state.total_underload > 0 {
                // affinity left for the remaining paths may be zero after exclusion
                weighted_draw(entropy, &by_affinity)
                    .or_else(|| weighted_draw(entropy, &by_allocation))
            } else {
                weighted_draw(entropy, &by_allocation)
            };
            drawn.or_else(|| {
                let choices: Vec<usize> = if candidates.is_empty() {
                    state.bonded.clone()
                } else {
                    candidates.iter().map(|(i, _, _)| *i).collect()
                };
                let pos = state.rng.gen_range(0..choices.len());
                Some(choices[pos])
            })
        }
        _ => random_bonded(state),
    }
}

/// Create a flow, pinning it to `preferred` if given, otherwise by policy.
pub(super) fn create_flow(
    state: &mut PathState,
    flows: &mut FlowTable,
    id: FlowId,
    preferred: Option<usize>,
    now: i64,
) -> Option<usize> {
    if state.bonded.is_empty() {
        return None;
    }
    let slot = preferred.or_else(|| choose_slot_for_flow(state, id, None))?;
    let mut flow = Flow::new(id, now);
    flow.assign(slot, now);
    if let Some(s) = state.slot_mut(slot) {
        s.assigned_flow_count += 1;
    }
    if let Some(evicted) = flows.insert(flow) {
        tracing::debug!(peer = %state.peer.identity, flow = evicted.id(), "flow table full, evicted oldest flow");
        release_assignment(state, evicted.assigned());
    }
    tracing::debug!(peer = %state.peer.identity, flow = id, slot, "new flow");
    Some(slot)
}

/// Move a flow to a freshly chosen slot, never `exclude`.
pub(super) fn reassign_flow(
    state: &mut PathState,
    flows: &mut FlowTable,
    id: FlowId,
    exclude: Option<usize>,
    now: i64,
) -> bool {
    let Some(previous) = flows.get(id).map(Flow::assigned) else {
        return false;
    };
    let Some(target) = choose_slot_for_flow(state, id, exclude) else {
        return false;
    };
    if Some(target) == previous {
        return false;
    }
    release_assignment(state, previous);
    if let Some(s) = state.slot_mut(target) {
        s.assigned_flow_count += 1;
    }
    if let Some(flow) = flows.get_mut(id) {
        flow.assign(target, now);
    }
    tracing::info!(peer = %state.peer.identity, flow = id, from = ?previous, to = target, "flow reassigned");
    true
}

pub(super) fn release_assignment(state: &mut PathState, slot: Option<usize>) {
    if let Some(s) = slot.and_then(|i| state.slot_mut(i)) {
        s.assigned_flow_count = s.assigned_flow_count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use crate::bond::tests::bond_with_paths;
    use crate::params::FLOW_MAX_COUNT;
    use crate::scheduler::{xor_index, BondingPolicy};

    #[test]
    fn test_policy_none_and_broadcast_return_no_path() {
        for policy in [BondingPolicy::None, BondingPolicy::Broadcast] {
            let (bond, _) = bond_with_paths(policy, &["eth0", "eth1"], 0);
            assert!(bond.get_appropriate_path(0, Some(1)).is_none());
        }
        let (bond, _) = bond_with_paths(BondingPolicy::Broadcast, &["eth0", "eth1"], 0);
        assert_eq!(bond.bonded_paths().len(), 2);
    }

    #[test]
    fn test_round_robin_stripes_packets() {
        let (bond, paths) = bond_with_paths(BondingPolicy::BalanceRr, &["eth0", "eth1"], 0);
        {
            let mut state = bond.paths.lock();
            state.params.packets_per_link = 2;
        }
        let picks: Vec<usize> = (0..6)
            .map(|_| {
                let p = bond.get_appropriate_path(0, None).unwrap();
                paths.iter().position(|x| x.same_route(&p)).unwrap()
            })
            .collect();
        assert_eq!(picks, vec![0, 0, 1, 1, 0, 0]);
    }

    #[test]
    fn test_round_robin_random_when_quota_zero() {
        let (bond, _) = bond_with_paths(BondingPolicy::BalanceRr, &["eth0", "eth1", "eth2"], 0);
        bond.reseed(7);
        bond.paths.lock().params.packets_per_link = 0;
        for _ in 0..20 {
            assert!(bond.get_appropriate_path(0, None).is_some());
        }
    }

    #[test]
    fn test_xor_assignment_is_stable() {
        let (bond, paths) =
            bond_with_paths(BondingPolicy::BalanceXor, &["eth0", "eth1", "eth2"], 0);
        for id in [-7, 0, 5, 11, 1024] {
            let first = bond.get_appropriate_path(0, Some(id)).unwrap();
            let expected = xor_index(id, 3).unwrap();
            assert!(first.same_route(&paths[expected]));
            let again = bond.get_appropriate_path(10, Some(id)).unwrap();
            assert!(again.same_route(&first));
        }
        assert_eq!(bond.flow_count(), 5);
    }

    #[test]
    fn test_flow_slot_counts_follow_assignment() {
        let (bond, _) = bond_with_paths(BondingPolicy::BalanceXor, &["eth0", "eth1"], 0);
        for id in 0..(FLOW_MAX_COUNT as i32 + 10) {
            bond.get_appropriate_path(id as i64, Some(id));
        }
        assert_eq!(bond.flow_count(), FLOW_MAX_COUNT);
        let total: u32 = bond.status().paths.iter().map(|p| p.assigned_flows).sum();
        assert_eq!(total as usize, FLOW_MAX_COUNT);
    }

    #[test]
    fn test_weighted_draw_follows_allocation() {
        let (bond, paths) = bond_with_paths(BondingPolicy::BalanceAware, &["eth0", "eth1"], 0);
        bond.reseed(42);
        let mut counts = [0usize; 2];
        {
            let mut state = bond.paths.lock();
            state.slot_mut(0).unwrap().allocation = 200;
            state.slot_mut(1).unwrap().allocation = 55;
            state.total_underload = 0;
            for id in 0..1000 {
                let slot = super::choose_slot_for_flow(&mut state, id, None).unwrap();
                counts[slot] += 1;
            }
        }
        let share = counts[0] as f64 / 1000.0;
        assert!((0.72..0.88).contains(&share), "share {share} counts {counts:?}");
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn test_zero_affinity_after_exclusion_uses_allocation() {
        let (bond, _) =
            bond_with_paths(BondingPolicy::BalanceAware, &["eth0", "eth1", "eth2"], 0);
        bond.reseed(11);
        let mut state = bond.paths.lock();
        state.total_underload = 100;
        for (i, (affinity, allocation)) in [(255, 100), (0, 155), (0, 0)].into_iter().enumerate() {
            let slot = state.slot_mut(i).unwrap();
            slot.affinity = affinity;
            slot.allocation = allocation;
        }
        for id in 0..64 {
            let slot = super::choose_slot_for_flow(&mut state, id, Some(0)).unwrap();
            assert_eq!(slot, 1, "flow {id}");
        }
    }

    #[test]
    fn test_zero_allocation_falls_back_to_uniform() {
        let (bond, _) = bond_with_paths(BondingPolicy::BalanceAware, &["eth0", "eth1"], 0);
        bond.reseed(3);
        let mut state = bond.paths.lock();
        for i in 0..2 {
            state.slot_mut(i).unwrap().allocation = 0;
        }
        let mut seen = [false; 2];
        for id in 0..64 {
            let slot = super::choose_slot_for_flow(&mut state, id, None).unwrap();
            seen[slot] = true;
        }
        assert_eq!(seen, [true, true]);
    }
}
