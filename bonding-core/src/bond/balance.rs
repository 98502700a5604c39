//! Flow maintenance for the balance policies.

use std::collections::HashMap;

use crate::flow::{FlowId, FlowTable};
use crate::params::{
    FLOW_EXPIRATION, FLOW_REBALANCE_INTERVAL, FLOW_STATS_RESET_INTERVAL, UNDERPERFORMANCE_FRACTION,
};
use crate::quality::ALLOCATION_TOTAL;
use crate::scheduler::{BondingPolicy, FlowRebalanceStrategy};

use super::select::{reassign_flow, release_assignment};
use super::{elapsed, PathState};

impl PathState {
    pub(crate) fn process_balance_tasks(&mut self, flows: &mut FlowTable, now: i64) {
        let policy = self.params.policy;

        if self.params.flow_hashing {
            for flow in flows.expire(now, FLOW_EXPIRATION) {
                tracing::debug!(peer = %self.peer.identity, flow = flow.id(), age = flow.age(now), "flow expired");
                release_assignment(self, flow.assigned());
            }
            if elapsed(self.last_flow_stat_reset, now, FLOW_STATS_RESET_INTERVAL) {
                self.last_flow_stat_reset = Some(now);
                flows.reset_byte_counts();
            }
        }

        if policy == BondingPolicy::BalanceAware {
            self.update_affinity(flows);
        }

        self.reallocate_stranded_flows(flows, now);

        if policy != BondingPolicy::BalanceAware {
            return;
        }
        let Some(threshold) = self.underperformance_threshold() else {
            return;
        };
        if self.params.flow_rebalance != FlowRebalanceStrategy::Passive {
            self.shed_underperforming(flows, threshold, now);
        }
        if self.params.flow_rebalance == FlowRebalanceStrategy::Aggressive
            && elapsed(self.last_flow_rebalance, now, FLOW_REBALANCE_INTERVAL)
        {
            self.last_flow_rebalance = Some(now);
            self.return_flows_to_previous(flows, threshold, now);
        }
    }

    /// Relative byte load of each bonded path against its allocation.
    fn update_affinity(&mut self, flows: &FlowTable) {
        let mut per_slot: HashMap<usize, u64> = HashMap::new();
        let mut total: u64 = 0;
        for flow in flows.iter() {
            if let Some(slot) = flow.assigned() {
                *per_slot.entry(slot).or_default() += flow.bytes_total();
                total += flow.bytes_total();
            }
        }

        let mut underload: u32 = 0;
        for slot in self.slots.iter_mut().flatten() {
            slot.relative_load = 0;
            slot.affinity = 0;
        }
        for &index in &self.bonded.clone() {
            let Some(slot) = self.slot_mut(index) else {
                continue;
            };
            let load = per_slot.get(&index).copied().unwrap_or(0);
            slot.relative_load = if total > 0 {
                ((load as f64 / total as f64) * f64::from(ALLOCATION_TOTAL)).round() as u8
            } else {
                0
            };
            slot.affinity = slot.allocation.saturating_sub(slot.relative_load);
            underload += u32::from(slot.affinity);
        }
        self.total_underload = underload;
    }

    /// Move flows off paths that are no longer bonded and eligible.
    fn reallocate_stranded_flows(&mut self, flows: &mut FlowTable, now: i64) {
        let stranded: Vec<(FlowId, Option<usize>)> = flows
            .iter()
            .filter(|f| {
                f.assigned().map_or(true, |i| {
                    !self.is_bonded_and_eligible(i)
                        || self.slot(i).is_some_and(|s| s.should_reallocate_flows)
                })
            })
            .map(|f| (f.id(), f.assigned()))
            .collect();

        for (id, previous) in stranded {
            if self.params.policy == BondingPolicy::BalanceRr
                || !reassign_flow(self, flows, id, None, now)
            {
                if previous.is_some_and(|i| !self.is_bonded_and_eligible(i)) {
                    release_assignment(self, previous);
                    if let Some(flow) = flows.get_mut(id) {
                        flow.unassign();
                    }
                }
            }
        }
        for slot in self.slots.iter_mut().flatten() {
            slot.should_reallocate_flows = false;
        }
    }

    /// Allocation below which a bonded path counts as under-performing.
    fn underperformance_threshold(&self) -> Option<f32> {
        let allocations: Vec<f32> = self
            .bonded
            .iter()
            .filter_map(|&i| self.slot(i))
            .map(|s| f32::from(s.allocation))
            .collect();
        if allocations.is_empty() {
            return None;
        }
        let mean = allocations.iter().sum::<f32>() / allocations.len() as f32;
        Some(mean * UNDERPERFORMANCE_FRACTION)
    }

    fn shed_underperforming(&mut self, flows: &mut FlowTable, threshold: f32, now: i64) {
        if self.bonded.len() < 2 {
            return;
        }
        let weak: Vec<usize> = self
            .bonded
            .iter()
            .copied()
            .filter(|&i| self.slot(i).is_some_and(|s| f32::from(s.allocation) < threshold))
            .collect();
        for index in weak {
            let ids: Vec<FlowId> = flows
                .iter()
                .filter(|f| f.assigned() == Some(index))
                .map(|f| f.id())
                .collect();
            if !ids.is_empty() {
                tracing::info!(peer = %self.peer.identity, slot = index, flows = ids.len(), "path under-performing, moving its flows");
            }
            for id in ids {
                reassign_flow(self, flows, id, Some(index), now);
            }
        }
    }

    fn return_flows_to_previous(&mut self, flows: &mut FlowTable, threshold: f32, now: i64) {
        let candidates: Vec<(FlowId, Option<usize>, usize)> = flows
            .iter()
            .filter_map(|f| {
                let previous = f.previously_assigned()?;
                (f.assigned() != Some(previous)).then_some((f.id(), f.assigned(), previous))
            })
            .filter(|(_, _, previous)| {
                self.is_bonded_and_eligible(*previous)
                    && self
                        .slot(*previous)
                        .is_some_and(|s| f32::from(s.allocation) >= 2.0 * threshold)
            })
            .collect();

        for (id, current, previous) in candidates {
            release_assignment(self, current);
            if let Some(slot) = self.slot_mut(previous) {
                slot.assigned_flow_count += 1;
            }
            if let Some(flow) = flows.get_mut(id) {
                flow.assign(previous, now);
            }
            tracing::debug!(peer = %self.peer.identity, flow = id, slot = previous, "flow returned to recovered path");
        }
    }
}
