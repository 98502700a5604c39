//! Active-backup: one active path, a scored failover queue, reselection and
//! path negotiation with the peer.

use crate::params::{
    ACTIVE_BACKUP_OPTIMIZE_MIN_THRESHOLD, FAILOVER_HANDICAP_NEGOTIATED,
    FAILOVER_HANDICAP_PREFERRED, FAILOVER_HANDICAP_PRIMARY, FAILOVER_INHERIT_DISCOUNT,
    OPTIMIZE_INTERVAL, PATH_NEGOTIATION_CHECK_INTERVAL, PATH_NEGOTIATION_CUTOFF_LIMIT,
    PATH_NEGOTIATION_CUTOFF_TIME, PATH_NEGOTIATION_TRY_COUNT, REFRACTORY_HANDICAP,
};
use crate::proto::ControlMessage;
use crate::scheduler::ReselectionPolicy;
use crate::transport::{Path, PathRef};

use super::{elapsed, PathState};

impl PathState {
    pub(crate) fn process_active_backup_tasks(&mut self, now: i64) {
        if self.active.is_none() {
            self.select_initial_active(now);
        }
        self.rebuild_failover_queue();

        if let Some(active) = self.active {
            if !self.slot(active).is_some_and(|s| s.eligible) {
                if !self.dequeue_next_active(now, "active path failed") {
                    tracing::debug!(peer = %self.peer.identity, "active path failed, no failover candidate");
                }
                self.rebuild_failover_queue();
            }
        }

        self.apply_reselection(now);
    }

    fn select_initial_active(&mut self, now: i64) {
        let eligible: Vec<usize> = self
            .occupied()
            .filter(|(_, s)| s.eligible && s.allowed())
            .map(|(i, _)| i)
            .collect();
        let manual = self.prefs.links && self.prefs.primary;
        let choice = if manual {
            let primary_preferred = eligible
                .iter()
                .copied()
                .find(|&i| self.slot(i).is_some_and(|s| s.is_primary() && s.preferred()));
            let primary_any = eligible
                .iter()
                .copied()
                .find(|&i| self.slot(i).is_some_and(|s| s.is_primary()));
            primary_preferred.or(primary_any).or(eligible.first().copied())
        } else {
            eligible.first().copied()
        };
        if let Some(index) = choice {
            self.set_active(index, now, "initial selection");
        }
    }

    /// Score every slot and rebuild the ascending failover queue.
    pub(crate) fn rebuild_failover_queue(&mut self) {
        if self.prefs.failover {
            self.score_from_user_failover();
        } else {
            self.score_from_handicaps();
        }

        let active = self.active;
        let mut queue: Vec<(i32, usize)> = self
            .occupied()
            .filter(|(i, s)| Some(*i) != active && s.eligible && s.allowed())
            .map(|(i, s)| (s.failover_score, i))
            .collect();
        queue.sort_unstable();
        self.failover_queue = queue.into_iter().map(|(_, i)| i).collect();
    }

    fn score_from_handicaps(&mut self) {
        let reselection = self.params.reselection;
        let negotiated = self.negotiated;
        for (index, slot) in self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|s| (i, s)))
        {
            let mut handicap = 0;
            if slot.preferred() {
                handicap = FAILOVER_HANDICAP_PREFERRED;
            }
            if slot.refractory_period > 0 {
                handicap = REFRACTORY_HANDICAP;
            }
            if slot.is_primary() && reselection != ReselectionPolicy::Optimize {
                handicap = FAILOVER_HANDICAP_PRIMARY;
            }
            slot.negotiated = negotiated == Some(index);
            if slot.negotiated {
                handicap = FAILOVER_HANDICAP_NEGOTIATED;
            }
            slot.failover_score = i32::from(slot.allocation) + handicap;
        }
    }

    /// Scores derived from explicit "fails over to" instructions. A target
    /// inherits its parent's score minus a small discount.
    fn score_from_user_failover(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            let mut score = 0;
            if slot.preferred() {
                score += FAILOVER_HANDICAP_PREFERRED;
            }
            if slot.is_primary() {
                score += FAILOVER_HANDICAP_PRIMARY;
            }
            if score == 0 {
                score = i32::from(slot.allocation);
            }
            slot.failover_score = score;
            slot.negotiated = false;
        }

        for _ in 0..self.slots.len() {
            let mut changed = false;
            let parents: Vec<(String, i32)> = self
                .slots
                .iter()
                .flatten()
                .filter_map(|s| {
                    s.link
                        .failover_target()
                        .map(|t| (t.to_string(), s.failover_score))
                })
                .collect();
            for (target, parent_score) in parents {
                for child in self
                    .slots
                    .iter_mut()
                    .flatten()
                    .filter(|s| s.link.interface_name() == target)
                {
                    let discount =
                        FAILOVER_INHERIT_DISCOUNT + if child.preferred() { 0 } else { 1 };
                    let inherited = parent_score - discount;
                    if inherited > child.failover_score {
                        child.failover_score = inherited;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn set_active(&mut self, index: usize, now: i64, reason: &str) {
        let previous = self.active.and_then(|i| self.slot(i)).map(|s| s.path.to_string());
        let Some(next) = self.slot(index).map(|s| s.path.to_string()) else {
            return;
        };
        tracing::info!(
            peer = %self.peer.identity,
            from = previous.as_deref().unwrap_or("none"),
            to = %next,
            reason,
            "active path changed"
        );
        for slot in self.slots.iter_mut().flatten() {
            slot.reset_packet_counts();
        }
        self.active = Some(index);
        self.last_active_change = now;
        self.failover_queue.retain(|i| *i != index);
    }

    /// Promote the head of the failover queue.
    pub(crate) fn dequeue_next_active(&mut self, now: i64, reason: &str) -> bool {
        match self.failover_queue.pop() {
            Some(head) => {
                self.set_active(head, now, reason);
                true
            }
            None => false,
        }
    }

    /// Rotate to the best standby on request.
    pub(crate) fn force_rotate(&mut self, now: i64) -> bool {
        self.rebuild_failover_queue();
        let rotated = self.dequeue_next_active(now, "forced rotation");
        self.rebuild_failover_queue();
        rotated
    }

    fn apply_reselection(&mut self, now: i64) {
        let (Some(active), Some(&head)) = (self.active, self.failover_queue.last()) else {
            return;
        };
        let (Some(a), Some(h)) = (self.slot(active), self.slot(head)) else {
            return;
        };
        let switch = match self.params.reselection {
            ReselectionPolicy::Always => h.is_primary() && !a.is_primary(),
            ReselectionPolicy::Better => {
                !a.is_primary() && h.is_primary() && h.failover_score > a.failover_score
            }
            ReselectionPolicy::Failure => false,
            ReselectionPolicy::Optimize => {
                if h.negotiated {
                    self.last_negotiation_check = Some(now);
                    true
                } else if now - self.last_active_change >= OPTIMIZE_INTERVAL {
                    let gain = (h.failover_score - a.failover_score) as f32;
                    gain > 0.0
                        && gain > ACTIVE_BACKUP_OPTIMIZE_MIN_THRESHOLD * f32::from(a.allocation)
                } else {
                    false
                }
            }
        };
        if switch {
            let reason = match self.params.reselection {
                ReselectionPolicy::Optimize => "better path available",
                _ => "primary path returned",
            };
            self.dequeue_next_active(now, reason);
            self.rebuild_failover_queue();
        }
    }

    /// Compare where we send most with where the peer sends most; if they
    /// differ, ask the peer to follow our choice.
    pub(crate) fn path_negotiation_check(&mut self, now: i64) -> Option<(PathRef, ControlMessage)> {
        let mut max_in: Option<(usize, u64)> = None;
        let mut max_out: Option<(usize, u64)> = None;
        for slot_entry in self.slots.iter_mut().enumerate() {
            let (index, Some(slot)) = slot_entry else {
                continue;
            };
            if slot.packets_in > max_in.map_or(0, |(_, c)| c) {
                max_in = Some((index, slot.packets_in));
            }
            if slot.packets_out > max_out.map_or(0, |(_, c)| c) {
                max_out = Some((index, slot.packets_out));
            }
            slot.reset_packet_counts();
        }
        let (Some((in_index, _)), Some((out_index, _))) = (max_in, max_out) else {
            return None;
        };
        if in_index == out_index {
            return None;
        }
        let (out_slot, in_slot) = (self.slot(out_index)?, self.slot(in_index)?);
        let mut utility = out_slot.failover_score - in_slot.failover_score;
        if out_slot.negotiated {
            utility -= FAILOVER_HANDICAP_NEGOTIATED;
        }
        let out_path = out_slot.path.clone();
        self.local_utility = utility.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;

        if now - self.last_negotiation_request > PATH_NEGOTIATION_CUTOFF_TIME {
            self.negotiation_requests_sent = 0;
        }
        if self.negotiation_requests_sent < PATH_NEGOTIATION_TRY_COUNT {
            if self.local_utility >= 0 {
                self.negotiation_requests_sent += 1;
                self.last_negotiation_request = now;
                tracing::info!(
                    peer = %self.peer.identity,
                    path = %out_path,
                    utility = self.local_utility,
                    "paths out of sync, requesting peer to switch"
                );
                out_path.sent(now);
                return Some((
                    out_path,
                    ControlMessage::PathNegotiationRequest {
                        utility: self.local_utility,
                    },
                ));
            }
        } else if now - self.last_negotiation_request > 2 * PATH_NEGOTIATION_CHECK_INTERVAL
            && self.local_utility == 0
        {
            tracing::info!(peer = %self.peer.identity, slot = in_index, "negotiation exhausted, following peer's path");
            self.negotiated = Some(in_index);
        }
        None
    }

    /// Admit at most `PATH_NEGOTIATION_CUTOFF_LIMIT` requests per cutoff window.
    pub(crate) fn rate_gate_path_negotiation(&mut self, now: i64) -> bool {
        if elapsed(self.last_negotiation_received, now, PATH_NEGOTIATION_CUTOFF_TIME) {
            self.last_negotiation_received = Some(now);
            self.negotiation_cutoff_count = 0;
        }
        self.negotiation_cutoff_count += 1;
        self.negotiation_cutoff_count <= PATH_NEGOTIATION_CUTOFF_LIMIT
    }

    pub(crate) fn process_negotiation_request(&mut self, path: &Path, remote_utility: i16) {
        if !self.negotiation_enabled() || self.last_negotiation_check.is_none() {
            return;
        }
        let Some(index) = self.index_of(path) else {
            return;
        };
        let peer = self.peer.identity;
        if remote_utility > self.local_utility {
            tracing::info!(peer = %peer, path = %path, remote_utility, local_utility = self.local_utility, "peer's path has greater utility, switching");
            self.negotiated = Some(index);
        } else if remote_utility < self.local_utility {
            tracing::debug!(peer = %peer, path = %path, remote_utility, local_utility = self.local_utility, "peer's path has lower utility, keeping ours");
        } else if peer > self.local {
            tracing::info!(peer = %peer, path = %path, "equal utility, peer identity is greater, following its choice");
            self.negotiated = Some(index);
        } else {
            tracing::debug!(peer = %peer, path = %path, "equal utility, our identity is greater, no change");
        }
    }
}
