//! Path curation: liveness, eligibility, expiry and the bonded set.

use std::collections::{HashMap, HashSet};

use crate::params::{EXPIRED_PATH_WINDOW, PATH_EXPIRATION, TRIAL_PERIOD};
use crate::scheduler::BondingPolicy;

use super::{BondHealth, PathState};

impl PathState {
    /// Copy link settings onto every slot and recompute `only_path_on_link`.
    pub(crate) fn apply_user_prefs(&mut self) {
        let mut per_link: HashMap<String, usize> = HashMap::new();
        for (_, slot) in self.occupied() {
            *per_link
                .entry(slot.link.interface_name().to_string())
                .or_default() += 1;
        }
        let params = self.params.clone();
        for slot in self.slots.iter_mut().flatten() {
            slot.apply_link_prefs(&params);
            slot.only_path_on_link = per_link
                .get(slot.link.interface_name())
                .is_some_and(|count| *count == 1);
        }
    }

    /// Drop a slot and everything that refers to it.
    pub(crate) fn remove_slot(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index).and_then(Option::take) {
            tracing::info!(peer = %self.peer.identity, path = %slot.path, slot = index, "path expired, removed from bond");
        }
        if self.active == Some(index) {
            self.active = None;
        }
        if self.negotiated == Some(index) {
            self.negotiated = None;
        }
        self.failover_queue.retain(|i| *i != index);
        self.bonded.retain(|i| *i != index);
        self.removed.push(index);
    }

    /// Re-evaluate every slot and rebuild the bonded set if anything flipped.
    pub(crate) fn curate(&mut self, now: i64, force_rebuild: bool) {
        let failover = i64::from(self.params.failover_interval());
        let punishment = self.params.refractory_period;
        let flow_hashing = self.params.flow_hashing;
        let is_leaf = self.peer.is_leaf;
        let peer = self.peer.identity;

        let expired: Vec<usize> = self
            .occupied()
            .filter(|(_, s)| now - s.path.last_in() > EXPIRED_PATH_WINDOW)
            .map(|(i, _)| i)
            .collect();
        let mut flipped = !expired.is_empty();
        for index in expired {
            self.remove_slot(index);
        }

        for (index, slot) in self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|s| (i, s)))
        {
            let since_in = now - slot.path.last_in();
            let alive = slot
                .path
                .is_alive(now, if is_leaf { failover } else { PATH_EXPIRATION });
            if alive != slot.alive {
                slot.alive = alive;
                slot.last_alive_toggle = now;
                tracing::debug!(peer = %peer, path = %slot.path, alive, "path liveness changed");
            }

            let acceptable_age = if is_leaf {
                since_in < failover + i64::from(slot.down_delay)
            } else {
                alive
            };
            let satisfied_up_delay = now - slot.last_alive_toggle >= i64::from(slot.up_delay);
            let in_trial = now - slot.when_nominated < TRIAL_PERIOD;
            let eligible =
                slot.allowed() && ((acceptable_age && satisfied_up_delay) || in_trial);

            if eligible {
                slot.adjust_refractory_period(now, punishment, false);
            }
            if eligible != slot.eligible {
                if !eligible {
                    slot.adjust_refractory_period(now, punishment, true);
                    if slot.bonded {
                        slot.should_reallocate_flows = flow_hashing;
                    }
                    slot.bonded = false;
                }
                tracing::info!(
                    peer = %peer,
                    path = %slot.path,
                    slot = index,
                    eligible,
                    refractory = slot.refractory_period,
                    "path eligibility changed"
                );
                slot.eligible = eligible;
                flipped = true;
            }
        }

        self.update_health();

        if force_rebuild || flipped || self.bonded.is_empty() {
            self.rebuild_bonded_set();
        }
    }

    fn update_health(&mut self) {
        let mut all_links = HashSet::new();
        let mut alive_links = HashSet::new();
        for (_, slot) in self.occupied() {
            all_links.insert(slot.link.interface_name());
            if slot.alive {
                alive_links.insert(slot.link.interface_name());
            }
        }
        let needed = if self.params.policy == BondingPolicy::ActiveBackup {
            2
        } else {
            1
        };
        let health = BondHealth {
            healthy: alive_links.len() >= needed,
            alive_links: alive_links.len(),
            total_links: all_links.len(),
        };
        if health.healthy != self.health.healthy {
            if health.healthy {
                tracing::info!(
                    peer = %self.peer.identity,
                    alive_links = health.alive_links,
                    total_links = health.total_links,
                    "bond is healthy"
                );
            } else {
                tracing::warn!(
                    peer = %self.peer.identity,
                    alive_links = health.alive_links,
                    total_links = health.total_links,
                    "bond is degraded"
                );
            }
        }
        self.health = health;
    }

    /// Recompute the bonded-index map from slot eligibility.
    pub(crate) fn rebuild_bonded_set(&mut self) {
        let candidates: Vec<usize> = self
            .occupied()
            .filter(|(_, s)| s.eligible && s.allowed())
            .map(|(i, _)| i)
            .collect();

        let selected = if self.params.policy.is_balance() {
            // group by link in lookup order, honouring each link's family preference
            let mut order: Vec<&str> = Vec::new();
            let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
            for &i in &candidates {
                let Some(slot) = self.slot(i) else { continue };
                let name = slot.link.interface_name();
                if !groups.contains_key(name) {
                    order.push(name);
                }
                groups.entry(name).or_default().push(i);
            }
            let mut selected = Vec::with_capacity(candidates.len());
            for name in order {
                let group = &groups[name];
                let dual = self
                    .slot(group[0])
                    .is_some_and(|s| s.addr_family_pref.is_dual());
                if dual {
                    let preferred: Vec<usize> = group
                        .iter()
                        .copied()
                        .filter(|&i| {
                            self.slot(i)
                                .is_some_and(|s| s.addr_family_pref.prefers(&s.path.address()))
                        })
                        .collect();
                    if preferred.is_empty() {
                        selected.extend_from_slice(group);
                    } else {
                        selected.extend(preferred);
                    }
                } else {
                    selected.extend_from_slice(group);
                }
            }
            selected
        } else {
            candidates
        };

        let flow_hashing = self.params.flow_hashing;
        for (index, slot) in self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|s| (i, s)))
        {
            let bonded = selected.contains(&index);
            if slot.bonded && !bonded {
                slot.should_reallocate_flows = flow_hashing;
            }
            slot.bonded = bonded;
        }

        if selected != self.bonded {
            tracing::debug!(peer = %self.peer.identity, bonded = ?selected, "bonded set rebuilt");
        }
        self.bonded = selected;
        self.rr.reset();
    }
}
