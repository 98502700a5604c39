//! Quality estimation, QoS bookkeeping and heartbeats.

use std::collections::HashMap;
use std::sync::Arc;

use crate::link::Link;
use crate::params::{
    LOSS_SMOOTHING, MAX_PEER_NETWORK_PATHS, QOS_CUTOFF_LIMIT, QOS_RECORD_EXPIRY_INTERVALS,
};
use crate::proto::ControlMessage;
use crate::quality::{allocations, ewma, score_maxima, weighted_quality, ALLOCATION_TOTAL};
use crate::transport::PathRef;

use super::{elapsed, PathState};

impl PathState {
    /// Refresh every slot's smoothed metrics and recompute allocations.
    pub(crate) fn estimate_path_quality(&mut self, now: i64) {
        self.last_quality_estimation = Some(now);
        let use_speed = self.prefs.speeds;
        if use_speed {
            self.update_relative_speeds();
        }

        let expiry = QOS_RECORD_EXPIRY_INTERVALS * i64::from(self.params.qos_send_interval());
        for slot in self.slots.iter_mut().flatten() {
            let outstanding = slot.qos_out.len();
            slot.qos_out.retain(|_, sent| now - *sent <= expiry);
            slot.qos_lost += (outstanding - slot.qos_out.len()) as u32;

            let answered = slot.qos_acked + slot.qos_lost;
            if answered > 0 {
                let ratio = slot.qos_lost as f32 / answered as f32;
                slot.packet_loss_ratio = ewma(slot.packet_loss_ratio, ratio, LOSS_SMOOTHING);
                slot.qos_acked = 0;
                slot.qos_lost = 0;
            }
            slot.latency_mean = slot.latency.mean();
            slot.latency_variance = slot.latency.stddev();
            slot.packet_error_ratio = if slot.validity.is_empty() {
                0.0
            } else {
                1.0 - slot.validity.mean()
            };
        }

        let rated: Vec<usize> = self
            .bonded
            .iter()
            .copied()
            .filter(|&i| self.slot(i).is_some_and(|s| s.allowed()))
            .collect();
        let scores: Vec<_> = rated
            .iter()
            .filter_map(|&i| self.slot(i))
            .map(|s| s.measurement(use_speed).scores(&self.params.limits))
            .collect();
        let maxima = score_maxima(&scores);
        let weights = *self.params.weights();
        let qualities: Vec<f32> = scores
            .iter()
            .map(|s| weighted_quality(s, &maxima, &weights))
            .collect();
        let shares = allocations(&qualities);

        for slot in self.slots.iter_mut().flatten() {
            slot.allocation = 0;
        }
        for (&index, share) in rated.iter().zip(shares) {
            if let Some(slot) = self.slot_mut(index) {
                slot.allocation = share;
            }
        }
        tracing::trace!(peer = %self.peer.identity, allocations = ?self.allocation_table(), "path quality estimated");
    }

    fn update_relative_speeds(&self) {
        let mut links: HashMap<&str, &Arc<Link>> = HashMap::new();
        for slot in self.bonded.iter().filter_map(|&i| self.slot(i)) {
            links.entry(slot.link.interface_name()).or_insert(&slot.link);
        }
        let total: u64 = links.values().map(|l| u64::from(l.nominal_speed())).sum();
        if total == 0 {
            return;
        }
        for link in links.values() {
            let share = u64::from(link.nominal_speed()) as f64 / total as f64;
            link.set_relative_speed((share * f64::from(ALLOCATION_TOTAL)).round() as u8);
        }
    }

    fn allocation_table(&self) -> Vec<(usize, u8)> {
        self.occupied().map(|(i, s)| (i, s.allocation)).collect()
    }

    /// Echo every allowed path that has been quiet for its monitor interval.
    /// Only leaf peers are monitored this way.
    pub(crate) fn queue_heartbeats(&mut self, now: i64, out: &mut Vec<(PathRef, ControlMessage)>) {
        if !self.peer.is_leaf {
            return;
        }
        let failover = i64::from(self.params.failover_interval());
        for slot in self.slots.iter().flatten() {
            if slot.monitor_interval == 0 || !slot.allowed() {
                continue;
            }
            let interval = if slot.alive {
                i64::from(slot.monitor_interval)
            } else {
                failover
            };
            if now - slot.path.last_out() >= interval {
                slot.path.sent(now);
                out.push((slot.path.clone(), ControlMessage::Echo));
            }
        }
    }

    /// Queue a QoS measurement on every path that owes one.
    pub(crate) fn queue_qos_measurements(
        &mut self,
        now: i64,
        out: &mut Vec<(PathRef, ControlMessage)>,
    ) {
        let interval = self.params.qos_send_interval();
        for slot in self.slots.iter_mut().flatten() {
            if !slot.allowed() || !slot.needs_qos_report(now, interval) {
                continue;
            }
            let records = slot.drain_qos_records(now);
            if records.is_empty() {
                continue;
            }
            slot.path.sent(now);
            out.push((slot.path.clone(), ControlMessage::QosMeasurement(records)));
        }
    }

    /// Admit at most `QOS_CUTOFF_LIMIT` inbound measurements per rate window.
    pub(crate) fn rate_gate_qos(&mut self, now: i64) -> bool {
        let window = i64::from(self.params.qos_send_interval()) / MAX_PEER_NETWORK_PATHS as i64;
        if elapsed(self.last_qos_rate_check, now, window) {
            self.last_qos_rate_check = Some(now);
            self.qos_cutoff_count = 0;
        }
        self.qos_cutoff_count += 1;
        self.qos_cutoff_count <= QOS_CUTOFF_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use crate::bond::tests::{bond_with_paths, path, test_bond_with_transport, RecordingTransport};
    use crate::proto::{ControlMessage, QosRecord};
    use crate::quality::ALLOCATION_TOTAL;
    use crate::scheduler::BondingPolicy;
    use crate::transport::{PacketKind, PeerInfo};

    #[test]
    fn test_allocations_sum_after_estimation() {
        for n in 1..=4 {
            let names: Vec<String> = (0..n).map(|i| format!("eth{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let (bond, _) = bond_with_paths(BondingPolicy::BalanceAware, &refs, 0);
            let total: u32 = bond.status().paths.iter().map(|p| u32::from(p.allocation)).sum();
            assert_eq!(total, ALLOCATION_TOTAL, "{n} paths");
        }
    }

    #[test]
    fn test_latency_shifts_allocation() {
        let (bond, paths) = bond_with_paths(BondingPolicy::BalanceAware, &["eth0", "eth1"], 0);
        for id in (1..40u64).step_by(2) {
            bond.record_outgoing_packet(&paths[0], id, 100, PacketKind::Frame, None, 1000);
            bond.record_outgoing_packet(&paths[1], id, 100, PacketKind::Frame, None, 1000);
        }
        let fast: Vec<QosRecord> = (1..40u64)
            .step_by(2)
            .map(|packet_id| QosRecord { packet_id, holding_time: 0 })
            .collect();
        bond.received_qos(&paths[0], 1010, &fast);
        bond.received_qos(&paths[1], 1160, &fast);
        bond.paths.lock().estimate_path_quality(1200);

        let status = bond.status();
        assert!(status.paths[0].latency_mean < status.paths[1].latency_mean);
        assert!(status.paths[0].allocation > status.paths[1].allocation);
    }

    #[test]
    fn test_unanswered_records_count_as_loss() {
        let (bond, paths) = bond_with_paths(BondingPolicy::BalanceAware, &["eth0"], 0);
        for id in (1..20u64).step_by(2) {
            bond.record_outgoing_packet(&paths[0], id, 100, PacketKind::Frame, None, 0);
        }
        let expiry = 3 * i64::from(bond.params().qos_send_interval());
        bond.paths.lock().estimate_path_quality(expiry + 1);
        let status = bond.status();
        assert!(status.paths[0].packet_loss_ratio > 0.2);
    }

    #[test]
    fn test_invalid_packets_raise_error_ratio() {
        let (bond, paths) = bond_with_paths(BondingPolicy::BalanceAware, &["eth0"], 0);
        for id in 0..6u64 {
            bond.record_incoming_packet(&paths[0], id, 10, PacketKind::Frame, None, 10);
        }
        for _ in 0..2 {
            bond.record_incoming_invalid_packet(&paths[0]);
        }
        bond.paths.lock().estimate_path_quality(20);
        assert!((bond.status().paths[0].packet_error_ratio - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_qos_measurement_generated_and_sent() {
        let transport = RecordingTransport::new();
        let bond = test_bond_with_transport(
            BondingPolicy::ActiveBackup,
            PeerInfo::root(2),
            &["eth0"],
            transport.clone(),
        );
        let p = path(1, "10.0.0.1:9993");
        bond.nominate_path(&p, 0);
        for id in (1..10u64).step_by(2) {
            bond.record_incoming_packet(&p, id, 10, PacketKind::Frame, None, 100);
        }
        let interval = i64::from(bond.params().qos_send_interval());
        bond.process_background_tasks(100 + interval);
        let sent = transport.messages();
        let qos: Vec<_> = sent
            .iter()
            .filter_map(|(_, m)| match m {
                ControlMessage::QosMeasurement(r) => Some(r.len()),
                _ => None,
            })
            .collect();
        assert_eq!(qos, vec![5]);
        assert!(bond.generate_qos_measurement(&p, 200 + interval).is_none());
    }

    #[test]
    fn test_qos_rate_gate() {
        let (bond, _) = bond_with_paths(BondingPolicy::BalanceXor, &["eth0"], 0);
        let mut state = bond.paths.lock();
        let admitted = (0..200).filter(|_| state.rate_gate_qos(5000)).count();
        assert_eq!(admitted, 128);
        assert!(state.rate_gate_qos(5000 + 1000));
    }

    #[test]
    fn test_leaf_heartbeats() {
        let transport = RecordingTransport::new();
        let bond = test_bond_with_transport(
            BondingPolicy::ActiveBackup,
            PeerInfo::leaf(2),
            &["eth0", "eth1"],
            transport.clone(),
        );
        let a = path(1, "10.0.0.1:9993");
        let b = path(2, "10.0.1.1:9993");
        bond.nominate_path(&a, 0);
        bond.nominate_path(&b, 0);
        let monitor = i64::from(bond.monitor_interval());
        bond.process_background_tasks(monitor);
        let echoes = transport
            .messages()
            .iter()
            .filter(|(_, m)| *m == ControlMessage::Echo)
            .count();
        assert_eq!(echoes, 2);
        assert_eq!(a.last_out(), monitor);
    }
}
