//! Per-path state a bond keeps for each nominated path.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::control::PathStatus;
use crate::link::{AddressFamilyPreference, Link, LinkMode};
use crate::params::{
    BondParameters, MAX_REFRACTORY_PERIOD, PACKET_VALIDITY_WINDOW, QOS_LATENCY_WINDOW,
    QOS_MAX_OUTSTANDING_RECORDS, QOS_SAMPLE_DIVISOR,
};
use crate::proto::{QosRecord, QOS_TABLE_SIZE};
use crate::quality::{PathMeasurement, SampleWindow};
use crate::transport::{PacketKind, PathRef};

/// Whether a packet id is one of the ids sampled for QoS.
pub(crate) fn is_sampled_id(packet_id: u64) -> bool {
    packet_id & (QOS_SAMPLE_DIVISOR - 1) != 0
}

#[derive(Debug)]
pub(crate) struct PathSlot {
    pub path: PathRef,
    pub link: Arc<Link>,

    // copied from the link
    pub addr_family_pref: AddressFamilyPreference,
    pub mode: LinkMode,
    pub enabled: bool,
    pub up_delay: u32,
    pub down_delay: u32,
    pub monitor_interval: u32,
    pub only_path_on_link: bool,

    pub alive: bool,
    pub eligible: bool,
    pub bonded: bool,
    pub negotiated: bool,
    pub should_reallocate_flows: bool,

    pub when_nominated: i64,
    pub last_alive_toggle: i64,
    pub refractory_period: u32,
    pub last_refractory_update: i64,

    pub latency: SampleWindow,
    pub validity: SampleWindow,
    pub latency_mean: f32,
    pub latency_variance: f32,
    pub packet_loss_ratio: f32,
    pub packet_error_ratio: f32,

    /// packet id -> time sent, awaiting a QoS record from the peer
    pub qos_out: BTreeMap<u64, i64>,
    /// packet id -> time received, to be reported to the peer
    pub qos_in: BTreeMap<u64, i64>,
    pub packets_received_since_last_qos: u32,
    pub last_qos_measurement: i64,
    pub qos_acked: u32,
    pub qos_lost: u32,

    pub packets_in: u64,
    pub packets_out: u64,

    pub allocation: u8,
    pub affinity: u8,
    pub relative_load: u8,
    pub failover_score: i32,
    pub assigned_flow_count: u32,
}

impl PathSlot {
    pub fn new(path: PathRef, link: Arc<Link>, now: i64) -> Self {
        Self {
            addr_family_pref: link.addr_family_pref(),
            mode: link.mode(),
            enabled: link.enabled(),
            up_delay: 0,
            down_delay: 0,
            monitor_interval: 0,
            only_path_on_link: false,
            path,
            link,
            alive: false,
            eligible: false,
            bonded: false,
            negotiated: false,
            should_reallocate_flows: false,
            when_nominated: now,
            last_alive_toggle: now,
            refractory_period: 0,
            last_refractory_update: 0,
            latency: SampleWindow::new(QOS_LATENCY_WINDOW),
            validity: SampleWindow::new(PACKET_VALIDITY_WINDOW),
            latency_mean: 0.0,
            latency_variance: 0.0,
            packet_loss_ratio: 0.0,
            packet_error_ratio: 0.0,
            qos_out: BTreeMap::new(),
            qos_in: BTreeMap::new(),
            packets_received_since_last_qos: 0,
            last_qos_measurement: now,
            qos_acked: 0,
            qos_lost: 0,
            packets_in: 0,
            packets_out: 0,
            allocation: 0,
            affinity: 0,
            relative_load: 0,
            failover_score: 0,
            assigned_flow_count: 0,
        }
    }

    /// Copy the link's current settings, falling back to the bond's timing.
    pub fn apply_link_prefs(&mut self, params: &BondParameters) {
        let link = &self.link;
        self.addr_family_pref = link.addr_family_pref();
        self.mode = link.mode();
        self.enabled = link.enabled();
        self.up_delay = if link.up_delay() > 0 {
            link.up_delay()
        } else {
            params.up_delay
        };
        self.down_delay = if link.down_delay() > 0 {
            link.down_delay()
        } else {
            params.down_delay
        };
        self.monitor_interval = if link.monitor_interval() > 0 {
            link.monitor_interval()
        } else {
            params.monitor_interval()
        };
    }

    /// Usable at all under the link's family restriction.
    pub fn allowed(&self) -> bool {
        self.enabled && self.addr_family_pref.allows(&self.path.address())
    }

    /// Preferred within its link: the link's preferred family, or the only path on the link.
    pub fn preferred(&self) -> bool {
        self.only_path_on_link || self.addr_family_pref.prefers(&self.path.address())
    }

    pub fn is_primary(&self) -> bool {
        self.mode == LinkMode::Primary
    }

    /// Grow the refractory period on failure, drain it with elapsed time otherwise.
    pub fn adjust_refractory_period(&mut self, now: i64, punishment: u32, failure: bool) {
        if failure {
            let suggested = if self.refractory_period > 0 {
                punishment.saturating_add(self.refractory_period.saturating_mul(2))
            } else {
                punishment
            };
            self.refractory_period = suggested.min(MAX_REFRACTORY_PERIOD);
            self.last_refractory_update = 0;
        } else {
            let since = if self.last_refractory_update != 0 {
                self.last_refractory_update
            } else {
                self.last_alive_toggle
            };
            let drain = (now - since).max(0) as u64;
            self.last_refractory_update = now;
            if u64::from(self.refractory_period) > drain {
                self.refractory_period -= drain as u32;
            } else {
                self.refractory_period = 0;
                self.last_refractory_update = 0;
            }
        }
    }

    pub fn reset_packet_counts(&mut self) {
        self.packets_in = 0;
        self.packets_out = 0;
    }

    pub fn record_outgoing(&mut self, packet_id: u64, kind: PacketKind, now: i64) {
        if kind == PacketKind::Frame {
            self.packets_out += 1;
        }
        if kind.is_qos_sampled()
            && is_sampled_id(packet_id)
            && self.qos_out.len() < QOS_MAX_OUTSTANDING_RECORDS
        {
            self.qos_out.insert(packet_id, now);
        }
    }

    pub fn record_incoming(&mut self, packet_id: u64, kind: PacketKind, now: i64) {
        if kind == PacketKind::Frame {
            self.packets_in += 1;
        }
        self.validity.push(1.0);
        if kind.is_qos_sampled()
            && is_sampled_id(packet_id)
            && self.qos_in.len() < QOS_MAX_OUTSTANDING_RECORDS
        {
            self.qos_in.insert(packet_id, now);
            self.packets_received_since_last_qos += 1;
        }
    }

    pub fn record_invalid(&mut self) {
        self.validity.push(0.0);
    }

    /// Match reported records against outstanding ones and take latency samples.
    pub fn receive_qos(&mut self, now: i64, records: &[QosRecord]) -> usize {
        let mut matched = 0;
        for record in records {
            if let Some(sent) = self.qos_out.remove(&record.packet_id) {
                let latency = ((now - sent) - i64::from(record.holding_time)) as f32 / 2.0;
                self.latency.push(latency.max(0.0));
                self.qos_acked += 1;
                matched += 1;
            }
        }
        matched
    }

    pub fn needs_qos_report(&self, now: i64, interval: u32) -> bool {
        self.packets_received_since_last_qos > 0
            && (self.packets_received_since_last_qos as usize >= QOS_TABLE_SIZE
                || now - self.last_qos_measurement >= i64::from(interval))
    }

    /// Drain up to one message worth of inbound records, oldest ids first.
    pub fn drain_qos_records(&mut self, now: i64) -> Vec<QosRecord> {
        let budget = (self.packets_received_since_last_qos as usize).min(QOS_TABLE_SIZE);
        let mut records = Vec::with_capacity(budget);
        while records.len() < budget {
            let Some((packet_id, received)) = self.qos_in.pop_first() else {
                break;
            };
            let holding = (now - received).clamp(0, i64::from(u16::MAX)) as u16;
            records.push(QosRecord {
                packet_id,
                holding_time: holding,
            });
        }
        self.packets_received_since_last_qos = 0;
        self.last_qos_measurement = now;
        records
    }

    pub fn measurement(&self, use_speed: bool) -> PathMeasurement {
        PathMeasurement {
            latency: self.latency_mean,
            jitter: self.latency_variance,
            loss_ratio: self.packet_loss_ratio,
            error_ratio: self.packet_error_ratio,
            speed: if use_speed {
                f32::from(self.link.relative_speed()) / 255.0
            } else {
                1.0
            },
        }
    }

    pub fn status(&self, index: usize, active: bool) -> PathStatus {
        PathStatus {
            index,
            interface: self.link.interface_name().to_string(),
            address: self.path.address(),
            local_socket: self.path.local_socket(),
            alive: self.alive,
            eligible: self.eligible,
            bonded: self.bonded,
            active,
            allocation: self.allocation,
            failover_score: self.failover_score,
            latency_mean: self.latency_mean,
            latency_variance: self.latency_variance,
            packet_loss_ratio: self.packet_loss_ratio,
            packet_error_ratio: self.packet_error_ratio,
            assigned_flows: self.assigned_flow_count,
            refractory_period: self.refractory_period,
        }
    }
}
