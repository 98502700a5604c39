//! Tunables and named constants of the bonding engine.
//!
//! All times are in milliseconds.

use crate::bond::BondError;
use crate::quality::{QualityLimits, QualityWeights, METRIC_COUNT};
use crate::scheduler::{BondingPolicy, FlowRebalanceStrategy, ReselectionPolicy};

/// Number of path slots per bond.
pub const MAX_PEER_NETWORK_PATHS: usize = 64;

pub const FAILOVER_DEFAULT_INTERVAL: u32 = 5000;
pub const FAILOVER_MIN_INTERVAL: u32 = 250;
pub const ECHOS_PER_FAILOVER_INTERVAL: u32 = 4;

/// A newly nominated path is eligible for this long regardless of liveness.
pub const TRIAL_PERIOD: i64 = 15_000;
/// Minimum time between performance-driven active-backup switches.
pub const OPTIMIZE_INTERVAL: i64 = 15_000;

pub const PATH_HEARTBEAT_PERIOD: i64 = 14_000;
/// Non-leaf paths count as alive while heard from within this window.
pub const PATH_EXPIRATION: i64 = PATH_HEARTBEAT_PERIOD * 4 + 3000;
/// Slots silent for this long are removed from the bond.
pub const EXPIRED_PATH_WINDOW: i64 = PATH_HEARTBEAT_PERIOD * 6;

pub const DEFAULT_REFRACTORY_PERIOD: u32 = 8000;
pub const MAX_REFRACTORY_PERIOD: u32 = 64_000;

pub const FAILOVER_HANDICAP_PREFERRED: i32 = 500;
pub const FAILOVER_HANDICAP_PRIMARY: i32 = 1000;
pub const FAILOVER_HANDICAP_NEGOTIATED: i32 = 5000;
pub const REFRACTORY_HANDICAP: i32 = -10_000;
/// Score given up by a failover target relative to the path it backs up.
pub const FAILOVER_INHERIT_DISCOUNT: i32 = 10;

/// Fraction of the active path's allocation a challenger must exceed it by.
pub const ACTIVE_BACKUP_OPTIMIZE_MIN_THRESHOLD: f32 = 0.10;

pub const PATH_NEGOTIATION_CHECK_INTERVAL: i64 = 15_000;
pub const PATH_NEGOTIATION_CUTOFF_TIME: i64 = 60_000;
pub const PATH_NEGOTIATION_TRY_COUNT: u32 = 3;
pub const PATH_NEGOTIATION_CUTOFF_LIMIT: u32 = 8;

pub const FLOW_MAX_COUNT: usize = 128;
pub const FLOW_EXPIRATION: i64 = PATH_EXPIRATION;
pub const FLOW_STATS_RESET_INTERVAL: i64 = 15_000;
pub const FLOW_REBALANCE_INTERVAL: i64 = 5000;
/// Paths below this fraction of the mean allocation shed their flows.
pub const UNDERPERFORMANCE_FRACTION: f32 = 0.33;

/// Only packet ids with these low bits set are sampled (odd ids for 2).
pub const QOS_SAMPLE_DIVISOR: u64 = 2;
pub const QOS_MAX_OUTSTANDING_RECORDS: usize = 16_384;
/// Unanswered outbound records expire after this many QoS intervals.
pub const QOS_RECORD_EXPIRY_INTERVALS: i64 = 3;
pub const QOS_CUTOFF_LIMIT: u32 = (MAX_PEER_NETWORK_PATHS * 2) as u32;
pub const QOS_LATENCY_WINDOW: usize = 64;
pub const PACKET_VALIDITY_WINDOW: usize = 128;
pub const LOSS_SMOOTHING: f32 = 0.25;

pub const BACKGROUND_TASK_MIN_INTERVAL: i64 = 30;

/// Every tunable a bond runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct BondParameters {
    pub policy: BondingPolicy,
    failover_interval: u32,
    pub up_delay: u32,
    pub down_delay: u32,
    monitor_interval: u32,
    pub refractory_period: u32,
    pub packets_per_link: u32,
    pub flow_hashing: bool,
    pub path_negotiation: bool,
    pub reselection: ReselectionPolicy,
    pub flow_rebalance: FlowRebalanceStrategy,
    weights: QualityWeights,
    pub limits: QualityLimits,
}

impl BondParameters {
    /// Reasonable defaults for `policy`.
    pub fn for_policy(policy: BondingPolicy) -> Self {
        let weights = match policy {
            BondingPolicy::BalanceRr | BondingPolicy::BalanceXor => [0.4, 0.2, 0.1, 0.1, 0.2],
            BondingPolicy::BalanceAware => [0.4, 0.4, 0.2, 0.0, 0.0],
            _ => [0.2; METRIC_COUNT],
        };
        let mut params = Self {
            policy,
            failover_interval: FAILOVER_DEFAULT_INTERVAL,
            up_delay: 0,
            down_delay: 0,
            monitor_interval: 0,
            refractory_period: DEFAULT_REFRACTORY_PERIOD,
            packets_per_link: 64,
            flow_hashing: policy.uses_flow_assignment(),
            path_negotiation: policy == BondingPolicy::ActiveBackup,
            reselection: ReselectionPolicy::Optimize,
            flow_rebalance: FlowRebalanceStrategy::default(),
            weights: QualityWeights(weights),
            limits: QualityLimits::default(),
        };
        if policy == BondingPolicy::Broadcast {
            params.down_delay = 30_000;
        }
        params.set_failover_interval(FAILOVER_DEFAULT_INTERVAL);
        params
    }

    pub fn failover_interval(&self) -> u32 {
        self.failover_interval
    }

    /// Set the failover interval (floored at the minimum) and rederive the
    /// monitor interval from it.
    pub fn set_failover_interval(&mut self, interval: u32) {
        self.failover_interval = interval.max(FAILOVER_MIN_INTERVAL);
        self.monitor_interval = self.failover_interval / ECHOS_PER_FAILOVER_INTERVAL;
    }

    /// How often paths are probed.
    pub fn monitor_interval(&self) -> u32 {
        self.monitor_interval
    }

    /// How often QoS measurements are sent on each path.
    pub fn qos_send_interval(&self) -> u32 {
        self.failover_interval * 2
    }

    pub fn quality_estimation_interval(&self) -> u32 {
        self.failover_interval * 2
    }

    pub fn weights(&self) -> &QualityWeights {
        &self.weights
    }

    /// Replace the quality weights; an invalid vector leaves the old ones in place.
    pub fn set_weights(&mut self, weights: &[f32]) -> Result<(), BondError> {
        self.weights = QualityWeights::from_slice(weights)?;
        Ok(())
    }
}

impl Default for BondParameters {
    fn default() -> Self {
        Self::for_policy(BondingPolicy::ActiveBackup)
    }
}
