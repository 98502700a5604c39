//! Path selection primitives shared by the bonding policies.
//!
//! This module holds the policy vocabulary and the stateless (or nearly
//! stateless) pieces of the selection logic:
//!
//! - **active-backup**: one active path, the rest wait in a failover queue
//! - **broadcast**: every bonded path carries every packet
//! - **balance-rr**: packets are striped across bonded paths
//! - **balance-xor**: flows are pinned by `|flow id| mod n`
//! - **balance-aware**: flows are placed by an allocation-weighted draw
//!
//! Everything here is pure and deterministic for testability; randomness is
//! injected by the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::bond::BondError;

/// Bonding policy of a bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BondingPolicy {
    /// Bonding disabled; the peer picks its own path
    #[default]
    None,
    ActiveBackup,
    Broadcast,
    BalanceRr,
    BalanceXor,
    BalanceAware,
}

impl BondingPolicy {
    pub const ALL: [BondingPolicy; 6] = [
        BondingPolicy::None,
        BondingPolicy::ActiveBackup,
        BondingPolicy::Broadcast,
        BondingPolicy::BalanceRr,
        BondingPolicy::BalanceXor,
        BondingPolicy::BalanceAware,
    ];

    /// Canonical name as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            BondingPolicy::None => "none",
            BondingPolicy::ActiveBackup => "active-backup",
            BondingPolicy::Broadcast => "broadcast",
            BondingPolicy::BalanceRr => "balance-rr",
            BondingPolicy::BalanceXor => "balance-xor",
            BondingPolicy::BalanceAware => "balance-aware",
        }
    }

    /// Policies that spread traffic over several bonded paths at once.
    pub fn is_balance(&self) -> bool {
        matches!(
            self,
            BondingPolicy::BalanceRr | BondingPolicy::BalanceXor | BondingPolicy::BalanceAware
        )
    }

    /// Policies that pin flows to paths.
    pub fn uses_flow_assignment(&self) -> bool {
        matches!(self, BondingPolicy::BalanceXor | BondingPolicy::BalanceAware)
    }
}

impl FromStr for BondingPolicy {
    type Err = BondError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| BondError::UnknownPolicy(s.to_string()))
    }
}

impl fmt::Display for BondingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When an active-backup bond moves away from its current active path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReselectionPolicy {
    /// Switch back to the primary whenever it is eligible again
    Always,
    /// Switch back to the primary only if it is strictly better than the active path
    Better,
    /// Only switch when the active path fails
    Failure,
    /// Continuously move to the best path, and negotiate with the peer
    #[default]
    Optimize,
}

impl FromStr for ReselectionPolicy {
    type Err = BondError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "better" => Ok(Self::Better),
            "failure" => Ok(Self::Failure),
            "optimize" => Ok(Self::Optimize),
            other => Err(BondError::UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for ReselectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Always => "always",
            Self::Better => "better",
            Self::Failure => "failure",
            Self::Optimize => "optimize",
        };
        f.write_str(name)
    }
}

/// How eagerly flows are moved between healthy paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowRebalanceStrategy {
    /// Flows only move when their path leaves the bond
    Passive,
    /// Flows also leave paths that fall below the performance threshold
    Opportunistic,
    /// Flows additionally return to their previous path once it recovers
    #[default]
    Aggressive,
}

/// Striping cursor for balance-rr.
///
/// `index` is a position in the bonded-index map. The cursor serves
/// `quota` consecutive packets on one position before advancing to the
/// next usable one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundRobinCursor {
    index: usize,
    sent_on_current: u32,
}

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart at the first bonded position with a fresh quota.
    pub fn reset(&mut self) {
        self.index = 0;
        self.sent_on_current = 0;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Position for the next packet.
    ///
    /// `usable(i)` reports whether bonded position `i` may currently carry
    /// traffic. If no other position is usable the cursor stays put.
    pub fn next(
        &mut self,
        packets_per_link: u32,
        bonded_count: usize,
        usable: impl Fn(usize) -> bool,
    ) -> Option<usize> {
        if bonded_count == 0 {
            return None;
        }
        if self.index >= bonded_count {
            self.reset();
        }
        if self.sent_on_current >= packets_per_link.max(1) {
            self.sent_on_current = 0;
            let mut candidate = self.index;
            for _ in 1..bonded_count {
                candidate = (candidate + 1) % bonded_count;
                if usable(candidate) {
                    self.index = candidate;
                    break;
                }
            }
        }
        self.sent_on_current += 1;
        Some(self.index)
    }
}

/// Bonded position for a flow under balance-xor.
pub fn xor_index(flow_id: i32, bonded_count: usize) -> Option<usize> {
    if bonded_count == 0 {
        return None;
    }
    Some(flow_id.unsigned_abs() as usize % bonded_count)
}

/// Pick an entry of `segments` with probability proportional to its weight.
///
/// `entropy` is reduced modulo the total weight and then walked down the
/// segments; the entry that brings the remainder to zero or below wins.
/// Returns `None` when every weight is zero.
pub fn weighted_draw<T: Copy>(entropy: u32, segments: &[(T, u32)]) -> Option<T> {
    let total: u32 = segments.iter().map(|(_, w)| *w).sum();
    if total == 0 {
        return None;
    }
    let mut remainder = i64::from(entropy % total);
    for (item, weight) in segments.iter().filter(|(_, w)| *w > 0) {
        remainder -= i64::from(*weight);
        if remainder <= 0 {
            return Some(*item);
        }
    }
    segments.iter().rev().find(|(_, w)| *w > 0).map(|(item, _)| *item)
}
