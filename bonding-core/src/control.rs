//! Control plane: policy configuration, interface resolution and status snapshots.
//!
//! This module manages:
//! - The TOML policy file (named policies, their links, peer assignments)
//! - Mapping local sockets to interface names
//! - Read-only views of bond state for operators

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::bond::BondError;
use crate::link::{AddressFamilyPreference, Link, LinkMode};
use crate::params::BondParameters;
use crate::registry::PolicyTemplate;
use crate::scheduler::{BondingPolicy, FlowRebalanceStrategy, ReselectionPolicy};
use crate::transport::{LocalSocket, PeerIdentity};

fn default_enabled() -> bool {
    true
}

fn duration_ms(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Invalid quality weights for policy {alias}: {source}")]
    InvalidWeights {
        alias: String,
        #[source]
        source: BondError,
    },

    #[error("Policy alias already defined: {0}")]
    DuplicateAlias(String),

    #[error("Invalid peer identity: {0}")]
    InvalidPeer(String),
}

/// Bonding configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BondingConfig {
    /// Policy for peers without an assignment: a base policy name or a policy alias
    #[serde(default)]
    pub default_policy: Option<String>,

    /// Named policies
    #[serde(default, rename = "policy")]
    pub policies: Vec<PolicyConfig>,

    /// Peer identity (hex) -> policy alias
    #[serde(default)]
    pub peers: HashMap<String, String>,
}

impl BondingConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Peer assignments with parsed identities, in a stable order.
    pub fn peer_assignments(&self) -> Result<Vec<(PeerIdentity, String)>, ConfigError> {
        let mut out = self
            .peers
            .iter()
            .map(|(peer, alias)| {
                peer.parse::<PeerIdentity>()
                    .map(|id| (id, alias.clone()))
                    .map_err(|_| ConfigError::InvalidPeer(peer.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        out.sort();
        Ok(out)
    }
}

/// A named bonding policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub alias: String,
    /// Base policy this alias customises
    pub base: BondingPolicy,

    #[serde(default, with = "humantime_serde")]
    pub failover_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub up_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub down_delay: Option<Duration>,

    /// Active-backup reselection method
    #[serde(default)]
    pub link_select: Option<ReselectionPolicy>,
    #[serde(default)]
    pub packets_per_link: Option<u32>,
    #[serde(default)]
    pub flow_hashing: Option<bool>,
    #[serde(default)]
    pub path_negotiation: Option<bool>,
    #[serde(default)]
    pub flow_rebalance: Option<FlowRebalanceStrategy>,

    /// Latency, jitter, loss, error, speed
    #[serde(default)]
    pub quality_weights: Option<Vec<f32>>,
    #[serde(default, with = "humantime_serde")]
    pub max_latency: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub max_jitter: Option<Duration>,
    #[serde(default)]
    pub max_loss_ratio: Option<f32>,
    #[serde(default)]
    pub max_error_ratio: Option<f32>,

    #[serde(default, rename = "link")]
    pub links: Vec<LinkConfig>,
}

impl PolicyConfig {
    /// Bond parameters: base policy defaults with this policy's overrides applied.
    pub fn to_params(&self) -> Result<BondParameters, ConfigError> {
        let mut params = BondParameters::for_policy(self.base);
        if let Some(d) = self.failover_interval {
            params.set_failover_interval(duration_ms(d));
        }
        if let Some(d) = self.up_delay {
            params.up_delay = duration_ms(d);
        }
        if let Some(d) = self.down_delay {
            params.down_delay = duration_ms(d);
        }
        if let Some(method) = self.link_select {
            params.reselection = method;
        }
        if let Some(n) = self.packets_per_link {
            params.packets_per_link = n;
        }
        if let Some(v) = self.flow_hashing {
            params.flow_hashing = v;
        }
        if let Some(v) = self.path_negotiation {
            params.path_negotiation = v;
        }
        if let Some(v) = self.flow_rebalance {
            params.flow_rebalance = v;
        }
        if let Some(weights) = &self.quality_weights {
            params
                .set_weights(weights)
                .map_err(|source| ConfigError::InvalidWeights {
                    alias: self.alias.clone(),
                    source,
                })?;
        }
        if let Some(d) = self.max_latency {
            params.limits.max_latency = d.as_secs_f32() * 1000.0;
        }
        if let Some(d) = self.max_jitter {
            params.limits.max_jitter = d.as_secs_f32() * 1000.0;
        }
        if let Some(v) = self.max_loss_ratio {
            params.limits.max_loss_ratio = v;
        }
        if let Some(v) = self.max_error_ratio {
            params.limits.max_error_ratio = v;
        }
        Ok(params)
    }

    pub fn to_template(&self) -> Result<PolicyTemplate, ConfigError> {
        Ok(PolicyTemplate::new(self.alias.clone(), self.to_params()?))
    }
}

/// One interface within a named policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub interface: String,
    #[serde(default)]
    pub mode: LinkMode,
    #[serde(default)]
    pub ip_pref: AddressFamilyPreference,
    /// Nominal speed in arbitrary units, relative to the policy's other links
    #[serde(default)]
    pub speed: u32,
    #[serde(default)]
    pub failover_to: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, with = "humantime_serde")]
    pub up_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub down_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub monitor_interval: Option<Duration>,
}

impl LinkConfig {
    pub fn to_link(&self) -> Link {
        let mut link = Link::new(self.interface.clone(), self.mode)
            .with_addr_family_pref(self.ip_pref)
            .with_speed(self.speed)
            .with_enabled(self.enabled)
            .with_delays(
                self.up_delay.map_or(0, duration_ms),
                self.down_delay.map_or(0, duration_ms),
            )
            .with_monitor_interval(self.monitor_interval.map_or(0, duration_ms));
        if let Some(target) = &self.failover_to {
            link = link.with_failover_target(target.clone());
        }
        link
    }
}

/// Maps a local socket to the name of the interface it is bound to.
pub trait InterfaceResolver: Send + Sync {
    fn interface_for_socket(&self, socket: LocalSocket) -> Option<String>;
}

impl<F> InterfaceResolver for F
where
    F: Fn(LocalSocket) -> Option<String> + Send + Sync,
{
    fn interface_for_socket(&self, socket: LocalSocket) -> Option<String> {
        self(socket)
    }
}

/// Fixed socket -> interface table.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces {
    sockets: HashMap<LocalSocket, String>,
}

impl StaticInterfaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, socket: LocalSocket, interface: impl Into<String>) -> Self {
        self.insert(socket, interface);
        self
    }

    pub fn insert(&mut self, socket: LocalSocket, interface: impl Into<String>) {
        self.sockets.insert(socket, interface.into());
    }
}

impl InterfaceResolver for StaticInterfaces {
    fn interface_for_socket(&self, socket: LocalSocket) -> Option<String> {
        self.sockets.get(&socket).cloned()
    }
}

/// Snapshot of one bond
#[derive(Debug, Clone, Serialize)]
pub struct BondStatus {
    pub peer: PeerIdentity,
    pub policy: BondingPolicy,
    pub policy_alias: String,
    pub healthy: bool,
    pub alive_links: usize,
    pub total_links: usize,
    pub active: Option<SocketAddr>,
    pub flows: usize,
    pub paths: Vec<PathStatus>,
}

/// Snapshot of one path slot
#[derive(Debug, Clone, Serialize)]
pub struct PathStatus {
    pub index: usize,
    pub interface: String,
    pub address: SocketAddr,
    pub local_socket: LocalSocket,
    pub alive: bool,
    pub eligible: bool,
    pub bonded: bool,
    pub active: bool,
    pub allocation: u8,
    pub failover_score: i32,
    pub latency_mean: f32,
    pub latency_variance: f32,
    pub packet_loss_ratio: f32,
    pub packet_error_ratio: f32,
    pub assigned_flows: u32,
    pub refractory_period: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default_policy = "office"

[[policy]]
alias = "office"
base = "active-backup"
failover_interval = "500ms"
link_select = "always"

[[policy.link]]
interface = "eth0"
mode = "primary"
failover_to = "wlan0"

[[policy.link]]
interface = "wlan0"
ip_pref = "v4-over-v6"
speed = 100
up_delay = "2s"

[[policy]]
alias = "fat-pipe"
base = "balance-aware"
quality_weights = [0.5, 0.3, 0.2, 0.0, 0.0]
max_latency = "250ms"

[peers]
"00000000ab" = "fat-pipe"
"#;

    #[test]
    fn test_parse_sample_config() {
        let cfg = BondingConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.default_policy.as_deref(), Some("office"));
        assert_eq!(cfg.policies.len(), 2);

        let office = &cfg.policies[0];
        assert_eq!(office.base, BondingPolicy::ActiveBackup);
        assert_eq!(office.failover_interval, Some(Duration::from_millis(500)));
        assert_eq!(office.links.len(), 2);
        assert_eq!(office.links[0].mode, LinkMode::Primary);
        assert!(office.links[1].enabled);
        assert_eq!(office.links[1].ip_pref, AddressFamilyPreference::V4OverV6);

        let params = office.to_params().unwrap();
        assert_eq!(params.failover_interval(), 500);
        assert_eq!(params.monitor_interval(), 125);
        assert_eq!(params.reselection, ReselectionPolicy::Always);

        let link = office.links[1].to_link();
        assert_eq!(link.up_delay(), 2000);
        assert_eq!(link.nominal_speed(), 100);
        assert!(office.links[0].to_link().failover_target() == Some("wlan0"));

        let aware = cfg.policies[1].to_params().unwrap();
        assert_eq!(aware.weights().as_array(), [0.5, 0.3, 0.2, 0.0, 0.0]);
        assert_eq!(aware.limits.max_latency, 250.0);

        let peers = cfg.peer_assignments().unwrap();
        assert_eq!(peers, vec![(PeerIdentity(0xab), "fat-pipe".to_string())]);
    }

    #[test]
    fn test_unknown_base_policy_fails_to_parse() {
        let raw = r#"
[[policy]]
alias = "x"
base = "balance-tlb"
"#;
        assert!(matches!(
            BondingConfig::from_toml_str(raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let raw = r#"
[[policy]]
alias = "bad"
base = "balance-xor"
quality_weights = [0.9, 0.9, 0.0, 0.0, 0.0]
"#;
        let cfg = BondingConfig::from_toml_str(raw).unwrap();
        let err = cfg.policies[0].to_params().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWeights { ref alias, .. } if alias == "bad"));
    }

    #[test]
    fn test_invalid_peer_identity() {
        let mut cfg = BondingConfig::default();
        cfg.peers.insert("not-hex".into(), "x".into());
        assert!(matches!(
            cfg.peer_assignments(),
            Err(ConfigError::InvalidPeer(_))
        ));
    }

    #[test]
    fn test_static_interfaces_and_closures() {
        let table = StaticInterfaces::new().with(1, "eth0").with(2, "wlan0");
        assert_eq!(table.interface_for_socket(2).as_deref(), Some("wlan0"));
        assert!(table.interface_for_socket(3).is_none());

        let resolver = |s: LocalSocket| (s > 10).then(|| format!("if{s}"));
        assert_eq!(resolver.interface_for_socket(11).as_deref(), Some("if11"));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let cfg = BondingConfig::from_toml_str(SAMPLE).unwrap();
        let raw = toml::to_string_pretty(&cfg).unwrap();
        assert_eq!(BondingConfig::from_toml_str(&raw).unwrap(), cfg);
    }
}
