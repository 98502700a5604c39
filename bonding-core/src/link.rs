//! Logical links: a named local interface plus the user's bonding preferences.
//!
//! Several physical paths may share one link (for example an IPv4 and an IPv6
//! path leaving the same NIC). Links are shared between bonds via `Arc` and are
//! read without locks; the two fields the engine writes at runtime are atomics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Which address families a link may carry, and which one it prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressFamilyPreference {
    /// Any family, no preference
    #[default]
    None,
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
    /// Both families, IPv4 preferred
    V4OverV6,
    /// Both families, IPv6 preferred
    V6OverV4,
}

impl AddressFamilyPreference {
    /// Map the conventional numeric codes (0, 4, 6, 46, 64).
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            4 => Some(Self::V4),
            6 => Some(Self::V6),
            46 => Some(Self::V4OverV6),
            64 => Some(Self::V6OverV4),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::V4 => 4,
            Self::V6 => 6,
            Self::V4OverV6 => 46,
            Self::V6OverV4 => 64,
        }
    }

    /// Whether a path with this address may be used at all.
    pub fn allows(&self, addr: &SocketAddr) -> bool {
        match self {
            Self::None | Self::V4OverV6 | Self::V6OverV4 => true,
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }

    /// Whether a path with this address is of the preferred family.
    pub fn prefers(&self, addr: &SocketAddr) -> bool {
        match self {
            Self::None => false,
            Self::V4 | Self::V4OverV6 => addr.is_ipv4(),
            Self::V6 | Self::V6OverV4 => addr.is_ipv6(),
        }
    }

    /// True for the dual-family variants.
    pub fn is_dual(&self) -> bool {
        matches!(self, Self::V4OverV6 | Self::V6OverV4)
    }
}

/// Role of a link within an active-backup bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkMode {
    Primary,
    #[default]
    Spare,
}

impl FromStr for LinkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Self::Primary),
            "spare" => Ok(Self::Spare),
            other => Err(format!("unknown link mode: {other}")),
        }
    }
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Spare => f.write_str("spare"),
        }
    }
}

/// A local interface as seen by the bonding engine.
#[derive(Debug)]
pub struct Link {
    interface_name: String,
    addr_family_pref: AddressFamilyPreference,
    nominal_speed: u32,
    relative_speed: AtomicU8,
    mode: LinkMode,
    failover_target: Option<String>,
    enabled: bool,
    /// Per-link overrides of the bond timing, 0 = inherit
    up_delay: u32,
    down_delay: u32,
    monitor_interval: u32,
    user_specified: AtomicBool,
}

impl Link {
    /// Create a link as described by the user.
    pub fn new(interface_name: impl Into<String>, mode: LinkMode) -> Self {
        Self {
            interface_name: interface_name.into(),
            addr_family_pref: AddressFamilyPreference::None,
            nominal_speed: 0,
            relative_speed: AtomicU8::new(0),
            mode,
            failover_target: None,
            enabled: true,
            up_delay: 0,
            down_delay: 0,
            monitor_interval: 0,
            user_specified: AtomicBool::new(true),
        }
    }

    /// Link synthesized for an interface the user never mentioned.
    pub fn implicit(interface_name: impl Into<String>) -> Self {
        let link = Self::new(interface_name, LinkMode::Spare);
        link.user_specified.store(false, Ordering::Relaxed);
        link
    }

    pub fn with_addr_family_pref(mut self, pref: AddressFamilyPreference) -> Self {
        self.addr_family_pref = pref;
        self
    }

    pub fn with_speed(mut self, speed: u32) -> Self {
        self.nominal_speed = speed;
        self
    }

    pub fn with_failover_target(mut self, target: impl Into<String>) -> Self {
        self.failover_target = Some(target.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_delays(mut self, up_delay: u32, down_delay: u32) -> Self {
        self.up_delay = up_delay;
        self.down_delay = down_delay;
        self
    }

    pub fn with_monitor_interval(mut self, interval: u32) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn addr_family_pref(&self) -> AddressFamilyPreference {
        self.addr_family_pref
    }

    pub fn nominal_speed(&self) -> u32 {
        self.nominal_speed
    }

    /// Share of the bond's total speed, scaled to 0..=255. Written by quality estimation.
    pub fn relative_speed(&self) -> u8 {
        self.relative_speed.load(Ordering::Relaxed)
    }

    pub fn set_relative_speed(&self, speed: u8) {
        self.relative_speed.store(speed, Ordering::Relaxed);
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn is_primary(&self) -> bool {
        self.mode == LinkMode::Primary
    }

    pub fn failover_target(&self) -> Option<&str> {
        self.failover_target.as_deref()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn up_delay(&self) -> u32 {
        self.up_delay
    }

    pub fn down_delay(&self) -> u32 {
        self.down_delay
    }

    pub fn monitor_interval(&self) -> u32 {
        self.monitor_interval
    }

    pub fn is_user_specified(&self) -> bool {
        self.user_specified.load(Ordering::Relaxed)
    }

    pub fn set_user_specified(&self, value: bool) {
        self.user_specified.store(value, Ordering::Relaxed);
    }
}
