//! Process-wide bookkeeping: which peer gets which bond, and which local
//! interfaces belong to which policy.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::bond::{Bond, UserPreferences};
use crate::control::{BondingConfig, ConfigError, InterfaceResolver};
use crate::link::Link;
use crate::params::{BondParameters, FAILOVER_DEFAULT_INTERVAL};
use crate::scheduler::BondingPolicy;
use crate::transport::{LocalSocket, PeerIdentity, PeerInfo, PeerTransport};

/// A named, customised policy from which bonds are instantiated.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyTemplate {
    pub alias: String,
    pub params: BondParameters,
}

impl PolicyTemplate {
    pub fn new(alias: impl Into<String>, params: BondParameters) -> Self {
        Self {
            alias: alias.into(),
            params,
        }
    }
}

#[derive(Default)]
struct LinkTables {
    /// Links the user listed for each policy alias, in declaration order
    defined: HashMap<String, Vec<Arc<Link>>>,
    /// Policy alias -> interface name -> link, including implicit spares
    by_interface: HashMap<String, HashMap<String, Arc<Link>>>,
}

/// Links per policy alias, shared by every bond of the node.
pub struct LinkDirectory {
    resolver: Arc<dyn InterfaceResolver>,
    tables: Mutex<LinkTables>,
}

impl LinkDirectory {
    pub fn new(resolver: Arc<dyn InterfaceResolver>) -> Self {
        Self {
            resolver,
            tables: Mutex::new(LinkTables::default()),
        }
    }

    /// Declare `link` as part of the policy `alias`.
    ///
    /// An implicit link already created for the same interface is replaced;
    /// a second user link for the same interface only joins the declared list.
    pub fn add_link(&self, alias: &str, link: Link) -> Arc<Link> {
        link.set_user_specified(true);
        let link = Arc::new(link);
        let mut tables = self.tables.lock();
        tables
            .defined
            .entry(alias.to_string())
            .or_default()
            .push(link.clone());

        let interfaces = tables.by_interface.entry(alias.to_string()).or_default();
        match interfaces.get(link.interface_name()) {
            Some(existing) if existing.is_user_specified() => {}
            _ => {
                interfaces.insert(link.interface_name().to_string(), link.clone());
            }
        }
        tracing::debug!(policy = alias, interface = link.interface_name(), mode = %link.mode(), "link registered");
        link
    }

    /// Link behind `socket` for `alias`, created as a spare on first sight.
    pub fn link_for_socket(&self, alias: &str, socket: LocalSocket) -> Option<Arc<Link>> {
        let name = self.resolver.interface_for_socket(socket)?;
        let mut tables = self.tables.lock();
        let interfaces = tables.by_interface.entry(alias.to_string()).or_default();
        let link = interfaces
            .entry(name.clone())
            .or_insert_with(|| {
                tracing::debug!(policy = alias, interface = %name, "implicit spare link");
                Arc::new(Link::implicit(name))
            })
            .clone();
        Some(link)
    }

    pub fn link_by_name(&self, alias: &str, name: &str) -> Option<Arc<Link>> {
        self.tables
            .lock()
            .by_interface
            .get(alias)
            .and_then(|m| m.get(name))
            .cloned()
    }

    /// A policy without declared links accepts every interface.
    pub fn link_allowed(&self, alias: &str, link: &Link) -> bool {
        match self.tables.lock().defined.get(alias) {
            None => true,
            Some(defined) if defined.is_empty() => true,
            Some(defined) => defined
                .iter()
                .any(|l| l.interface_name() == link.interface_name()),
        }
    }

    pub fn user_specified_links(&self, alias: &str) -> Vec<Arc<Link>> {
        self.tables
            .lock()
            .defined
            .get(alias)
            .cloned()
            .unwrap_or_default()
    }

    /// What the user declared about the links of `alias`.
    pub fn preferences(&self, alias: &str) -> UserPreferences {
        let tables = self.tables.lock();
        let mut prefs = UserPreferences::default();
        let Some(interfaces) = tables.by_interface.get(alias) else {
            return prefs;
        };
        for link in interfaces.values().filter(|l| l.is_user_specified()) {
            prefs.links = true;
            prefs.primary |= link.is_primary();
            prefs.failover |= link.failover_target().is_some();
            prefs.speeds |= link.nominal_speed() > 0;
        }
        prefs
    }
}

struct RegistryState {
    bonds: HashMap<PeerIdentity, Arc<Bond>>,
    templates: HashMap<String, PolicyTemplate>,
    assignments: HashMap<PeerIdentity, String>,
    default_policy: BondingPolicy,
    default_template: Option<String>,
}

/// Maps peers to bonds and owns the node's policy templates.
pub struct BondRegistry {
    local: PeerIdentity,
    links: Arc<LinkDirectory>,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<RegistryState>,
    min_monitor_interval: AtomicU32,
}

impl BondRegistry {
    pub fn new(
        local: PeerIdentity,
        resolver: Arc<dyn InterfaceResolver>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            local,
            links: Arc::new(LinkDirectory::new(resolver)),
            transport,
            state: Mutex::new(RegistryState {
                bonds: HashMap::new(),
                templates: HashMap::new(),
                assignments: HashMap::new(),
                default_policy: BondingPolicy::None,
                default_template: None,
            }),
            min_monitor_interval: AtomicU32::new(FAILOVER_DEFAULT_INTERVAL),
        }
    }

    /// Build a registry and apply `config` to it.
    pub fn from_config(
        local: PeerIdentity,
        resolver: Arc<dyn InterfaceResolver>,
        transport: Arc<dyn PeerTransport>,
        config: &BondingConfig,
    ) -> Result<Self, ConfigError> {
        let registry = Self::new(local, resolver, transport);
        registry.apply_config(config)?;
        Ok(registry)
    }

    /// Register every policy, link, peer assignment and the default of `config`.
    pub fn apply_config(&self, config: &BondingConfig) -> Result<(), ConfigError> {
        for policy in &config.policies {
            let template = policy.to_template()?;
            if !self.add_policy_template(template) {
                return Err(ConfigError::DuplicateAlias(policy.alias.clone()));
            }
            for link in &policy.links {
                self.links.add_link(&policy.alias, link.to_link());
            }
        }
        for (peer, alias) in config.peer_assignments()? {
            if !self.has_template(&alias) {
                return Err(ConfigError::UnknownPolicy(alias));
            }
            if !self.assign_policy_to_peer(peer, &alias) {
                tracing::warn!(peer = %peer, policy = %alias, "peer already has a policy, ignoring");
            }
        }
        if let Some(default) = &config.default_policy {
            if let Ok(policy) = default.parse::<BondingPolicy>() {
                self.set_default_policy(policy);
            } else if self.has_template(default) {
                self.set_default_template(default);
            } else {
                return Err(ConfigError::UnknownPolicy(default.clone()));
            }
        }
        tracing::info!(
            policies = config.policies.len(),
            peers = config.peers.len(),
            "bonding configuration applied"
        );
        Ok(())
    }

    pub fn local_identity(&self) -> PeerIdentity {
        self.local
    }

    pub fn links(&self) -> &Arc<LinkDirectory> {
        &self.links
    }

    /// Add a named template. Fails on a duplicate alias or one that shadows a base policy name.
    pub fn add_policy_template(&self, template: PolicyTemplate) -> bool {
        if template.alias.parse::<BondingPolicy>().is_ok() {
            tracing::warn!(policy = %template.alias, "template alias shadows a base policy");
            return false;
        }
        let mut state = self.state.lock();
        if state.templates.contains_key(&template.alias) {
            return false;
        }
        tracing::debug!(policy = %template.alias, base = %template.params.policy, "policy template registered");
        state.templates.insert(template.alias.clone(), template);
        true
    }

    pub fn has_template(&self, alias: &str) -> bool {
        self.state.lock().templates.contains_key(alias)
    }

    /// Fails if the peer already has an assignment.
    pub fn assign_policy_to_peer(&self, peer: PeerIdentity, alias: &str) -> bool {
        let mut state = self.state.lock();
        if state.assignments.contains_key(&peer) {
            return false;
        }
        state.assignments.insert(peer, alias.to_string());
        true
    }

    pub fn set_default_policy(&self, policy: BondingPolicy) {
        self.state.lock().default_policy = policy;
    }

    pub fn default_policy(&self) -> BondingPolicy {
        self.state.lock().default_policy
    }

    pub fn set_default_template(&self, alias: &str) {
        self.state.lock().default_template = Some(alias.to_string());
    }

    /// Bond for `peer`, created on first request.
    ///
    /// Resolution order: the peer's assigned template, the default base
    /// policy, the default template. `None` when none of these apply.
    pub fn get_or_create_bond(&self, peer: PeerInfo) -> Option<Arc<Bond>> {
        let mut state = self.state.lock();
        if let Some(bond) = state.bonds.get(&peer.identity) {
            return Some(bond.clone());
        }

        let assigned = state
            .assignments
            .get(&peer.identity)
            .and_then(|alias| state.templates.get(alias));
        let default_template = state
            .default_template
            .as_ref()
            .and_then(|alias| state.templates.get(alias));
        let (alias, params) = if let Some(template) = assigned {
            (template.alias.clone(), template.params.clone())
        } else if state.default_policy != BondingPolicy::None {
            let policy = state.default_policy;
            (policy.as_str().to_string(), BondParameters::for_policy(policy))
        } else if let Some(template) = default_template {
            (template.alias.clone(), template.params.clone())
        } else {
            return None;
        };

        let bond = Arc::new(Bond::new(
            peer,
            self.local,
            alias.clone(),
            params,
            self.links.clone(),
            self.transport.clone(),
        ));
        bond.set_user_preferences(self.links.preferences(&alias));
        tracing::info!(peer = %peer.identity, policy = %bond.policy(), alias = %alias, "bond created");
        state.bonds.insert(peer.identity, bond.clone());
        Some(bond)
    }

    pub fn bond(&self, peer: PeerIdentity) -> Option<Arc<Bond>> {
        self.state.lock().bonds.get(&peer).cloned()
    }

    pub fn remove_bond(&self, peer: PeerIdentity) -> Option<Arc<Bond>> {
        let removed = self.state.lock().bonds.remove(&peer);
        if removed.is_some() {
            tracing::info!(peer = %peer, "bond removed");
        }
        removed
    }

    pub fn bonds(&self) -> Vec<Arc<Bond>> {
        self.state.lock().bonds.values().cloned().collect()
    }

    /// Run every bond's maintenance and return how long until the next tick is due.
    ///
    /// The registry lock is held only while the bond list is copied.
    pub fn tick(&self, now: i64) -> u32 {
        let bonds = self.bonds();
        let mut min_interval = FAILOVER_DEFAULT_INTERVAL;
        for bond in &bonds {
            bond.process_background_tasks(now);
            let interval = bond.monitor_interval();
            if interval > 0 {
                min_interval = min_interval.min(interval);
            }
        }
        self.min_monitor_interval.store(min_interval, Ordering::Relaxed);
        min_interval
    }

    /// Smallest monitor interval seen at the last tick.
    pub fn min_monitor_interval(&self) -> u32 {
        self.min_monitor_interval.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.bonds)
        };
        tracing::info!(bonds = dropped.len(), "bond registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::StaticInterfaces;
    use crate::link::LinkMode;
    use crate::transport::{NullTransport, Path};

    fn registry() -> BondRegistry {
        let resolver = StaticInterfaces::new().with(1, "eth0").with(2, "wlan0");
        BondRegistry::new(PeerIdentity(1), Arc::new(resolver), Arc::new(NullTransport))
    }

    fn template(alias: &str, policy: BondingPolicy) -> PolicyTemplate {
        PolicyTemplate::new(alias, BondParameters::for_policy(policy))
    }

    #[test]
    fn test_link_directory_lazy_spares() {
        let registry = registry();
        let links = registry.links();
        let link = links.link_for_socket("office", 1).unwrap();
        assert_eq!(link.interface_name(), "eth0");
        assert_eq!(link.mode(), LinkMode::Spare);
        assert!(!link.is_user_specified());
        assert!(Arc::ptr_eq(&link, &links.link_for_socket("office", 1).unwrap()));
        assert!(links.link_for_socket("office", 7).is_none());
        assert_eq!(links.preferences("office"), UserPreferences::default());
    }

    #[test]
    fn test_declared_links_restrict_policy() {
        let registry = registry();
        let links = registry.links();
        assert!(links.link_allowed("office", &Link::implicit("wlan0")));

        links.add_link("office", Link::new("eth0", LinkMode::Primary).with_speed(100));
        assert!(links.link_allowed("office", &Link::implicit("eth0")));
        assert!(!links.link_allowed("office", &Link::implicit("wlan0")));
        assert!(links.link_allowed("other", &Link::implicit("wlan0")));

        let prefs = links.preferences("office");
        assert!(prefs.links && prefs.primary && prefs.speeds);
        assert!(!prefs.failover);
        assert_eq!(links.user_specified_links("office").len(), 1);
    }

    #[test]
    fn test_user_link_replaces_implicit() {
        let registry = registry();
        let links = registry.links();
        links.link_for_socket("office", 1);
        links.add_link("office", Link::new("eth0", LinkMode::Primary));
        let link = links.link_by_name("office", "eth0").unwrap();
        assert!(link.is_user_specified());
        assert!(link.is_primary());
    }

    #[test]
    fn test_template_registration() {
        let registry = registry();
        assert!(registry.add_policy_template(template("fast", BondingPolicy::BalanceAware)));
        assert!(!registry.add_policy_template(template("fast", BondingPolicy::BalanceXor)));
        assert!(!registry.add_policy_template(template("balance-rr", BondingPolicy::BalanceRr)));
        assert!(registry.has_template("fast"));
    }

    #[test]
    fn test_assignment_is_first_wins() {
        let registry = registry();
        registry.add_policy_template(template("a", BondingPolicy::BalanceXor));
        registry.add_policy_template(template("b", BondingPolicy::BalanceRr));
        assert!(registry.assign_policy_to_peer(PeerIdentity(5), "a"));
        assert!(!registry.assign_policy_to_peer(PeerIdentity(5), "b"));
        let bond = registry.get_or_create_bond(PeerInfo::root(5)).unwrap();
        assert_eq!(bond.policy_alias(), "a");
    }

    #[test]
    fn test_bond_resolution_order() {
        let registry = registry();
        assert!(registry.get_or_create_bond(PeerInfo::root(9)).is_none());

        registry.add_policy_template(template("tmpl", BondingPolicy::BalanceAware));
        registry.set_default_template("tmpl");
        let b = registry.get_or_create_bond(PeerInfo::root(10)).unwrap();
        assert_eq!(b.policy(), BondingPolicy::BalanceAware);

        registry.set_default_policy(BondingPolicy::ActiveBackup);
        let c = registry.get_or_create_bond(PeerInfo::root(11)).unwrap();
        assert_eq!(c.policy(), BondingPolicy::ActiveBackup);
        assert_eq!(c.policy_alias(), "active-backup");

        registry.add_policy_template(template("special", BondingPolicy::BalanceRr));
        registry.assign_policy_to_peer(PeerIdentity(12), "special");
        let d = registry.get_or_create_bond(PeerInfo::root(12)).unwrap();
        assert_eq!(d.policy(), BondingPolicy::BalanceRr);

        // existing bonds are returned as-is
        let again = registry.get_or_create_bond(PeerInfo::root(10)).unwrap();
        assert!(Arc::ptr_eq(&b, &again));
    }

    #[test]
    fn test_bond_copies_link_preferences() {
        let registry = registry();
        registry.add_policy_template(template("office", BondingPolicy::ActiveBackup));
        registry.set_default_template("office");
        registry
            .links()
            .add_link("office", Link::new("eth0", LinkMode::Primary).with_failover_target("wlan0"));
        let bond = registry.get_or_create_bond(PeerInfo::leaf(3)).unwrap();
        let prefs = bond.user_preferences();
        assert!(prefs.links && prefs.primary && prefs.failover);
        assert!(!prefs.speeds);
    }

    #[test]
    fn test_tick_tracks_min_monitor_interval() {
        let registry = registry();
        assert_eq!(registry.tick(0), FAILOVER_DEFAULT_INTERVAL);

        registry.set_default_policy(BondingPolicy::ActiveBackup);
        let bond = registry.get_or_create_bond(PeerInfo::root(2)).unwrap();
        bond.set_failover_interval(1000);
        registry.get_or_create_bond(PeerInfo::root(3));
        assert_eq!(registry.tick(100), 250);
        assert_eq!(registry.min_monitor_interval(), 250);
    }

    #[test]
    fn test_tick_uses_link_monitor_interval() {
        let registry = registry();
        registry.add_policy_template(template("office", BondingPolicy::ActiveBackup));
        registry.set_default_template("office");
        registry
            .links()
            .add_link("office", Link::new("eth0", LinkMode::Primary).with_monitor_interval(100));
        let bond = registry.get_or_create_bond(PeerInfo::leaf(2)).unwrap();
        bond.nominate_path(&Path::shared(1, "192.0.2.1:9993".parse().unwrap(), 0), 0);

        assert_eq!(registry.tick(10), 100);
        assert_eq!(registry.min_monitor_interval(), 100);
    }

    #[test]
    fn test_remove_and_shutdown() {
        let registry = registry();
        registry.set_default_policy(BondingPolicy::BalanceXor);
        registry.get_or_create_bond(PeerInfo::root(2));
        registry.get_or_create_bond(PeerInfo::root(3));
        assert!(registry.remove_bond(PeerIdentity(2)).is_some());
        assert!(registry.remove_bond(PeerIdentity(2)).is_none());
        assert_eq!(registry.bonds().len(), 1);
        registry.shutdown();
        assert!(registry.bonds().is_empty());
        assert!(registry.bond(PeerIdentity(3)).is_none());
    }

    #[test]
    fn test_apply_config() {
        let cfg = BondingConfig::from_toml_str(
            r#"
default_policy = "balance-xor"

[[policy]]
alias = "office"
base = "active-backup"

[[policy.link]]
interface = "eth0"
mode = "primary"

[peers]
"0a" = "office"
"#,
        )
        .unwrap();
        let resolver = StaticInterfaces::new().with(1, "eth0");
        let registry =
            BondRegistry::from_config(PeerIdentity(1), Arc::new(resolver), Arc::new(NullTransport), &cfg)
                .unwrap();
        assert_eq!(registry.default_policy(), BondingPolicy::BalanceXor);
        let office = registry.get_or_create_bond(PeerInfo::root(0x0a)).unwrap();
        assert_eq!(office.policy(), BondingPolicy::ActiveBackup);
        assert!(office.user_preferences().primary);
        let other = registry.get_or_create_bond(PeerInfo::root(0x0b)).unwrap();
        assert_eq!(other.policy(), BondingPolicy::BalanceXor);

        // applying the same policies twice is a duplicate
        assert!(matches!(
            registry.apply_config(&cfg),
            Err(ConfigError::DuplicateAlias(_))
        ));
    }

    #[test]
    fn test_apply_config_unknown_assignment() {
        let mut cfg = BondingConfig::default();
        cfg.peers.insert("0a".into(), "missing".into());
        assert!(matches!(
            registry().apply_config(&cfg),
            Err(ConfigError::UnknownPolicy(_))
        ));
    }
}
