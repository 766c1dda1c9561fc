//! Container-local packet forwarding between ingress and egress VLANs.
//!
//! Each ingress/egress pair gets three iptables rules (NAT masquerade plus two
//! FORWARD accepts) installed and removed as a group.

use crate::error::{Result, VifError};
use crate::types::VirtualInterface;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Container interface carrying a VLAN.
pub fn container_interface_for(vlan_id: u16) -> String {
    format!("eth0.{}", vlan_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }
}

/// A single packet-filter rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterRule {
    /// NAT traffic from `subnet` leaving through `egress`.
    Masquerade { subnet: String, egress: String },
    /// Accept new traffic from `ingress` to `egress`.
    ForwardAccept { ingress: String, egress: String },
    /// Accept return traffic from `egress` back to `ingress`.
    ForwardEstablished { ingress: String, egress: String },
    /// Redirect DNS arriving on `interface` to a local port.
    DnsRedirect { interface: String, protocol: Protocol, to_port: u16 },
}

impl FilterRule {
    /// iptables arguments with `op` (`-A` or `-D`) in the chain position.
    pub fn iptables_args(&self, op: &str) -> Vec<String> {
        let args: Vec<&str> = match self {
            FilterRule::Masquerade { subnet, egress } => {
                vec!["-t", "nat", op, "POSTROUTING", "-s", subnet, "-o", egress, "-j", "MASQUERADE"]
            }
            FilterRule::ForwardAccept { ingress, egress } => {
                vec![op, "FORWARD", "-i", ingress, "-o", egress, "-j", "ACCEPT"]
            }
            FilterRule::ForwardEstablished { ingress, egress } => vec![
                op,
                "FORWARD",
                "-i",
                egress,
                "-o",
                ingress,
                "-m",
                "state",
                "--state",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
            FilterRule::DnsRedirect { interface, protocol, to_port } => {
                let port = to_port.to_string();
                return [
                    "-t",
                    "nat",
                    op,
                    "PREROUTING",
                    "-i",
                    interface,
                    "-p",
                    protocol.as_str(),
                    "--dport",
                    "53",
                    "-j",
                    "REDIRECT",
                    "--to-port",
                    &port,
                ]
                .iter()
                .map(|s| s.to_string())
                .collect();
            }
        };
        args.into_iter().map(String::from).collect()
    }
}

impl std::fmt::Display for FilterRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterRule::Masquerade { subnet, egress } => write!(f, "masquerade {} via {}", subnet, egress),
            FilterRule::ForwardAccept { ingress, egress } => write!(f, "forward {} -> {}", ingress, egress),
            FilterRule::ForwardEstablished { ingress, egress } => {
                write!(f, "forward established {} -> {}", egress, ingress)
            }
            FilterRule::DnsRedirect { interface, protocol, to_port } => {
                write!(f, "dns redirect {}/{} -> {}", interface, protocol.as_str(), to_port)
            }
        }
    }
}

/// Local packet filter.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    async fn append(&self, rule: &FilterRule) -> Result<()>;
    async fn delete(&self, rule: &FilterRule) -> Result<()>;
}

/// Packet filter driving the `iptables` binary.
#[derive(Debug, Clone)]
pub struct IptablesFilter {
    binary: String,
}

impl IptablesFilter {
    pub fn new() -> Self {
        Self { binary: "iptables".to_string() }
    }

    async fn run(&self, rule: &FilterRule, op: &str) -> Result<()> {
        let args = rule.iptables_args(op);
        let output = Command::new(&self.binary).args(&args).output().await.map_err(|e| {
            VifError::PacketFilterFailed { rule: rule.to_string(), reason: e.to_string() }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(args = ?args, stderr = %stderr, "iptables command failed");
            return Err(VifError::PacketFilterFailed { rule: rule.to_string(), reason: stderr });
        }
        Ok(())
    }
}

impl Default for IptablesFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PacketFilter for IptablesFilter {
    async fn append(&self, rule: &FilterRule) -> Result<()> {
        self.run(rule, "-A").await
    }

    async fn delete(&self, rule: &FilterRule) -> Result<()> {
        self.run(rule, "-D").await
    }
}

/// Ingress/egress pairing to forward between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRoutingConfig {
    pub ingress_vlan: u16,
    pub egress_vlan: u16,
    pub ingress_interface: String,
    pub egress_interface: String,
    pub ingress_subnet: String,
}

impl ServiceRoutingConfig {
    /// Config using the default container interface naming.
    pub fn for_vlans(ingress_vlan: u16, egress_vlan: u16) -> Self {
        Self {
            ingress_vlan,
            egress_vlan,
            ingress_interface: container_interface_for(ingress_vlan),
            egress_interface: container_interface_for(egress_vlan),
            ingress_subnet: VirtualInterface::subnet_for(ingress_vlan),
        }
    }

    pub fn key(&self) -> String {
        rule_key(self.ingress_vlan, self.egress_vlan)
    }
}

fn rule_key(ingress_vlan: u16, egress_vlan: u16) -> String {
    format!("{}:{}", ingress_vlan, egress_vlan)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    pub ingress_interface: String,
    pub egress_interface: String,
    pub ingress_subnet: String,
    /// False while the rule group is still being installed
    pub active: bool,
}

impl ForwardingRule {
    /// The group, in installation order.
    fn filter_rules(&self) -> [FilterRule; 3] {
        [
            FilterRule::Masquerade {
                subnet: self.ingress_subnet.clone(),
                egress: self.egress_interface.clone(),
            },
            FilterRule::ForwardAccept {
                ingress: self.ingress_interface.clone(),
                egress: self.egress_interface.clone(),
            },
            FilterRule::ForwardEstablished {
                ingress: self.ingress_interface.clone(),
                egress: self.egress_interface.clone(),
            },
        ]
    }
}

#[derive(Default)]
struct Registry {
    rules: HashMap<String, ForwardingRule>,
    /// Ingress interface -> redirect port
    dns_redirects: HashMap<String, u16>,
}

/// Drops a half-installed entry unless setup completed.
struct PendingRule<'a> {
    registry: &'a RwLock<Registry>,
    key: String,
    committed: bool,
}

impl Drop for PendingRule<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            if registry.rules.get(&self.key).is_some_and(|r| !r.active) {
                registry.rules.remove(&self.key);
            }
        }
    }
}

/// Manages forwarding rule groups inside the container.
pub struct ContainerNetworkManager {
    filter: std::sync::Arc<dyn PacketFilter>,
    registry: RwLock<Registry>,
}

impl ContainerNetworkManager {
    pub fn new(filter: std::sync::Arc<dyn PacketFilter>) -> Self {
        Self { filter, registry: RwLock::new(Registry::default()) }
    }

    fn registry(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_gauge(registry: &Registry) {
        let active = registry.rules.values().filter(|r| r.active).count();
        metrics::gauge!("nnc_forwarding_rules_active").set(active as f64);
    }

    /// Install the NAT + FORWARD group for a VLAN pair.
    ///
    /// A failure removes whatever was already installed, in reverse order,
    /// and leaves the pair unregistered.
    #[instrument(skip(self), fields(key = %config.key()))]
    pub async fn setup_service_routing(&self, config: &ServiceRoutingConfig) -> Result<()> {
        let key = config.key();
        let rule = ForwardingRule {
            ingress_interface: config.ingress_interface.clone(),
            egress_interface: config.egress_interface.clone(),
            ingress_subnet: config.ingress_subnet.clone(),
            active: false,
        };

        {
            let mut registry = self.registry();
            if registry.rules.contains_key(&key) {
                return Err(VifError::ForwardingRuleExists { key });
            }
            registry.rules.insert(key.clone(), rule.clone());
        }
        let mut pending = PendingRule { registry: &self.registry, key: key.clone(), committed: false };

        let group = rule.filter_rules();
        for (installed, filter_rule) in group.iter().enumerate() {
            if let Err(e) = self.filter.append(filter_rule).await {
                warn!(error = %e, rule = %filter_rule, "Rule install failed, rolling back");
                for done in group[..installed].iter().rev() {
                    if let Err(undo) = self.filter.delete(done).await {
                        warn!(error = %undo, rule = %done, "Rollback of rule failed");
                    }
                }
                return Err(e);
            }
        }

        {
            let mut registry = self.registry();
            if let Some(entry) = registry.rules.get_mut(&key) {
                entry.active = true;
            }
            pending.committed = true;
            Self::update_gauge(&registry);
        }

        info!(
            ingress = %config.ingress_interface,
            egress = %config.egress_interface,
            "Service routing configured"
        );
        Ok(())
    }

    /// Remove the rule group for a VLAN pair.
    #[instrument(skip(self))]
    pub async fn remove_service_routing(&self, ingress_vlan: u16, egress_vlan: u16) -> Result<()> {
        let key = rule_key(ingress_vlan, egress_vlan);
        let rule = {
            let mut registry = self.registry();
            match registry.rules.get(&key) {
                Some(r) if r.active => {}
                _ => return Err(VifError::ForwardingRuleNotFound { key }),
            }
            let rule = registry.rules.remove(&key);
            Self::update_gauge(&registry);
            rule
        };

        if let Some(rule) = rule {
            self.delete_group(&rule).await;
        }
        info!("Service routing removed");
        Ok(())
    }

    /// Remove every rule group whose ingress is `ingress_interface`, plus its
    /// DNS redirect. Works without knowing the egress side.
    #[instrument(skip(self))]
    pub async fn teardown_service_routing(&self, ingress_interface: &str) -> Result<()> {
        let (rules, dns_port) = {
            let mut registry = self.registry();
            let keys: Vec<String> = registry
                .rules
                .iter()
                .filter(|(_, r)| r.active && r.ingress_interface == ingress_interface)
                .map(|(k, _)| k.clone())
                .collect();
            let rules: Vec<ForwardingRule> =
                keys.iter().filter_map(|k| registry.rules.remove(k)).collect();
            let dns_port = registry.dns_redirects.remove(ingress_interface);
            Self::update_gauge(&registry);
            (rules, dns_port)
        };

        for rule in &rules {
            self.delete_group(rule).await;
        }

        if let Some(port) = dns_port {
            self.delete_dns_redirect(ingress_interface, port).await;
        }

        info!(groups = rules.len(), dns = dns_port.is_some(), "Service routing torn down");
        Ok(())
    }

    /// Redirect UDP and TCP port 53 on an ingress interface to a local port.
    ///
    /// An interface has at most one redirect. Repeating the same port is a
    /// no-op; a different port is rejected with `ForwardingRuleExists`.
    #[instrument(skip(self))]
    pub async fn setup_dns_redirect(&self, ingress_interface: &str, dns_port: u16) -> Result<()> {
        {
            let mut registry = self.registry();
            match registry.dns_redirects.get(ingress_interface) {
                Some(&port) if port == dns_port => {
                    debug!("DNS redirect already configured");
                    return Ok(());
                }
                Some(_) => {
                    return Err(VifError::ForwardingRuleExists { key: format!("dns:{}", ingress_interface) });
                }
                None => {
                    registry.dns_redirects.insert(ingress_interface.to_string(), dns_port);
                }
            }
        }

        if let Err(e) = self.install_dns_redirect(ingress_interface, dns_port).await {
            self.registry().dns_redirects.remove(ingress_interface);
            return Err(e);
        }
        info!("DNS redirect configured");
        Ok(())
    }

    async fn install_dns_redirect(&self, ingress_interface: &str, dns_port: u16) -> Result<()> {
        let udp = FilterRule::DnsRedirect {
            interface: ingress_interface.to_string(),
            protocol: Protocol::Udp,
            to_port: dns_port,
        };
        let tcp = FilterRule::DnsRedirect {
            interface: ingress_interface.to_string(),
            protocol: Protocol::Tcp,
            to_port: dns_port,
        };

        self.filter.append(&udp).await?;
        if let Err(e) = self.filter.append(&tcp).await {
            if let Err(undo) = self.filter.delete(&udp).await {
                warn!(error = %undo, "Rollback of UDP DNS redirect failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove every managed rule group and DNS redirect.
    #[instrument(skip(self))]
    pub async fn remove_all_routing(&self) {
        let (rules, redirects) = {
            let mut registry = self.registry();
            let rules: Vec<ForwardingRule> =
                registry.rules.drain().map(|(_, r)| r).filter(|r| r.active).collect();
            let redirects: Vec<(String, u16)> = registry.dns_redirects.drain().collect();
            Self::update_gauge(&registry);
            (rules, redirects)
        };

        for rule in &rules {
            self.delete_group(rule).await;
        }
        for (iface, port) in redirects {
            self.delete_dns_redirect(&iface, port).await;
        }
        info!(groups = rules.len(), "All service routing removed");
    }

    /// Snapshot of the active rule groups.
    pub fn list_rules(&self) -> Vec<ForwardingRule> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rules
            .values()
            .filter(|r| r.active)
            .cloned()
            .collect()
    }

    async fn delete_group(&self, rule: &ForwardingRule) {
        for filter_rule in rule.filter_rules().iter().rev() {
            if let Err(e) = self.filter.delete(filter_rule).await {
                debug!(error = %e, rule = %filter_rule, "Rule already absent or delete failed");
            }
        }
    }

    async fn delete_dns_redirect(&self, interface: &str, port: u16) {
        for protocol in [Protocol::Udp, Protocol::Tcp] {
            let rule = FilterRule::DnsRedirect { interface: interface.to_string(), protocol, to_port: port };
            if let Err(e) = self.filter.delete(&rule).await {
                debug!(error = %e, rule = %rule, "DNS redirect delete failed");
            }
        }
    }
}
