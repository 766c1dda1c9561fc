//! SOCKS5-to-TUN gateway management.
//!
//! Services that only expose a SOCKS5 endpoint get a supervised
//! `hev-socks5-tunnel` process that turns the proxy into a TUN device.
//! Gateway state is in-memory only and does not survive a restart.

use crate::config::VifConfig;
use crate::error::{Result, VifError};
use crate::network::link::{wait_for_link, LinkProbe};
use crate::network::supervisor::{ManagedProcess, ProcessState, ProcessSupervisor, TunHealthProbe};
use crate::paths::PathResolver;
use crate::types::{
    FeatureManifest, GatewayStatus, InstanceNetworkConfig, ServiceInstance, ServiceMode,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, instrument, warn};

/// Linux interface names are limited to 15 bytes.
pub const MAX_IFNAME_LEN: usize = 15;

/// Services that expose a SOCKS5 client endpoint.
const SOCKS5_SERVICES: &[&str] = &["tor", "singbox", "xray", "psiphon"];

/// DNS servers never need a tunnel.
const DNS_SERVICES: &[&str] = &["adguard", "pihole"];

const UDP_SERVICES: &[&str] = &["singbox", "xray", "psiphon"];

/// Whether a service instance needs a SOCKS5-to-TUN gateway.
pub fn needs_gateway(manifest: &FeatureManifest, mode: &ServiceMode) -> bool {
    if manifest.is_host_network() {
        return false;
    }
    if matches!(mode, ServiceMode::Server | ServiceMode::Inbound | ServiceMode::Tun) {
        return false;
    }
    if DNS_SERVICES.contains(&manifest.id.as_str()) {
        return false;
    }
    SOCKS5_SERVICES.contains(&manifest.id.as_str())
}

/// Whether the service's SOCKS5 endpoint relays UDP.
pub fn supports_udp(service_id: &str) -> bool {
    UDP_SERVICES.contains(&service_id)
}

fn service_abbrev(service_id: &str) -> String {
    match service_id {
        "tor" => "tor".to_string(),
        "singbox" => "sb".to_string(),
        "xray" => "xr".to_string(),
        "psiphon" => "psi".to_string(),
        other => other.chars().take(4).collect(),
    }
}

/// Deterministic TUN device name, `tun-{abbrev}-{instance}` capped at 15 chars.
pub fn generate_tun_name(service_id: &str, instance_id: &str) -> String {
    format!("tun-{}-{}", service_abbrev(service_id), instance_id)
        .chars()
        .take(MAX_IFNAME_LEN)
        .collect()
}

/// hev-socks5-tunnel configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayConfig {
    pub tunnel: TunnelSection,
    pub socks5: Socks5Section,
    pub misc: MiscSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelSection {
    pub name: String,
    pub mtu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Socks5Section {
    pub address: String,
    pub port: u16,
    /// `"udp"` when the upstream relays UDP; the key is absent otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MiscSection {
    #[serde(rename = "log-level")]
    pub log_level: String,
}

impl GatewayConfig {
    /// Build the config for an instance. Fails if no SOCKS5 endpoint resolves.
    pub fn for_instance(
        instance: &ServiceInstance,
        manifest: &FeatureManifest,
        network: &InstanceNetworkConfig,
        mtu: u32,
    ) -> Result<Self> {
        let socks = network.socks.as_ref().ok_or_else(|| VifError::InvalidGatewayConfig {
            instance_id: instance.id.clone(),
            reason: "no SOCKS5 endpoint (socks_address/vlan_ip + socks_port) in instance config"
                .to_string(),
        })?;

        Ok(Self {
            tunnel: TunnelSection { name: generate_tun_name(&manifest.id, &instance.id), mtu },
            socks5: Socks5Section {
                address: socks.address.clone(),
                port: socks.port,
                udp: supports_udp(&manifest.id).then(|| "udp".to_string()),
            },
            misc: MiscSection { log_level: "warn".to_string() },
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| VifError::Internal(format!("gateway yaml: {}", e)))
    }
}

/// A running gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInstance {
    pub instance_id: String,
    pub tun_name: String,
    pub config_path: PathBuf,
    /// Supervisor process ID, `gw-{instance_id}`
    pub process_id: String,
    pub socks_addr: String,
    pub socks_port: u16,
    pub udp_enabled: bool,
    pub start_time: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStatusReport {
    pub state: GatewayStatus,
    pub tun_name: Option<String>,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
    pub error_message: Option<String>,
}

impl GatewayStatusReport {
    fn stopped() -> Self {
        Self { state: GatewayStatus::Stopped, tun_name: None, pid: None, uptime: None, error_message: None }
    }
}

/// Timing and binary settings for gateways.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub binary: String,
    pub mtu: u32,
    pub ready_timeout: Duration,
    pub removal_timeout: Duration,
    pub poll_interval: Duration,
}

impl GatewaySettings {
    pub fn from_config(config: &VifConfig) -> Self {
        Self {
            binary: config.gateway_binary.clone(),
            mtu: config.tun_mtu,
            ready_timeout: config.tun_ready_timeout(),
            removal_timeout: config.tun_removal_timeout(),
            poll_interval: config.tun_poll_interval(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&VifConfig::default())
    }
}

enum GatewaySlot {
    /// Start in flight; blocks a second start for the same instance.
    Starting,
    Running(GatewayInstance),
}

type SlotMap = HashMap<String, GatewaySlot>;

/// Removes a `Starting` slot unless the start completed.
struct StartReservation<'a> {
    slots: &'a RwLock<SlotMap>,
    instance_id: String,
    committed: bool,
}

impl Drop for StartReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            if matches!(slots.get(&self.instance_id), Some(GatewaySlot::Starting)) {
                slots.remove(&self.instance_id);
            }
        }
    }
}

/// Starts and stops per-instance gateways.
pub struct GatewayManager {
    supervisor: Arc<dyn ProcessSupervisor>,
    links: Arc<dyn LinkProbe>,
    paths: Arc<dyn PathResolver>,
    settings: GatewaySettings,
    slots: RwLock<SlotMap>,
}

impl GatewayManager {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        links: Arc<dyn LinkProbe>,
        paths: Arc<dyn PathResolver>,
        settings: GatewaySettings,
    ) -> Self {
        Self { supervisor, links, paths, settings, slots: RwLock::new(HashMap::new()) }
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, SlotMap> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, SlotMap> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve(&self, instance_id: &str) -> Result<StartReservation<'_>> {
        let mut slots = self.write_slots();
        if slots.contains_key(instance_id) {
            return Err(VifError::GatewayAlreadyExists { instance_id: instance_id.to_string() });
        }
        slots.insert(instance_id.to_string(), GatewaySlot::Starting);
        Ok(StartReservation { slots: &self.slots, instance_id: instance_id.to_string(), committed: false })
    }

    fn running_count(slots: &SlotMap) -> usize {
        slots.values().filter(|s| matches!(s, GatewaySlot::Running(_))).count()
    }

    /// Path of the generated config for an instance.
    pub fn config_path_for(&self, instance_id: &str) -> PathBuf {
        self.paths.config_path("gateways").join(format!("{}.yaml", instance_id))
    }

    /// Start a gateway for an instance.
    ///
    /// Returns `Ok(None)` when the service does not need one. On any failure
    /// after the process was registered it is stopped and deregistered again.
    #[instrument(skip(self, instance, manifest), fields(instance_id = %instance.id, feature = %manifest.id))]
    pub async fn start_gateway(
        &self,
        instance: &ServiceInstance,
        manifest: &FeatureManifest,
    ) -> Result<Option<GatewayInstance>> {
        let mut reservation = self.reserve(&instance.id)?;

        let network = InstanceNetworkConfig::from_instance(instance).map_err(|reason| {
            VifError::InvalidGatewayConfig { instance_id: instance.id.clone(), reason }
        })?;

        if !needs_gateway(manifest, &network.mode) {
            debug!("Gateway not needed");
            return Ok(None);
        }

        let config = GatewayConfig::for_instance(instance, manifest, &network, self.settings.mtu)?;
        let tun_name = config.tunnel.name.clone();
        let config_path = self.config_path_for(&instance.id);

        write_config(&config_path, &config).await?;

        let process_id = format!("gw-{}", instance.id);
        let process = ManagedProcess {
            id: process_id.clone(),
            name: format!("Gateway-{} ({})", manifest.id, instance.id),
            command: self.settings.binary.clone(),
            args: vec![config_path.to_string_lossy().to_string()],
            auto_restart: true,
            health_probe: Some(Arc::new(TunHealthProbe::new(&tun_name, self.links.clone()))),
        };

        if let Err(e) = self.launch(&process, &tun_name).await {
            metrics::counter!("nnc_gateway_start_failures_total").increment(1);
            remove_config(&config_path).await;
            return Err(e);
        }

        let gateway = GatewayInstance {
            instance_id: instance.id.clone(),
            tun_name: tun_name.clone(),
            config_path,
            process_id,
            socks_addr: config.socks5.address.clone(),
            socks_port: config.socks5.port,
            udp_enabled: config.socks5.udp.is_some(),
            start_time: SystemTime::now(),
        };

        {
            let mut slots = self.write_slots();
            slots.insert(instance.id.clone(), GatewaySlot::Running(gateway.clone()));
            reservation.committed = true;
            metrics::gauge!("nnc_gateway_running").set(Self::running_count(&slots) as f64);
        }
        metrics::counter!("nnc_gateway_started_total").increment(1);

        info!(
            tun_name = %tun_name,
            socks_addr = %gateway.socks_addr,
            socks_port = gateway.socks_port,
            udp = gateway.udp_enabled,
            "Gateway started"
        );

        Ok(Some(gateway))
    }

    /// Register, start and wait for the TUN device; undo on failure.
    async fn launch(&self, process: &ManagedProcess, tun_name: &str) -> Result<()> {
        let instance_id = process.id.trim_start_matches("gw-").to_string();

        self.supervisor.add(process.clone()).await.map_err(|e| VifError::GatewayStartFailed {
            instance_id: instance_id.clone(),
            reason: format!("supervisor add: {}", e),
        })?;

        if let Err(e) = self.supervisor.start(&process.id).await {
            if let Err(remove_err) = self.supervisor.remove(&process.id).await {
                warn!(error = %remove_err, "Failed to deregister gateway process");
            }
            return Err(VifError::GatewayStartFailed {
                instance_id,
                reason: format!("process start: {}", e),
            });
        }

        if let Err(e) = wait_for_link(
            self.links.as_ref(),
            tun_name,
            true,
            self.settings.poll_interval,
            self.settings.ready_timeout,
        )
        .await
        {
            warn!(tun_name = %tun_name, "TUN interface did not appear, stopping gateway");
            if let Err(stop_err) = self.supervisor.stop(&process.id).await {
                warn!(error = %stop_err, "Failed to stop gateway process");
            }
            if let Err(remove_err) = self.supervisor.remove(&process.id).await {
                warn!(error = %remove_err, "Failed to deregister gateway process");
            }
            return Err(e);
        }

        Ok(())
    }

    /// Stop an instance's gateway. No-op if none is running.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn stop_gateway(&self, instance_id: &str) -> Result<()> {
        let gateway = match self.read_slots().get(instance_id) {
            Some(GatewaySlot::Running(gw)) => gw.clone(),
            Some(GatewaySlot::Starting) => {
                debug!("Gateway start in flight, nothing to stop yet");
                return Ok(());
            }
            None => {
                debug!("No gateway for instance");
                return Ok(());
            }
        };

        if let Err(e) = self.supervisor.stop(&gateway.process_id).await {
            warn!(error = %e, process_id = %gateway.process_id, "Failed to stop gateway process");
        }

        if let Err(e) = wait_for_link(
            self.links.as_ref(),
            &gateway.tun_name,
            false,
            self.settings.poll_interval,
            self.settings.removal_timeout,
        )
        .await
        {
            warn!(error = %e, tun_name = %gateway.tun_name, "TUN interface still present after stop");
        }

        if let Err(e) = self.supervisor.remove(&gateway.process_id).await {
            warn!(error = %e, process_id = %gateway.process_id, "Failed to deregister gateway process");
        }

        remove_config(&gateway.config_path).await;

        {
            let mut slots = self.write_slots();
            slots.remove(instance_id);
            metrics::gauge!("nnc_gateway_running").set(Self::running_count(&slots) as f64);
        }

        info!(tun_name = %gateway.tun_name, "Gateway stopped");
        Ok(())
    }

    /// Map supervisor state onto the gateway status.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn get_status(&self, instance_id: &str) -> GatewayStatusReport {
        let gateway = match self.read_slots().get(instance_id) {
            Some(GatewaySlot::Running(gw)) => gw.clone(),
            _ => return GatewayStatusReport::stopped(),
        };

        let uptime = SystemTime::now().duration_since(gateway.start_time).ok();
        let mut report = GatewayStatusReport {
            state: GatewayStatus::Running,
            tun_name: Some(gateway.tun_name.clone()),
            pid: None,
            uptime,
            error_message: None,
        };

        match self.supervisor.get(&gateway.process_id).await {
            None => {
                report.state = GatewayStatus::Error;
                report.error_message = Some("process not found in supervisor".to_string());
            }
            Some(info) => {
                report.pid = info.pid;
                match info.state {
                    ProcessState::Running | ProcessState::Starting => {}
                    ProcessState::Crashed => {
                        report.state = GatewayStatus::Error;
                        report.error_message = Some("gateway process crashed".to_string());
                    }
                    ProcessState::Registered | ProcessState::Stopping | ProcessState::Stopped => {
                        report.state = GatewayStatus::Stopped;
                    }
                }
            }
        }

        report
    }

    pub fn has_gateway(&self, instance_id: &str) -> bool {
        matches!(self.read_slots().get(instance_id), Some(GatewaySlot::Running(_)))
    }

    pub fn list_gateways(&self) -> Vec<GatewayInstance> {
        self.read_slots()
            .values()
            .filter_map(|slot| match slot {
                GatewaySlot::Running(gw) => Some(gw.clone()),
                GatewaySlot::Starting => None,
            })
            .collect()
    }
}

async fn write_config(path: &Path, config: &GatewayConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VifError::IoError { path: parent.to_path_buf(), source: e })?;
    }
    let yaml = config.to_yaml()?;
    tokio::fs::write(path, yaml)
        .await
        .map_err(|e| VifError::IoError { path: path.to_path_buf(), source: e })
}

async fn remove_config(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, path = %path.display(), "Failed to remove gateway config"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::DefaultPathResolver;
    use crate::testing::{FakeLinkTable, ScriptedSupervisor};
    use serde_json::json;

    struct Harness {
        manager: GatewayManager,
        supervisor: Arc<ScriptedSupervisor>,
        links: Arc<FakeLinkTable>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(ScriptedSupervisor::new());
        let links = Arc::new(FakeLinkTable::new());
        supervisor.bring_up_links(links.clone());
        let manager = GatewayManager::new(
            supervisor.clone(),
            links.clone(),
            Arc::new(DefaultPathResolver::with_base(dir.path())),
            GatewaySettings::default(),
        );
        Harness { manager, supervisor, links, _dir: dir }
    }

    fn tor_instance(id: &str) -> ServiceInstance {
        ServiceInstance::new(id, "router-1", "tor", id)
            .with_config("vlan_ip", json!("10.99.101.1"))
            .with_config("socks_port", json!(9050))
    }

    #[test]
    fn test_generate_tun_name() {
        assert_eq!(generate_tun_name("tor", "usa"), "tun-tor-usa");
        assert_eq!(generate_tun_name("singbox", "sg-01"), "tun-sb-sg-01");
        assert_eq!(generate_tun_name("xray", "hk"), "tun-xr-hk");
        assert_eq!(generate_tun_name("psiphon", "ca"), "tun-psi-ca");
        assert_eq!(generate_tun_name("wireguard", "x"), "tun-wire-x");
    }

    #[test]
    fn test_tun_name_is_capped() {
        let name = generate_tun_name("singbox", "a-very-long-instance-identifier");
        assert_eq!(name.len(), MAX_IFNAME_LEN);
        assert_eq!(name, "tun-sb-a-very-l");
        assert!(generate_tun_name("tor", "myinstance").len() <= MAX_IFNAME_LEN);
    }

    #[test]
    fn test_needs_gateway() {
        let tor = FeatureManifest::new("tor");
        assert!(needs_gateway(&tor, &ServiceMode::Client));
        assert!(needs_gateway(&tor, &ServiceMode::Unspecified));
        assert!(!needs_gateway(&tor, &ServiceMode::Server));
        assert!(!needs_gateway(&tor, &ServiceMode::Inbound));
        assert!(!needs_gateway(&tor, &ServiceMode::Tun));

        let host = FeatureManifest { network_mode: "host".into(), ..FeatureManifest::new("xray") };
        assert!(!needs_gateway(&host, &ServiceMode::Client));

        for dns in ["adguard", "pihole"] {
            assert!(!needs_gateway(&FeatureManifest::new(dns), &ServiceMode::Client));
        }
        assert!(!needs_gateway(&FeatureManifest::new("wireguard"), &ServiceMode::Client));
        for socks in ["singbox", "xray", "psiphon"] {
            assert!(needs_gateway(&FeatureManifest::new(socks), &ServiceMode::Client));
        }
    }

    #[test]
    fn test_supports_udp() {
        assert!(supports_udp("singbox"));
        assert!(supports_udp("xray"));
        assert!(supports_udp("psiphon"));
        assert!(!supports_udp("tor"));
        assert!(!supports_udp("adguard"));
    }

    #[test]
    fn test_config_yaml_omits_udp_when_unsupported() {
        let instance = tor_instance("usa");
        let network = InstanceNetworkConfig::from_instance(&instance).unwrap();
        let config =
            GatewayConfig::for_instance(&instance, &FeatureManifest::new("tor"), &network, 8500)
                .unwrap();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("name: tun-tor-usa"));
        assert!(yaml.contains("mtu: 8500"));
        assert!(yaml.contains("address: 10.99.101.1"));
        assert!(yaml.contains("port: 9050"));
        assert!(yaml.contains("log-level: warn"));
        assert!(!yaml.contains("udp"));
    }

    #[test]
    fn test_config_yaml_includes_udp_sentinel() {
        let instance = ServiceInstance::new("sg-01", "router-1", "singbox", "sg-01")
            .with_config("socks_address", json!("10.99.102.1"))
            .with_config("socks_port", json!("1080"));
        let network = InstanceNetworkConfig::from_instance(&instance).unwrap();
        let config =
            GatewayConfig::for_instance(&instance, &FeatureManifest::new("singbox"), &network, 8500)
                .unwrap();
        assert_eq!(config.socks5.udp.as_deref(), Some("udp"));

        let parsed: GatewayConfig = serde_yaml::from_str(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[tokio::test]
    async fn test_start_gateway_registers_process() {
        let h = harness();
        let gw = h
            .manager
            .start_gateway(&tor_instance("usa"), &FeatureManifest::new("tor"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(gw.tun_name, "tun-tor-usa");
        assert_eq!(gw.process_id, "gw-usa");
        assert!(!gw.udp_enabled);
        assert!(gw.config_path.exists());
        assert!(gw.config_path.ends_with("gateways/usa.yaml"));

        let process = h.supervisor.process("gw-usa").unwrap();
        assert!(process.auto_restart);
        assert_eq!(process.command, "/app/hev-socks5-tunnel");
        assert_eq!(process.args, vec![gw.config_path.to_string_lossy().to_string()]);
        assert!(process.health_probe.as_ref().unwrap().is_healthy());

        let status = h.manager.get_status("usa").await;
        assert_eq!(status.state, GatewayStatus::Running);
        assert_eq!(status.tun_name.as_deref(), Some("tun-tor-usa"));
        assert!(status.uptime.is_some());
        assert!(h.manager.has_gateway("usa"));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let h = harness();
        let manifest = FeatureManifest::new("tor");
        h.manager.start_gateway(&tor_instance("usa"), &manifest).await.unwrap();

        let err = h.manager.start_gateway(&tor_instance("usa"), &manifest).await.unwrap_err();
        assert!(matches!(err, VifError::GatewayAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_start_skipped_when_not_needed() {
        let h = harness();
        let instance = tor_instance("srv").with_config("mode", json!("server"));
        let result =
            h.manager.start_gateway(&instance, &FeatureManifest::new("tor")).await.unwrap();
        assert!(result.is_none());
        assert!(h.supervisor.calls().is_empty());
        assert!(!h.manager.has_gateway("srv"));
    }

    #[tokio::test]
    async fn test_start_without_socks_endpoint_fails() {
        let h = harness();
        let instance = ServiceInstance::new("bare", "router-1", "tor", "bare");
        let err =
            h.manager.start_gateway(&instance, &FeatureManifest::new("tor")).await.unwrap_err();
        assert!(matches!(err, VifError::InvalidGatewayConfig { .. }));
        assert!(h.supervisor.calls().is_empty());

        // Reservation was released
        let instance = tor_instance("bare");
        assert!(h.manager.start_gateway(&instance, &FeatureManifest::new("tor")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tun_timeout_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(ScriptedSupervisor::new());
        let links = Arc::new(FakeLinkTable::new());
        let manager = GatewayManager::new(
            supervisor.clone(),
            links,
            Arc::new(DefaultPathResolver::with_base(dir.path())),
            GatewaySettings::default(),
        );

        let err = manager
            .start_gateway(&tor_instance("usa"), &FeatureManifest::new("tor"))
            .await
            .unwrap_err();

        assert!(matches!(err, VifError::TunTimeout { .. }));
        assert_eq!(supervisor.calls(), vec!["add:gw-usa", "start:gw-usa", "stop:gw-usa", "remove:gw-usa"]);
        assert!(supervisor.process("gw-usa").is_none());
        assert!(!manager.config_path_for("usa").exists());
        assert!(!manager.has_gateway("usa"));
    }

    #[tokio::test]
    async fn test_supervisor_start_failure_deregisters() {
        let h = harness();
        h.supervisor.fail_start(true);

        let err = h
            .manager
            .start_gateway(&tor_instance("usa"), &FeatureManifest::new("tor"))
            .await
            .unwrap_err();
        assert!(matches!(err, VifError::GatewayStartFailed { .. }));
        assert_eq!(h.supervisor.calls(), vec!["add:gw-usa", "start:gw-usa", "remove:gw-usa"]);
        assert!(!h.manager.has_gateway("usa"));
    }

    #[tokio::test]
    async fn test_stop_gateway() {
        let h = harness();
        let gw = h
            .manager
            .start_gateway(&tor_instance("usa"), &FeatureManifest::new("tor"))
            .await
            .unwrap()
            .unwrap();

        h.manager.stop_gateway("usa").await.unwrap();

        assert!(!h.links.contains("tun-tor-usa"));
        assert!(h.supervisor.process("gw-usa").is_none());
        assert!(!gw.config_path.exists());
        assert_eq!(h.manager.get_status("usa").await.state, GatewayStatus::Stopped);
        assert!(h.manager.list_gateways().is_empty());

        // Unknown instance is a no-op
        h.manager.stop_gateway("usa").await.unwrap();
    }

    #[tokio::test]
    async fn test_status_reports_missing_and_crashed_process() {
        let h = harness();
        let manifest = FeatureManifest::new("tor");
        h.manager.start_gateway(&tor_instance("a"), &manifest).await.unwrap();
        h.manager.start_gateway(&tor_instance("b"), &manifest).await.unwrap();

        h.supervisor.forget("gw-a");
        let status = h.manager.get_status("a").await;
        assert_eq!(status.state, GatewayStatus::Error);
        assert!(status.error_message.unwrap().contains("not found"));

        h.supervisor.set_state("gw-b", ProcessState::Crashed);
        let status = h.manager.get_status("b").await;
        assert_eq!(status.state, GatewayStatus::Error);

        assert_eq!(h.manager.get_status("unknown").await.state, GatewayStatus::Stopped);
    }
}
