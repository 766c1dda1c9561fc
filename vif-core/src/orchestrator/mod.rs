//! Bridge orchestration.
//!
//! Composes VLAN allocation, interface provisioning and gateway startup into
//! a bridge for one service instance, and tears it down again. Setup and
//! teardown for the same instance are mutually exclusive; a second request
//! while one is running fails with `OperationInProgress`.

mod dual;
mod locks;
mod reconcile;

pub use dual::DualBridge;
pub use reconcile::ReconcileReport;

use crate::config::VifConfig;
use crate::error::{Result, VifError};
use crate::events::{Event, EventBus, EventType};
use crate::network::container::ContainerNetworkManager;
use crate::network::gateway::GatewayInstance;
use crate::network::ingress::IngressService;
use crate::network::{GatewayManager, InterfaceFactory, VlanAllocator};
use crate::router::RouterPort;
use crate::state::StateManager;
use crate::types::{
    FeatureManifest, GatewayStatus, GatewayType, ServiceInstance, VirtualInterface,
};
use locks::InFlight;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument, warn};

/// A completed single-VLAN bridge.
#[derive(Debug, Clone)]
pub struct BridgeResult {
    pub instance_id: String,
    pub vlan_id: u16,
    pub bind_ip: String,
    pub interface: VirtualInterface,
    pub gateway: Option<GatewayInstance>,
}

/// Collaborators used only by dual-VLAN bridges.
pub(crate) struct DualVlanDeps {
    ingress: Arc<dyn IngressService>,
    container: Arc<ContainerNetworkManager>,
}

/// Sets up and tears down service bridges.
pub struct BridgeOrchestrator {
    state: Arc<StateManager>,
    allocator: Arc<dyn VlanAllocator>,
    factory: Arc<InterfaceFactory>,
    gateways: Arc<GatewayManager>,
    router: Arc<dyn RouterPort>,
    events: EventBus,
    dual: Option<DualVlanDeps>,
    ingress_bridge: Option<String>,
    dns_redirect_port: Option<u16>,
    in_flight: InFlight,
    dual_bridges: RwLock<HashMap<String, DualBridge>>,
}

impl BridgeOrchestrator {
    pub fn new(
        state: Arc<StateManager>,
        allocator: Arc<dyn VlanAllocator>,
        factory: Arc<InterfaceFactory>,
        gateways: Arc<GatewayManager>,
        router: Arc<dyn RouterPort>,
        events: EventBus,
    ) -> Self {
        Self {
            state,
            allocator,
            factory,
            gateways,
            router,
            events,
            dual: None,
            ingress_bridge: None,
            dns_redirect_port: None,
            in_flight: InFlight::default(),
            dual_bridges: RwLock::new(HashMap::new()),
        }
    }

    /// Enable dual-VLAN bridges.
    pub fn with_dual_vlan(
        mut self,
        ingress: Arc<dyn IngressService>,
        container: Arc<ContainerNetworkManager>,
    ) -> Self {
        self.dual = Some(DualVlanDeps { ingress, container });
        self
    }

    /// Apply the ingress bridge and DNS redirect settings.
    pub fn with_config(mut self, config: &VifConfig) -> Self {
        self.ingress_bridge = config.ingress_bridge.clone();
        self.dns_redirect_port = config.dns_redirect_port;
        self
    }

    /// Whether a setup or teardown is currently running for an instance.
    pub fn is_busy(&self, instance_id: &str) -> bool {
        self.in_flight.is_busy(instance_id)
    }

    // ======================== Single-VLAN Bridge ========================

    /// Build the bridge for an instance.
    ///
    /// Allocates a VLAN, provisions the router interface, starts a gateway if
    /// the service needs one and records the VLAN and bind address on the
    /// instance. Any failure undoes the completed steps and releases the VLAN.
    #[instrument(skip(self, instance, manifest), fields(instance_id = %instance.id, feature = %manifest.id))]
    pub async fn setup_bridge(
        &self,
        instance: &ServiceInstance,
        manifest: &FeatureManifest,
    ) -> Result<BridgeResult> {
        let _guard = self.in_flight.acquire(&instance.id)?;
        let result = self.provision(instance, manifest).await?;

        self.events.publish(
            Event::new(EventType::BridgeSetupComplete, &instance.id, "Bridge setup complete")
                .with_metadata("instance_id", &instance.id)
                .with_metadata("vlan_id", result.vlan_id)
                .with_metadata("bind_ip", &result.bind_ip)
                .with_metadata("interface_name", &result.interface.interface_name)
                .with_metadata("gateway", result.gateway.is_some()),
        );
        Ok(result)
    }

    /// Tear down an instance's bridge. Safe to repeat.
    ///
    /// A missing instance or interface counts as already torn down, and
    /// failures of individual steps are logged rather than returned.
    #[instrument(skip(self))]
    pub async fn teardown_bridge(&self, instance_id: &str) -> Result<()> {
        let _guard = self.in_flight.acquire(instance_id)?;
        self.deprovision(instance_id).await?;

        self.events.publish(
            Event::new(EventType::BridgeTeardownComplete, instance_id, "Bridge teardown complete")
                .with_metadata("instance_id", instance_id),
        );
        Ok(())
    }

    async fn provision(
        &self,
        instance: &ServiceInstance,
        manifest: &FeatureManifest,
    ) -> Result<BridgeResult> {
        let vlan_id = self.allocator.allocate(&instance.router_id, &instance.id, &manifest.id).await?;

        match self.provision_on_vlan(instance, manifest, vlan_id).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if let Err(release_err) = self.allocator.release(&instance.router_id, vlan_id).await {
                    warn!(vlan_id, error = %release_err, "Failed to release VLAN after setup failure");
                }
                Err(e)
            }
        }
    }

    async fn provision_on_vlan(
        &self,
        instance: &ServiceInstance,
        manifest: &FeatureManifest,
        vlan_id: u16,
    ) -> Result<BridgeResult> {
        let mut interface = self
            .factory
            .create_interface(&instance.id, &manifest.id, &instance.instance_name, vlan_id)
            .await?;
        let bind_ip = VirtualInterface::bind_ip_for(vlan_id);

        let gateway = match self.start_gateway(instance, manifest, &bind_ip).await {
            Ok(gateway) => gateway,
            Err(e) => {
                self.remove_interface_best_effort(&instance.id).await;
                return Err(e);
            }
        };

        let persisted = async {
            if gateway.is_some() {
                self.state
                    .update_interface_gateway(&interface.id, GatewayType::HevSocks5Tunnel, GatewayStatus::Running)
                    .await?;
            }
            self.state.set_instance_bridge(&instance.id, vlan_id, &bind_ip).await
        }
        .await;

        if let Err(e) = persisted {
            warn!(error = %e, "Failed to persist bridge state, rolling back");
            if gateway.is_some() {
                if let Err(stop_err) = self.gateways.stop_gateway(&instance.id).await {
                    warn!(error = %stop_err, "Failed to stop gateway during rollback");
                }
            }
            self.remove_interface_best_effort(&instance.id).await;
            return Err(e);
        }

        if gateway.is_some() {
            interface.gateway_type = GatewayType::HevSocks5Tunnel;
            interface.gateway_status = GatewayStatus::Running;
        }

        info!(vlan_id, bind_ip = %bind_ip, gateway = gateway.is_some(), "Bridge ready");
        Ok(BridgeResult { instance_id: instance.id.clone(), vlan_id, bind_ip, interface, gateway })
    }

    /// Start the gateway if the service needs one.
    ///
    /// A service that binds its SOCKS5 port on the bridge address does not
    /// know that address in advance, so it is filled in when the instance
    /// config names neither `socks_address` nor `vlan_ip`.
    async fn start_gateway(
        &self,
        instance: &ServiceInstance,
        manifest: &FeatureManifest,
        bind_ip: &str,
    ) -> Result<Option<GatewayInstance>> {
        let has_address = ["socks_address", "vlan_ip"]
            .iter()
            .any(|k| instance.config.get(*k).and_then(|v| v.as_str()).is_some_and(|s| !s.is_empty()));

        if has_address {
            self.gateways.start_gateway(instance, manifest).await
        } else {
            let with_ip = instance.clone().with_config("vlan_ip", bind_ip.into());
            self.gateways.start_gateway(&with_ip, manifest).await
        }
    }

    async fn remove_interface_best_effort(&self, instance_id: &str) {
        if let Err(e) = self.factory.remove_interface(instance_id).await {
            warn!(instance_id, error = %e, "Failed to remove interface during rollback");
        }
    }

    async fn deprovision(&self, instance_id: &str) -> Result<()> {
        let instance = match self.state.get_instance(instance_id).await {
            Ok(instance) => Some(instance),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let interface = self.state.find_interface_by_instance(instance_id).await?;

        if instance.is_none() && interface.is_none() {
            info!("Bridge already torn down");
            return Ok(());
        }

        let gateway_running = interface
            .as_ref()
            .is_some_and(|vif| vif.gateway_status == GatewayStatus::Running);
        if gateway_running || self.gateways.has_gateway(instance_id) {
            if let Err(e) = self.gateways.stop_gateway(instance_id).await {
                warn!(error = %e, "Failed to stop gateway");
            }
        }

        if interface.is_some() {
            self.remove_interface_best_effort(instance_id).await;
        }

        let router_id = instance.as_ref().map(|i| i.router_id.clone());
        let vlan_id = instance
            .as_ref()
            .and_then(|i| i.vlan_id)
            .or_else(|| interface.as_ref().map(|vif| vif.vlan_id));
        match (router_id, vlan_id) {
            (Some(router_id), Some(vlan_id)) => self.release_owned(&router_id, vlan_id, instance_id).await,
            (None, Some(vlan_id)) => {
                warn!(vlan_id, "Instance record missing, VLAN allocation left for reconciliation");
            }
            _ => {}
        }

        if instance.is_some() {
            if let Err(e) = self.state.clear_instance_bridge(instance_id).await {
                warn!(error = %e, "Failed to clear instance bridge fields");
            }
        }

        info!("Bridge torn down");
        Ok(())
    }

    /// Release a VLAN only while the ledger still assigns it to this
    /// instance. A failed setup may already have released the ID and let
    /// another instance take it.
    async fn release_owned(&self, router_id: &str, vlan_id: u16, instance_id: &str) {
        match self.allocator.owner_of(router_id, vlan_id).await {
            Ok(Some(owner)) if owner == instance_id => {
                if let Err(e) = self.allocator.release(router_id, vlan_id).await {
                    warn!(vlan_id, error = %e, "Failed to release VLAN");
                }
            }
            Ok(Some(owner)) => {
                warn!(vlan_id, owner = %owner, "VLAN now belongs to another instance, not releasing");
            }
            Ok(None) => debug!(vlan_id, "VLAN already released"),
            Err(e) => warn!(vlan_id, error = %e, "Failed to look up VLAN owner"),
        }
    }

    fn dual_deps(&self) -> Result<&DualVlanDeps> {
        self.dual.as_ref().ok_or_else(|| VifError::InvalidConfig {
            reason: "dual-VLAN bridges require an ingress service and container network manager"
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests;
