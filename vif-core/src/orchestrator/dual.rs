//! Dual-VLAN bridges.
//!
//! An egress bridge as in the single-VLAN case, plus an ingress VLAN served
//! by a container DHCP daemon and forwarded to the egress side. When an
//! ingress router bridge is configured the ingress VLAN joins it, which sends
//! every device on that bridge through the service without per-device
//! marking rules.

use super::{BridgeOrchestrator, BridgeResult};
use crate::error::Result;
use crate::events::{Event, EventType};
use crate::network::container::ServiceRoutingConfig;
use crate::network::ingress::IngressVlan;
use crate::types::{FeatureManifest, ServiceInstance};
use std::sync::PoisonError;
use std::time::SystemTime;
use tracing::{info, instrument, warn};

/// A completed dual-VLAN bridge.
#[derive(Debug, Clone)]
pub struct DualBridge {
    pub instance_id: String,
    pub egress: BridgeResult,
    pub ingress: IngressVlan,
    pub routing: ServiceRoutingConfig,
    /// Router bridge the ingress VLAN was attached to
    pub bridge_name: Option<String>,
    pub dns_redirect_port: Option<u16>,
    pub created_at: SystemTime,
}

/// Completed setup stages, unwound last-first.
enum Stage {
    Egress,
    IngressVlan(u16),
    Bridged(u16),
    Forwarding(String),
}

impl BridgeOrchestrator {
    /// Build an egress bridge plus a forwarded ingress VLAN for an instance.
    #[instrument(skip(self, instance, manifest), fields(instance_id = %instance.id, feature = %manifest.id))]
    pub async fn setup_dual_vlan_bridge(
        &self,
        instance: &ServiceInstance,
        manifest: &FeatureManifest,
    ) -> Result<DualBridge> {
        self.dual_deps()?;
        let _guard = self.in_flight.acquire(&instance.id)?;

        let mut stages = Vec::new();
        match self.build_dual(instance, manifest, &mut stages).await {
            Ok(bridge) => {
                self.dual_bridges
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(instance.id.clone(), bridge.clone());
                let event =
                    Event::new(EventType::BridgeSetupComplete, &instance.id, "Dual-VLAN bridge setup complete");
                self.events.publish(
                    event
                        .with_metadata("instance_id", &instance.id)
                        .with_metadata("mode", "dual")
                        .with_metadata("vlan_id", bridge.egress.vlan_id)
                        .with_metadata("ingress_vlan_id", bridge.ingress.vlan_id)
                        .with_metadata("bind_ip", &bridge.egress.bind_ip)
                        .with_metadata("interface_name", &bridge.egress.interface.interface_name)
                        .with_metadata("ingress_interface", &bridge.routing.ingress_interface)
                        .with_metadata("gateway", bridge.egress.gateway.is_some()),
                );
                info!(
                    egress_vlan = bridge.egress.vlan_id,
                    ingress_vlan = bridge.ingress.vlan_id,
                    "Dual-VLAN bridge ready"
                );
                Ok(bridge)
            }
            Err(e) => {
                warn!(error = %e, completed = stages.len(), "Dual-VLAN setup failed, unwinding");
                self.unwind_dual(&instance.id, stages).await;
                Err(e)
            }
        }
    }

    async fn build_dual(
        &self,
        instance: &ServiceInstance,
        manifest: &FeatureManifest,
        stages: &mut Vec<Stage>,
    ) -> Result<DualBridge> {
        let deps = self.dual_deps()?;

        let egress = self.provision(instance, manifest).await?;
        stages.push(Stage::Egress);

        let service_name = format!("{}-{}", manifest.id, instance.instance_name);
        let ingress = deps.ingress.create_vlan(&instance.router_id, &instance.id, &service_name).await?;
        stages.push(Stage::IngressVlan(ingress.vlan_id));

        if let Some(bridge) = &self.ingress_bridge {
            deps.ingress.add_to_bridge(ingress.vlan_id, bridge).await?;
            stages.push(Stage::Bridged(ingress.vlan_id));
        }

        let routing = ServiceRoutingConfig::for_vlans(ingress.vlan_id, egress.vlan_id);
        deps.container.setup_service_routing(&routing).await?;
        stages.push(Stage::Forwarding(routing.ingress_interface.clone()));

        if let Some(port) = self.dns_redirect_port {
            // Covered by the Forwarding stage: teardown by ingress interface
            // also drops its DNS redirects
            deps.container.setup_dns_redirect(&routing.ingress_interface, port).await?;
        }

        Ok(DualBridge {
            instance_id: instance.id.clone(),
            egress,
            ingress,
            routing,
            bridge_name: self.ingress_bridge.clone(),
            dns_redirect_port: self.dns_redirect_port,
            created_at: SystemTime::now(),
        })
    }

    async fn unwind_dual(&self, instance_id: &str, mut stages: Vec<Stage>) {
        let Ok(deps) = self.dual_deps() else { return };

        while let Some(stage) = stages.pop() {
            let outcome = match stage {
                Stage::Forwarding(interface) => deps.container.teardown_service_routing(&interface).await,
                Stage::Bridged(vlan_id) => deps.ingress.remove_from_bridge(vlan_id).await,
                Stage::IngressVlan(vlan_id) => deps.ingress.remove_vlan(vlan_id).await,
                Stage::Egress => self.deprovision(instance_id).await,
            };
            if let Err(e) = outcome {
                warn!(instance_id, error = %e, "Failed to undo dual-VLAN stage");
            }
        }
    }

    /// Tear down a dual-VLAN bridge. Safe to repeat.
    ///
    /// Works from the recorded bridge when there is one; otherwise looks for
    /// an ingress VLAN owned by the instance and then tears down the egress
    /// side as for a single-VLAN bridge.
    #[instrument(skip(self))]
    pub async fn teardown_dual_vlan_bridge(&self, instance_id: &str) -> Result<()> {
        let deps = self.dual_deps()?;
        let _guard = self.in_flight.acquire(instance_id)?;

        let recorded = self
            .dual_bridges
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id);
        let ingress = match recorded {
            Some(bridge) => Some(bridge.ingress),
            None => deps.ingress.list_vlans().into_iter().find(|v| v.instance_id == instance_id),
        };

        let ingress_vlan = ingress.as_ref().map(|v| v.vlan_id);
        if let Some(ingress) = ingress {
            if let Err(e) = deps.container.teardown_service_routing(&ingress.container_interface).await {
                if !e.is_not_found() {
                    warn!(error = %e, "Failed to remove forwarding rules");
                }
            }
            if let Err(e) = deps.ingress.remove_vlan(ingress.vlan_id).await {
                warn!(vlan_id = ingress.vlan_id, error = %e, "Failed to remove ingress VLAN");
            }
        }

        self.deprovision(instance_id).await?;

        let mut event =
            Event::new(EventType::BridgeTeardownComplete, instance_id, "Dual-VLAN bridge torn down")
                .with_metadata("instance_id", instance_id)
                .with_metadata("mode", "dual");
        if let Some(vlan_id) = ingress_vlan {
            event = event.with_metadata("ingress_vlan_id", vlan_id);
        }
        self.events.publish(event);
        info!("Dual-VLAN bridge torn down");
        Ok(())
    }

    /// Dual-VLAN bridges set up by this orchestrator.
    pub fn list_dual_bridges(&self) -> Vec<DualBridge> {
        let mut bridges: Vec<DualBridge> =
            self.dual_bridges.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        bridges.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        bridges
    }
}
