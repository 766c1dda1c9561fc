//! Router-side interface provisioning.
//!
//! An interface is four router objects: a VLAN sub-interface, its address, a
//! routing table and a default route in that table. The router has no
//! multi-command transaction, so creation keeps a stack of inverse commands
//! and unwinds it on failure.

use crate::error::{Result, VifError};
use crate::events::{Event, EventBus, EventPayload, EventType};
use crate::router::{
    execute_checked, RouterCommand, RouterPort, PATH_IP_ADDRESS, PATH_ROUTE, PATH_ROUTING_TABLE,
    PATH_VLAN,
};
use crate::state::StateManager;
use crate::types::{GatewayStatus, GatewayType, InterfaceStatus, VirtualInterface};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, info, instrument, warn};

const DEFAULT_ROUTE: &str = "0.0.0.0/0";

/// Provisioning step, as reported in `VifError::ProvisioningFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    VlanInterface,
    IpAddress,
    RoutingTable,
    DefaultRoute,
}

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VlanInterface => "vlan-interface",
            Self::IpAddress => "ip-address",
            Self::RoutingTable => "routing-table",
            Self::DefaultRoute => "default-route",
        }
    }
}

/// Add/remove command pair for one provisioning step.
struct StepCommands {
    step: ProvisionStep,
    apply: RouterCommand,
    undo: RouterCommand,
}

fn plan(vif: &VirtualInterface, parent_interface: &str) -> [StepCommands; 4] {
    let gateway = VirtualInterface::gateway_ip_for(vif.vlan_id);
    [
        StepCommands {
            step: ProvisionStep::VlanInterface,
            apply: RouterCommand::add(PATH_VLAN)
                .arg("name", &vif.interface_name)
                .arg("vlan-id", vif.vlan_id.to_string())
                .arg("interface", parent_interface),
            undo: RouterCommand::remove(PATH_VLAN).arg("numbers", &vif.interface_name),
        },
        StepCommands {
            step: ProvisionStep::IpAddress,
            apply: RouterCommand::add(PATH_IP_ADDRESS)
                .arg("address", &vif.ip_address)
                .arg("interface", &vif.interface_name),
            undo: RouterCommand::remove(PATH_IP_ADDRESS).arg("numbers", &vif.ip_address),
        },
        StepCommands {
            step: ProvisionStep::RoutingTable,
            apply: RouterCommand::add(PATH_ROUTING_TABLE).arg("name", &vif.routing_mark),
            undo: RouterCommand::remove(PATH_ROUTING_TABLE).arg("numbers", &vif.routing_mark),
        },
        StepCommands {
            step: ProvisionStep::DefaultRoute,
            apply: RouterCommand::add(PATH_ROUTE)
                .arg("dst-address", DEFAULT_ROUTE)
                .arg("gateway", gateway)
                .arg("routing-table", &vif.routing_mark),
            undo: RouterCommand::remove(PATH_ROUTE)
                .arg("routing-table", &vif.routing_mark)
                .arg("dst-address", DEFAULT_ROUTE),
        },
    ]
}

/// LIFO stack of compensating commands.
struct Rollback<'a> {
    router: &'a dyn RouterPort,
    undo: Vec<RouterCommand>,
}

impl<'a> Rollback<'a> {
    fn new(router: &'a dyn RouterPort) -> Self {
        Self { router, undo: Vec::new() }
    }

    fn push(&mut self, cmd: RouterCommand) {
        self.undo.push(cmd);
    }

    /// Issue every pushed command in reverse order. Failures are logged only.
    async fn unwind(self) {
        for cmd in self.undo.into_iter().rev() {
            if let Err(e) = execute_checked(self.router, &cmd).await {
                error!(command = %cmd, error = %e, "Compensating command failed");
            }
        }
    }

    /// Drop the stack without issuing anything.
    fn commit(self) {}
}

/// Creates and removes per-instance router interfaces.
pub struct InterfaceFactory {
    router: Arc<dyn RouterPort>,
    state: Arc<StateManager>,
    events: EventBus,
    parent_interface: String,
}

impl InterfaceFactory {
    pub fn new(
        router: Arc<dyn RouterPort>,
        state: Arc<StateManager>,
        events: EventBus,
        parent_interface: impl Into<String>,
    ) -> Self {
        let parent_interface = parent_interface.into();
        let parent_interface =
            if parent_interface.is_empty() { "ether1".to_string() } else { parent_interface };
        Self { router, state, events, parent_interface }
    }

    pub fn parent_interface(&self) -> &str {
        &self.parent_interface
    }

    /// Provision the router path for an instance.
    ///
    /// The record is persisted with status `Creating` before any router
    /// command is issued. On failure the steps that succeeded are undone in
    /// reverse order and the record is deleted, so the instance can be
    /// provisioned again. The failed step is named in the returned error.
    #[instrument(skip(self), fields(instance_id = %instance_id, vlan_id = vlan_id))]
    pub async fn create_interface(
        &self,
        instance_id: &str,
        feature_id: &str,
        instance_name: &str,
        vlan_id: u16,
    ) -> Result<VirtualInterface> {
        let now = SystemTime::now();
        let mut vif = VirtualInterface {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            interface_name: VirtualInterface::name_for(feature_id, instance_name),
            vlan_id,
            ip_address: VirtualInterface::address_for(vlan_id),
            gateway_type: GatewayType::None,
            gateway_status: GatewayStatus::Stopped,
            routing_mark: VirtualInterface::routing_mark_for(feature_id, instance_name),
            status: InterfaceStatus::Creating,
            created_at: now,
            updated_at: now,
        };

        info!(interface = %vif.interface_name, ip = %vif.ip_address, "Creating virtual interface");
        self.state.insert_interface(&vif).await?;

        let mut rollback = Rollback::new(self.router.as_ref());
        for step in plan(&vif, &self.parent_interface) {
            if let Err(e) = execute_checked(self.router.as_ref(), &step.apply).await {
                warn!(
                    interface = %vif.interface_name,
                    step = step.step.as_str(),
                    error = %e,
                    "Provisioning step failed, rolling back"
                );
                rollback.unwind().await;
                self.discard_record(&vif.id).await;
                metrics::counter!("nnc_interface_rollback_total", "step" => step.step.as_str())
                    .increment(1);
                return Err(VifError::ProvisioningFailed {
                    interface: vif.interface_name,
                    step: step.step.as_str().to_string(),
                    reason: e.to_string(),
                });
            }
            rollback.push(step.undo);
        }

        if let Err(e) = self.state.update_interface_status(&vif.id, InterfaceStatus::Active).await {
            rollback.unwind().await;
            self.discard_record(&vif.id).await;
            metrics::counter!("nnc_interface_rollback_total", "step" => "persist").increment(1);
            return Err(e);
        }
        rollback.commit();
        vif.status = InterfaceStatus::Active;
        vif.updated_at = SystemTime::now();

        self.events.publish(
            Event::new(EventType::InterfaceCreated, &vif.id, "Virtual interface created")
                .with_metadata("interface_id", &vif.id)
                .with_metadata("instance_id", instance_id)
                .with_metadata("interface_name", &vif.interface_name)
                .with_metadata("vlan_id", vlan_id)
                .with_metadata("ip_address", &vif.ip_address),
        );
        metrics::counter!("nnc_interface_created_total").increment(1);
        info!(interface = %vif.interface_name, vif_id = %vif.id, "Virtual interface created");

        Ok(vif)
    }

    /// Drop the record of a failed provisioning attempt. If the delete fails
    /// the record is marked `Error` instead.
    async fn discard_record(&self, vif_id: &str) {
        if let Err(e) = self.state.delete_interface(vif_id).await {
            warn!(vif_id, error = %e, "Failed to delete failed interface record");
            if let Err(db_err) = self.state.update_interface_status(vif_id, InterfaceStatus::Error).await {
                error!(error = %db_err, "Failed to mark interface as errored");
            }
        }
    }

    /// Remove the router path for an instance.
    ///
    /// A missing record is not an error. Every inverse command is attempted
    /// regardless of earlier failures; the record is deleted last.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn remove_interface(&self, instance_id: &str) -> Result<()> {
        let Some(vif) = self.state.find_interface_by_instance(instance_id).await? else {
            warn!("Virtual interface not found, nothing to remove");
            return Ok(());
        };

        info!(interface = %vif.interface_name, vif_id = %vif.id, "Removing virtual interface");
        self.state.update_interface_status(&vif.id, InterfaceStatus::Removing).await?;

        for step in plan(&vif, &self.parent_interface).into_iter().rev() {
            if let Err(e) = execute_checked(self.router.as_ref(), &step.undo).await {
                warn!(
                    step = step.step.as_str(),
                    error = %e,
                    "Remove step failed (resource may not exist)"
                );
            }
        }

        self.state.delete_interface(&vif.id).await?;

        self.events.publish(
            Event::new(EventType::InterfaceRemoved, &vif.id, "Virtual interface removed")
                .with_payload(EventPayload::InterfaceStatusChanged {
                    interface_id: vif.id.clone(),
                    instance_id: Some(instance_id.to_string()),
                    new_status: "removed".to_string(),
                })
                .with_metadata("interface_id", &vif.id)
                .with_metadata("instance_id", instance_id)
                .with_metadata("interface_name", &vif.interface_name)
                .with_metadata("vlan_id", vif.vlan_id),
        );
        metrics::counter!("nnc_interface_removed_total").increment(1);
        info!(interface = %vif.interface_name, "Virtual interface removed");

        Ok(())
    }
}
