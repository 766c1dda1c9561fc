//! Ingress VLANs for dual-VLAN bridges.
//!
//! An ingress VLAN carries client traffic into the container. The router side
//! gets a VLAN sub-interface with a DHCP client; the container side runs a
//! DHCP server on `eth0.{vlan}` that hands the router its address. The
//! interface can optionally join a router bridge so that every device on that
//! bridge is routed through the service.

use crate::error::{Result, VifError};
use crate::network::container::container_interface_for;
use crate::network::vlan::VlanAllocator;
use crate::router::{
    execute_checked, RouterCommand, RouterPort, PATH_BRIDGE_PORT, PATH_DHCP_CLIENT, PATH_VLAN,
};
use crate::types::VirtualInterface;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{info, instrument, warn};

const INGRESS_COMMENT: &str = "nnc-ingress";
const DHCP_LEASE_TIME: Duration = Duration::from_secs(3600);

/// Router-side name of an ingress interface.
pub fn ingress_interface_name(service_name: &str) -> String {
    format!("nnc-ingress-{}", service_name)
}

/// Container DHCP server settings for one ingress VLAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressDhcpConfig {
    pub vlan_id: u16,
    /// Container interface the server listens on
    pub interface: String,
    /// Server address with prefix length
    pub ip_address: String,
    pub range_start: String,
    pub range_end: String,
    pub dns: String,
    pub lease_time: Duration,
}

impl IngressDhcpConfig {
    pub fn for_vlan(vlan_id: u16) -> Self {
        Self {
            vlan_id,
            interface: container_interface_for(vlan_id),
            ip_address: VirtualInterface::address_for(vlan_id),
            range_start: format!("10.99.{}.10", vlan_id),
            range_end: format!("10.99.{}.50", vlan_id),
            dns: VirtualInterface::bind_ip_for(vlan_id),
            lease_time: DHCP_LEASE_TIME,
        }
    }
}

/// DHCP daemon running inside the container.
#[async_trait]
pub trait DhcpServer: Send + Sync {
    async fn start_server(&self, config: &IngressDhcpConfig) -> Result<()>;
    async fn stop_server(&self, vlan_id: u16) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressVlan {
    pub vlan_id: u16,
    pub router_id: String,
    pub instance_id: String,
    pub service_name: String,
    pub router_interface: String,
    pub container_interface: String,
    pub ip_address: String,
    pub dhcp_client_id: Option<String>,
    pub bridge_name: Option<String>,
    pub bridge_port_id: Option<String>,
    pub created_at: SystemTime,
}

/// Ingress VLAN lifecycle.
#[async_trait]
pub trait IngressService: Send + Sync {
    async fn create_vlan(&self, router_id: &str, instance_id: &str, service_name: &str) -> Result<IngressVlan>;
    async fn add_to_bridge(&self, vlan_id: u16, bridge: &str) -> Result<()>;
    async fn remove_from_bridge(&self, vlan_id: u16) -> Result<()>;
    async fn remove_vlan(&self, vlan_id: u16) -> Result<()>;
    fn list_vlans(&self) -> Vec<IngressVlan>;
}

/// Ingress service driving the router and a container DHCP server.
pub struct RouterIngressService {
    router: Arc<dyn RouterPort>,
    dhcp: Arc<dyn DhcpServer>,
    allocator: Arc<dyn VlanAllocator>,
    parent_interface: String,
    vlans: RwLock<HashMap<u16, IngressVlan>>,
}

impl RouterIngressService {
    pub fn new(
        router: Arc<dyn RouterPort>,
        dhcp: Arc<dyn DhcpServer>,
        allocator: Arc<dyn VlanAllocator>,
        parent_interface: impl Into<String>,
    ) -> Self {
        Self {
            router,
            dhcp,
            allocator,
            parent_interface: parent_interface.into(),
            vlans: RwLock::new(HashMap::new()),
        }
    }

    fn lookup(&self, vlan_id: u16) -> Result<IngressVlan> {
        self.vlans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&vlan_id)
            .cloned()
            .ok_or_else(|| VifError::not_found("ingress vlan", vlan_id.to_string()))
    }

    /// Best-effort removal of the router and container pieces of an ingress VLAN.
    async fn release_resources(&self, vlan: &IngressVlan, dhcp_started: bool) {
        if dhcp_started {
            if let Err(e) = self.dhcp.stop_server(vlan.vlan_id).await {
                warn!(vlan_id = vlan.vlan_id, error = %e, "Failed to stop DHCP server");
            }
        }

        if let Some(id) = &vlan.dhcp_client_id {
            let cmd = RouterCommand::remove(PATH_DHCP_CLIENT).with_id(id);
            if let Err(e) = execute_checked(self.router.as_ref(), &cmd).await {
                warn!(error = %e, "Failed to remove DHCP client");
            }
        } else {
            self.remove_matching(PATH_DHCP_CLIENT, &vlan.router_interface).await;
        }

        if let Some(id) = &vlan.bridge_port_id {
            let cmd = RouterCommand::remove(PATH_BRIDGE_PORT).with_id(id);
            if let Err(e) = execute_checked(self.router.as_ref(), &cmd).await {
                warn!(error = %e, "Failed to remove bridge port");
            }
        }

        let cmd = RouterCommand::remove(PATH_VLAN).arg("numbers", &vlan.router_interface);
        if let Err(e) = execute_checked(self.router.as_ref(), &cmd).await {
            warn!(interface = %vlan.router_interface, error = %e, "Failed to remove ingress VLAN interface");
        }

        if let Err(e) = self.allocator.release(&vlan.router_id, vlan.vlan_id).await {
            warn!(vlan_id = vlan.vlan_id, error = %e, "Failed to release ingress VLAN");
        }
    }

    /// Remove every item under `path` attached to `interface`.
    async fn remove_matching(&self, path: &str, interface: &str) {
        let print = RouterCommand::print(path).filter("interface", interface);
        let rows = match execute_checked(self.router.as_ref(), &print).await {
            Ok(result) => result.data,
            Err(e) => {
                warn!(path, error = %e, "Failed to list items for removal");
                return;
            }
        };
        for id in rows.iter().filter_map(|row| row.get(".id")) {
            let cmd = RouterCommand::remove(path).with_id(id);
            if let Err(e) = execute_checked(self.router.as_ref(), &cmd).await {
                warn!(path, id = %id, error = %e, "Failed to remove item");
            }
        }
    }
}

#[async_trait]
impl IngressService for RouterIngressService {
    /// Allocate a VLAN and bring up both ends of it.
    ///
    /// Stops at the first failing step, undoes what was done and releases the
    /// VLAN.
    #[instrument(skip(self), fields(router_id = %router_id, instance_id = %instance_id))]
    async fn create_vlan(&self, router_id: &str, instance_id: &str, service_name: &str) -> Result<IngressVlan> {
        let vlan_id = self.allocator.allocate(router_id, instance_id, "ingress").await?;
        let mut vlan = IngressVlan {
            vlan_id,
            router_id: router_id.to_string(),
            instance_id: instance_id.to_string(),
            service_name: service_name.to_string(),
            router_interface: ingress_interface_name(service_name),
            container_interface: container_interface_for(vlan_id),
            ip_address: VirtualInterface::address_for(vlan_id),
            dhcp_client_id: None,
            bridge_name: None,
            bridge_port_id: None,
            created_at: SystemTime::now(),
        };

        let add_vlan = RouterCommand::add(PATH_VLAN)
            .arg("name", &vlan.router_interface)
            .arg("vlan-id", vlan_id.to_string())
            .arg("interface", &self.parent_interface)
            .arg("comment", INGRESS_COMMENT);
        if let Err(e) = execute_checked(self.router.as_ref(), &add_vlan).await {
            if let Err(release_err) = self.allocator.release(router_id, vlan_id).await {
                warn!(error = %release_err, "Failed to release ingress VLAN");
            }
            return Err(e);
        }

        let add_client = RouterCommand::add(PATH_DHCP_CLIENT)
            .arg("interface", &vlan.router_interface)
            .arg("add-default-route", "no")
            .arg("disabled", "no")
            .arg("comment", INGRESS_COMMENT);
        match execute_checked(self.router.as_ref(), &add_client).await {
            Ok(result) => vlan.dhcp_client_id = result.id,
            Err(e) => {
                self.release_resources(&vlan, false).await;
                return Err(e);
            }
        }

        if let Err(e) = self.dhcp.start_server(&IngressDhcpConfig::for_vlan(vlan_id)).await {
            self.release_resources(&vlan, false).await;
            return Err(e);
        }

        self.vlans.write().unwrap_or_else(PoisonError::into_inner).insert(vlan_id, vlan.clone());
        info!(vlan_id, interface = %vlan.router_interface, "Ingress VLAN created");
        Ok(vlan)
    }

    #[instrument(skip(self))]
    async fn add_to_bridge(&self, vlan_id: u16, bridge: &str) -> Result<()> {
        let vlan = self.lookup(vlan_id)?;
        let cmd = RouterCommand::add(PATH_BRIDGE_PORT)
            .arg("interface", &vlan.router_interface)
            .arg("bridge", bridge)
            .arg("comment", INGRESS_COMMENT);
        let result = execute_checked(self.router.as_ref(), &cmd).await?;

        if let Some(entry) = self.vlans.write().unwrap_or_else(PoisonError::into_inner).get_mut(&vlan_id) {
            entry.bridge_name = Some(bridge.to_string());
            entry.bridge_port_id = result.id;
        }
        info!(interface = %vlan.router_interface, bridge, "Ingress VLAN added to bridge");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_from_bridge(&self, vlan_id: u16) -> Result<()> {
        let vlan = self.lookup(vlan_id)?;
        if vlan.bridge_name.is_none() {
            return Err(VifError::not_found("bridge port", vlan.router_interface));
        }

        match &vlan.bridge_port_id {
            Some(id) => {
                execute_checked(self.router.as_ref(), &RouterCommand::remove(PATH_BRIDGE_PORT).with_id(id))
                    .await?;
            }
            None => self.remove_matching(PATH_BRIDGE_PORT, &vlan.router_interface).await,
        }

        if let Some(entry) = self.vlans.write().unwrap_or_else(PoisonError::into_inner).get_mut(&vlan_id) {
            entry.bridge_name = None;
            entry.bridge_port_id = None;
        }
        info!(interface = %vlan.router_interface, "Ingress VLAN removed from bridge");
        Ok(())
    }

    /// Tear down an ingress VLAN. Individual step failures are logged.
    #[instrument(skip(self))]
    async fn remove_vlan(&self, vlan_id: u16) -> Result<()> {
        let vlan = self
            .vlans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&vlan_id)
            .ok_or_else(|| VifError::not_found("ingress vlan", vlan_id.to_string()))?;

        self.release_resources(&vlan, true).await;
        info!(vlan_id, interface = %vlan.router_interface, "Ingress VLAN removed");
        Ok(())
    }

    fn list_vlans(&self) -> Vec<IngressVlan> {
        let mut vlans: Vec<IngressVlan> =
            self.vlans.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        vlans.sort_by_key(|v| v.vlan_id);
        vlans
    }
}
