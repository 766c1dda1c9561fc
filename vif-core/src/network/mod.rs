//! Network building blocks for service bridges.
//!
//! Router-side pieces (VLAN allocation, interface provisioning, ingress VLANs)
//! and container-side pieces (gateway processes, packet forwarding).

pub mod container;
pub mod gateway;
pub mod ingress;
pub mod interface_factory;
pub mod link;
pub mod supervisor;
pub mod vlan;

pub use container::{ContainerNetworkManager, IptablesFilter, PacketFilter, ServiceRoutingConfig};
pub use gateway::{needs_gateway, GatewayManager, GatewaySettings};
pub use ingress::{DhcpServer, IngressService, IngressVlan, RouterIngressService};
pub use interface_factory::InterfaceFactory;
pub use link::{LinkProbe, SystemLinkProbe};
pub use supervisor::{ProcessSupervisor, TunHealthProbe};
pub use vlan::{PersistentVlanAllocator, SequentialVlanAllocator, VlanAllocator};
