//! VIF Core Library
//!
//! Turns service instances running next to a managed router into isolated,
//! routable network paths: a VLAN, a router interface with its own routing
//! table, an optional SOCKS5-to-TUN gateway, dual-VLAN forwarding and
//! health-driven kill switches.

pub mod config;
pub mod error;
pub mod events;
pub mod isolation;
pub mod network;
pub mod observability;
pub mod orchestrator;
pub mod paths;
pub mod router;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used items
pub use config::VifConfig;
pub use error::{Result, VifError};
pub use events::{Event, EventBus, EventType};
pub use isolation::{KillSwitchListener, KillSwitchManager};
pub use observability::{init as init_observability, shutdown as shutdown_observability};
pub use orchestrator::{BridgeOrchestrator, BridgeResult, DualBridge, ReconcileReport};
pub use router::{CommandResult, RouterCommand, RouterPort};
pub use state::StateManager;
pub use types::{
    DeviceRouting, FeatureManifest, GatewayStatus, GatewayType, InterfaceStatus, KillSwitchMode,
    ServiceInstance, VirtualInterface,
};
