//! Core domain types for the VIF subsystem.

pub mod instance;
pub mod interface;
pub mod routing;

// Re-exports
pub use instance::{
    coerce_port, FeatureManifest, InstanceNetworkConfig, ServiceInstance, ServiceMode,
    SocksEndpoint,
};
pub use interface::{GatewayStatus, GatewayType, InterfaceStatus, VirtualInterface};
pub use routing::{DeviceRouting, KillSwitchMode, KillSwitchState};
