//! Virtual interface domain types.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Prefix shared by every router-side interface this subsystem creates.
pub const INTERFACE_PREFIX: &str = "nnc-";

/// A router-side VLAN path dedicated to one service instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualInterface {
    /// Unique record identifier (UUID v4)
    pub id: String,

    /// Owning service instance (one interface per instance)
    pub instance_id: String,

    /// Router interface name, `nnc-{feature}-{instance}`
    pub interface_name: String,

    pub vlan_id: u16,

    /// Address assigned on the router side, `10.99.{vlan}.1/24`
    pub ip_address: String,

    pub gateway_type: GatewayType,
    pub gateway_status: GatewayStatus,

    /// Routing table name, `{feature}-{instance}`
    pub routing_mark: String,

    pub status: InterfaceStatus,

    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl VirtualInterface {
    /// Interface name for a feature/instance pair.
    pub fn name_for(feature_id: &str, instance_name: &str) -> String {
        format!("{}{}-{}", INTERFACE_PREFIX, feature_id, instance_name)
    }

    /// Routing table name for a feature/instance pair.
    pub fn routing_mark_for(feature_id: &str, instance_name: &str) -> String {
        format!("{}-{}", feature_id, instance_name)
    }

    /// Router-side CIDR address for a VLAN.
    pub fn address_for(vlan_id: u16) -> String {
        format!("10.99.{}.1/24", vlan_id)
    }

    /// Service bind address for a VLAN (router address without prefix length).
    pub fn bind_ip_for(vlan_id: u16) -> String {
        format!("10.99.{}.1", vlan_id)
    }

    /// Next hop of the default route installed in the interface's routing table.
    pub fn gateway_ip_for(vlan_id: u16) -> String {
        format!("10.99.{}.2", vlan_id)
    }

    pub fn subnet_for(vlan_id: u16) -> String {
        format!("10.99.{}.0/24", vlan_id)
    }
}

/// Provisioning status of a virtual interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceStatus {
    /// Record persisted, router commands in flight
    Creating,

    /// All router steps completed
    Active,

    /// Teardown in progress
    Removing,

    /// A provisioning step failed
    Error,
}

impl std::fmt::Display for InterfaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Active => write!(f, "active"),
            Self::Removing => write!(f, "removing"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for InterfaceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "active" => Ok(Self::Active),
            "removing" => Ok(Self::Removing),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown interface status: {}", other)),
        }
    }
}

/// Gateway process status as recorded on the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

impl std::fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for GatewayStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown gateway status: {}", other)),
        }
    }
}

/// Kind of gateway fronting the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayType {
    #[default]
    None,
    HevSocks5Tunnel,
}

impl GatewayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::HevSocks5Tunnel => "hev-socks5-tunnel",
        }
    }
}

impl std::fmt::Display for GatewayType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GatewayType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(Self::None),
            "hev-socks5-tunnel" => Ok(Self::HevSocks5Tunnel),
            other => Err(format!("unknown gateway type: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_names() {
        assert_eq!(VirtualInterface::name_for("tor", "usa"), "nnc-tor-usa");
        assert_eq!(VirtualInterface::routing_mark_for("tor", "usa"), "tor-usa");
        assert_eq!(VirtualInterface::address_for(101), "10.99.101.1/24");
        assert_eq!(VirtualInterface::bind_ip_for(101), "10.99.101.1");
        assert_eq!(VirtualInterface::gateway_ip_for(101), "10.99.101.2");
        assert_eq!(VirtualInterface::subnet_for(101), "10.99.101.0/24");
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            InterfaceStatus::Creating,
            InterfaceStatus::Active,
            InterfaceStatus::Removing,
            InterfaceStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<InterfaceStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<InterfaceStatus>().is_err());
    }

    #[test]
    fn test_gateway_type_strings() {
        assert_eq!(GatewayType::HevSocks5Tunnel.as_str(), "hev-socks5-tunnel");
        assert_eq!("".parse::<GatewayType>().unwrap(), GatewayType::None);
        assert_eq!("running".parse::<GatewayStatus>().unwrap(), GatewayStatus::Running);
    }
}
