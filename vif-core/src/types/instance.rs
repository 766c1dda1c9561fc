//! Service instance and feature manifest types.
//!
//! A service instance carries a free-form JSON configuration. Nothing past
//! this module reads that map directly: [`InstanceNetworkConfig::from_instance`]
//! validates it once and hands out a typed view.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::SystemTime;

/// A proxy/VPN-style service instance running next to a router.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    /// Unique instance identifier
    pub id: String,

    /// Router this instance is attached to
    pub router_id: String,

    /// Feature (service kind) this instance runs, e.g. `tor`
    pub feature_id: String,

    /// Human-readable instance name, used in interface names
    pub instance_name: String,

    /// Free-form per-instance configuration
    pub config: Map<String, Value>,

    /// VLAN assigned by the bridge orchestrator
    pub vlan_id: Option<u16>,

    /// Address the service binds to on its VLAN
    pub bind_ip: Option<String>,

    pub created_at: SystemTime,
}

impl ServiceInstance {
    pub fn new(
        id: impl Into<String>,
        router_id: impl Into<String>,
        feature_id: impl Into<String>,
        instance_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            router_id: router_id.into(),
            feature_id: feature_id.into(),
            instance_name: instance_name.into(),
            config: Map::new(),
            vlan_id: None,
            bind_ip: None,
            created_at: SystemTime::now(),
        }
    }

    /// Builder-style helper for setting a config key.
    pub fn with_config(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }
}

/// Static description of a feature (service kind).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureManifest {
    /// Feature identifier, e.g. `tor`, `singbox`
    pub id: String,

    /// Container network mode; `host` means no isolation is wanted
    #[serde(default)]
    pub network_mode: String,

    #[serde(default)]
    pub service_name: String,
}

impl FeatureManifest {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self { service_name: id.clone(), id, network_mode: "bridge".to_string() }
    }

    pub fn is_host_network(&self) -> bool {
        self.network_mode == "host"
    }
}

/// Operating mode of a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ServiceMode {
    /// No mode configured
    #[default]
    Unspecified,
    Client,
    Server,
    Inbound,
    /// Service brings its own TUN device
    Tun,
    Other(String),
}

impl ServiceMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "" => Self::Unspecified,
            "client" => Self::Client,
            "server" => Self::Server,
            "inbound" => Self::Inbound,
            "tun" => Self::Tun,
            other => Self::Other(other.to_string()),
        }
    }
}

/// SOCKS5 endpoint exposed by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksEndpoint {
    pub address: String,
    pub port: u16,
}

/// Typed view of the networking keys in an instance's free-form config.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstanceNetworkConfig {
    pub mode: ServiceMode,

    /// Resolved SOCKS5 endpoint, if the config names one
    pub socks: Option<SocksEndpoint>,
}

impl InstanceNetworkConfig {
    /// Validate the instance config.
    ///
    /// The SOCKS address comes from `socks_address`, falling back to `vlan_ip`.
    /// A port without an address (or the reverse) leaves `socks` unset; a
    /// present but malformed port is an error.
    pub fn from_instance(instance: &ServiceInstance) -> Result<Self, String> {
        let config = &instance.config;

        let mode = match config.get("mode") {
            None | Some(Value::Null) => ServiceMode::Unspecified,
            Some(Value::String(s)) => ServiceMode::parse(s),
            Some(other) => return Err(format!("mode must be a string, got {}", other)),
        };

        let address = non_empty_str(config.get("socks_address"))
            .or_else(|| non_empty_str(config.get("vlan_ip")));

        let port = match config.get("socks_port") {
            None | Some(Value::Null) => None,
            Some(v) => Some(coerce_port(v)?),
        };

        let socks = match (address, port) {
            (Some(address), Some(port)) => Some(SocksEndpoint { address, port }),
            _ => None,
        };

        Ok(Self { mode, socks })
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Coerce a JSON port value into a port number in 1..=65535.
///
/// Integers, integral floats and numeric strings are accepted.
pub fn coerce_port(value: &Value) -> Result<u16, String> {
    let raw: i64 = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i
            } else if let Some(f) = n.as_f64() {
                if f.fract() != 0.0 || !f.is_finite() {
                    return Err(format!("port {} is not an integer", f));
                }
                f as i64
            } else {
                return Err(format!("port {} out of range", n));
            }
        }
        Value::String(s) => {
            s.trim().parse::<i64>().map_err(|_| format!("port {:?} is not a number", s))?
        }
        other => return Err(format!("unsupported port value: {}", other)),
    };

    if raw <= 0 || raw > 65535 {
        return Err(format!("port {} out of range (1-65535)", raw));
    }
    Ok(raw as u16)
}
