//! Configuration management.

use crate::error::{Result, VifError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Highest usable 802.1Q VLAN ID.
pub const MAX_VLAN_ID: u16 = 4094;

/// Highest VLAN ID with a valid address plan. Each VLAN gets
/// `10.99.{vlan}.0/24`, so the ID must fit in one octet.
pub const MAX_ADDRESSABLE_VLAN_ID: u16 = 255;

/// Persistent configuration for the VIF subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VifConfig {
    /// Router interface that VLAN sub-interfaces are created on.
    pub parent_interface: String,
    pub vlan_pool_start: u16,
    pub vlan_pool_end: u16,
    /// Path to the SOCKS5-to-TUN gateway binary.
    pub gateway_binary: String,
    pub tun_mtu: u32,
    pub tun_ready_timeout_ms: u64,
    pub tun_removal_timeout_ms: u64,
    pub tun_poll_interval_ms: u64,
    /// Router bridge that dual-VLAN ingress interfaces join, if any.
    pub ingress_bridge: Option<String>,
    /// Local resolver port that ingress DNS traffic is redirected to, if any.
    pub dns_redirect_port: Option<u16>,
    pub log_level: String,
    pub metrics_port: u16,
}

impl Default for VifConfig {
    fn default() -> Self {
        Self {
            parent_interface: "ether1".to_string(),
            vlan_pool_start: 100,
            vlan_pool_end: 199,
            gateway_binary: "/app/hev-socks5-tunnel".to_string(),
            tun_mtu: 8500,
            tun_ready_timeout_ms: 5000,
            tun_removal_timeout_ms: 2000,
            tun_poll_interval_ms: 100,
            ingress_bridge: None,
            dns_redirect_port: None,
            log_level: "info".to_string(),
            metrics_port: 9464,
        }
    }
}

impl VifConfig {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("vif.json")
    }

    /// Load configuration from disk, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| VifError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| VifError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::config_path())
    }

    pub fn save_to(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VifError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| VifError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(&path, content).map_err(|e| VifError::IoError { path, source: e })
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.vlan_pool_start == 0
            || self.vlan_pool_end > MAX_VLAN_ID
            || self.vlan_pool_start > self.vlan_pool_end
        {
            return Err(VifError::InvalidPoolRange {
                start: self.vlan_pool_start,
                end: self.vlan_pool_end,
                reason: format!("pool must satisfy 1 <= start <= end <= {}", MAX_VLAN_ID),
            });
        }
        if self.vlan_pool_end > MAX_ADDRESSABLE_VLAN_ID {
            return Err(VifError::InvalidPoolRange {
                start: self.vlan_pool_start,
                end: self.vlan_pool_end,
                reason: format!(
                    "VLAN IDs above {} have no 10.99.{{vlan}}.0/24 subnet",
                    MAX_ADDRESSABLE_VLAN_ID
                ),
            });
        }
        if self.tun_poll_interval_ms == 0 {
            return Err(VifError::InvalidConfig {
                reason: "tun_poll_interval_ms must be greater than zero".to_string(),
            });
        }
        if self.tun_ready_timeout_ms < self.tun_poll_interval_ms
            || self.tun_removal_timeout_ms < self.tun_poll_interval_ms
        {
            return Err(VifError::InvalidConfig {
                reason: "TUN timeouts must not be shorter than the poll interval".to_string(),
            });
        }
        if self.parent_interface.is_empty() {
            return Err(VifError::InvalidConfig {
                reason: "parent_interface must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn tun_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.tun_ready_timeout_ms)
    }

    pub fn tun_removal_timeout(&self) -> Duration {
        Duration::from_millis(self.tun_removal_timeout_ms)
    }

    pub fn tun_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tun_poll_interval_ms)
    }
}
