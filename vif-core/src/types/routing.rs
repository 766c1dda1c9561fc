//! Device routing assignments and kill-switch state.

use crate::error::VifError;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// A device whose traffic is steered through a service instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRouting {
    pub id: String,
    pub router_id: String,
    pub device_id: String,
    pub mac_address: String,
    pub instance_id: String,
    pub interface_id: String,
    pub routing_mark: String,

    /// Router mangle rule that marks this device's traffic, if installed
    pub mangle_rule_id: Option<String>,

    #[serde(flatten)]
    pub kill_switch: KillSwitchState,

    pub created_at: SystemTime,
}

impl DeviceRouting {
    pub fn new(
        id: impl Into<String>,
        router_id: impl Into<String>,
        mac_address: impl Into<String>,
        instance_id: impl Into<String>,
        interface_id: impl Into<String>,
        routing_mark: impl Into<String>,
    ) -> Self {
        let mac_address = mac_address.into();
        Self {
            id: id.into(),
            router_id: router_id.into(),
            device_id: mac_address.clone(),
            mac_address,
            instance_id: instance_id.into(),
            interface_id: interface_id.into(),
            routing_mark: routing_mark.into(),
            mangle_rule_id: None,
            kill_switch: KillSwitchState::default(),
            created_at: SystemTime::now(),
        }
    }
}

/// Kill-switch fields of a device routing.
///
/// `rule_id` is set iff `enabled`; `activated_at` is set iff `active`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct KillSwitchState {
    #[serde(rename = "kill_switch_enabled")]
    pub enabled: bool,

    #[serde(rename = "kill_switch_mode")]
    pub mode: KillSwitchMode,

    #[serde(rename = "kill_switch_rule_id")]
    pub rule_id: Option<String>,

    #[serde(rename = "kill_switch_active")]
    pub active: bool,

    #[serde(rename = "kill_switch_activated_at")]
    pub activated_at: Option<SystemTime>,

    #[serde(rename = "kill_switch_fallback_interface_id")]
    pub fallback_interface_id: Option<String>,
}

impl KillSwitchState {
    /// Whether the invariants between the fields hold.
    pub fn is_consistent(&self) -> bool {
        let rule_ok = self.enabled == self.rule_id.as_deref().is_some_and(|r| !r.is_empty());
        let active_ok = self.active == self.activated_at.is_some();
        rule_ok && active_ok && (self.enabled || !self.active)
    }
}

/// What happens to a device's traffic while its kill switch is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchMode {
    /// Drop all forwarded traffic
    #[default]
    BlockAll,

    /// Re-route through another service interface
    FallbackService,

    /// Let traffic bypass the service
    AllowDirect,
}

impl KillSwitchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockAll => "block_all",
            Self::FallbackService => "fallback_service",
            Self::AllowDirect => "allow_direct",
        }
    }
}

impl std::fmt::Display for KillSwitchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KillSwitchMode {
    type Err = VifError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block_all" => Ok(Self::BlockAll),
            "fallback_service" => Ok(Self::FallbackService),
            "allow_direct" => Ok(Self::AllowDirect),
            other => Err(VifError::InvalidKillSwitchMode { mode: other.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("block_all".parse::<KillSwitchMode>().unwrap(), KillSwitchMode::BlockAll);
        assert_eq!(
            "fallback_service".parse::<KillSwitchMode>().unwrap(),
            KillSwitchMode::FallbackService
        );
        assert!(matches!(
            "drop_everything".parse::<KillSwitchMode>(),
            Err(VifError::InvalidKillSwitchMode { .. })
        ));
    }

    #[test]
    fn test_default_state_is_consistent() {
        assert!(KillSwitchState::default().is_consistent());
    }

    #[test]
    fn test_state_consistency_checks() {
        let enabled_without_rule = KillSwitchState { enabled: true, ..Default::default() };
        assert!(!enabled_without_rule.is_consistent());

        let active = KillSwitchState {
            enabled: true,
            rule_id: Some("*1".into()),
            active: true,
            activated_at: Some(SystemTime::now()),
            ..Default::default()
        };
        assert!(active.is_consistent());

        let active_without_time = KillSwitchState { activated_at: None, ..active };
        assert!(!active_without_time.is_consistent());
    }
}
