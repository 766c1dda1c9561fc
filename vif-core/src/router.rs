//! Router command protocol.
//!
//! The managed router is driven through an abstract command/result contract.
//! Session handling and the wire format belong to the [`RouterPort`]
//! implementation; this crate only builds commands and interprets results.

use crate::error::{Result, VifError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

pub const PATH_VLAN: &str = "/interface/vlan";
pub const PATH_IP_ADDRESS: &str = "/ip/address";
pub const PATH_ROUTING_TABLE: &str = "/routing/table";
pub const PATH_ROUTE: &str = "/ip/route";
pub const PATH_FILTER: &str = "/ip/firewall/filter";
pub const PATH_MANGLE: &str = "/ip/firewall/mangle";
pub const PATH_DHCP_CLIENT: &str = "/ip/dhcp-client";
pub const PATH_BRIDGE_PORT: &str = "/interface/bridge/port";
pub const PATH_NETWATCH: &str = "/tool/netwatch";

/// A single router command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouterCommand {
    /// Menu path, e.g. `/interface/vlan`
    pub path: String,
    /// `add`, `remove`, `set`, `print`
    pub action: String,
    /// Target item ID for `set`/`remove` by ID
    pub id: Option<String>,
    pub args: BTreeMap<String, String>,
    /// Match conditions for `print`
    pub query: BTreeMap<String, String>,
}

impl RouterCommand {
    pub fn new(path: &str, action: &str) -> Self {
        Self { path: path.to_string(), action: action.to_string(), ..Default::default() }
    }

    pub fn add(path: &str) -> Self {
        Self::new(path, "add")
    }

    pub fn remove(path: &str) -> Self {
        Self::new(path, "remove")
    }

    pub fn set(path: &str) -> Self {
        Self::new(path, "set")
    }

    pub fn print(path: &str) -> Self {
        Self::new(path, "print")
    }

    pub fn arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn filter(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

impl std::fmt::Display for RouterCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.path, self.action)?;
        if let Some(id) = &self.id {
            write!(f, " .id={}", id)?;
        }
        for (k, v) in &self.args {
            write!(f, " {}={}", k, v)?;
        }
        Ok(())
    }
}

/// Result of a router command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandResult {
    pub success: bool,
    /// ID of a created item
    pub id: Option<String>,
    /// Rows returned by `print`
    pub data: Vec<HashMap<String, String>>,
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self { success: true, ..Default::default() }
    }

    pub fn created(id: impl Into<String>) -> Self {
        Self { success: true, id: Some(id.into()), ..Default::default() }
    }

    pub fn rows(data: Vec<HashMap<String, String>>) -> Self {
        Self { success: true, data, ..Default::default() }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), ..Default::default() }
    }
}

/// Router command client.
///
/// Implementations own authentication and transport. Each router is managed
/// independently; there is no cross-command transaction.
#[async_trait]
pub trait RouterPort: Send + Sync {
    /// Execute a command. Transport failures are `Err`; rejected commands
    /// come back as `Ok` with `success == false`.
    async fn execute(&self, cmd: &RouterCommand) -> Result<CommandResult>;
}

/// Execute a command and fold a rejected result into an error.
pub async fn execute_checked(router: &dyn RouterPort, cmd: &RouterCommand) -> Result<CommandResult> {
    let result = router.execute(cmd).await.map_err(|e| VifError::RouterCommandFailed {
        path: cmd.path.clone(),
        action: cmd.action.clone(),
        reason: e.to_string(),
    })?;

    if !result.success {
        return Err(VifError::RouterCommandFailed {
            path: cmd.path.clone(),
            action: cmd.action.clone(),
            reason: result.error.unwrap_or_else(|| "command rejected".to_string()),
        });
    }

    Ok(result)
}

/// Interpret a router boolean field (`"true"`/`"yes"`).
pub fn parse_flag(value: Option<&String>) -> bool {
    matches!(value.map(String::as_str), Some("true") | Some("yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRouter;

    #[test]
    fn test_command_builder() {
        let cmd = RouterCommand::add(PATH_VLAN)
            .arg("name", "nnc-tor-usa")
            .arg("vlan-id", "101")
            .arg("interface", "ether1");
        assert_eq!(cmd.action, "add");
        assert_eq!(cmd.get("vlan-id"), Some("101"));
        assert_eq!(cmd.to_string(), "/interface/vlan add interface=ether1 name=nnc-tor-usa vlan-id=101");
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag(Some(&"true".to_string())));
        assert!(parse_flag(Some(&"yes".to_string())));
        assert!(!parse_flag(Some(&"no".to_string())));
        assert!(!parse_flag(None));
    }

    #[tokio::test]
    async fn test_execute_checked_maps_rejection() {
        let router = RecordingRouter::new();
        router.fail_on(PATH_ROUTE, "add");

        let cmd = RouterCommand::add(PATH_ROUTE).arg("dst-address", "0.0.0.0/0");
        let err = execute_checked(&router, &cmd).await.unwrap_err();
        assert!(matches!(err, VifError::RouterCommandFailed { ref path, .. } if path == PATH_ROUTE));

        let ok = execute_checked(&router, &RouterCommand::add(PATH_VLAN)).await.unwrap();
        assert!(ok.success);
    }
}
