//! Error types for the virtual interface factory.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for VIF operations.
pub type Result<T> = std::result::Result<T, VifError>;

/// Main error type for the VIF subsystem.
#[derive(Error, Debug)]
pub enum VifError {
    // VLAN allocation errors
    #[error("VLAN pool exhausted on router {router_id}")]
    VlanPoolExhausted { router_id: String },

    #[error("Invalid VLAN pool range {start}-{end}: {reason}")]
    InvalidPoolRange { start: u16, end: u16, reason: String },

    // Router provisioning errors
    #[error("Provisioning {interface} failed at step {step}: {reason}")]
    ProvisioningFailed { interface: String, step: String, reason: String },

    #[error("Router command {action} {path} failed: {reason}")]
    RouterCommandFailed { path: String, action: String, reason: String },

    // Gateway errors
    #[error("Gateway already exists for instance {instance_id}")]
    GatewayAlreadyExists { instance_id: String },

    #[error("Failed to start gateway for instance {instance_id}: {reason}")]
    GatewayStartFailed { instance_id: String, reason: String },

    #[error("TUN interface {tun_name} did not change state within {timeout:?}")]
    TunTimeout { tun_name: String, timeout: Duration },

    #[error("Invalid gateway configuration for instance {instance_id}: {reason}")]
    InvalidGatewayConfig { instance_id: String, reason: String },

    // Local packet filter errors
    #[error("Forwarding rule already exists: {key}")]
    ForwardingRuleExists { key: String },

    #[error("Forwarding rule not found: {key}")]
    ForwardingRuleNotFound { key: String },

    #[error("Packet filter command failed ({rule}): {reason}")]
    PacketFilterFailed { rule: String, reason: String },

    // Kill switch errors
    #[error("Kill switch already enabled for routing {routing_id}")]
    KillSwitchAlreadyEnabled { routing_id: String },

    #[error("Kill switch not enabled for routing {routing_id}")]
    KillSwitchNotEnabled { routing_id: String },

    #[error("Invalid kill switch mode: {mode}")]
    InvalidKillSwitchMode { mode: String },

    #[error("Kill switch mode fallback_service requires a fallback interface (routing {routing_id})")]
    FallbackInterfaceRequired { routing_id: String },

    // Orchestration errors
    #[error("Another bridge operation is in progress for instance {instance_id}")]
    OperationInProgress { instance_id: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VifError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Shorthand for a `NotFound` error.
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Self::NotFound { kind: kind.to_string(), id: id.into() }
    }

    /// Whether this error means the referenced entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
