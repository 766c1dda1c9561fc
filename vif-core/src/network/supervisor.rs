//! Process supervisor contract.
//!
//! The supervisor itself (restart policy, log capture, signal handling) lives
//! outside this crate. Gateways only register, start, stop and query processes.

use crate::error::Result;
use crate::network::link::LinkProbe;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;

/// Liveness check attached to a supervised process.
pub trait HealthProbe: Send + Sync {
    fn is_healthy(&self) -> bool;
}

/// Healthy iff the named TUN device exists.
pub struct TunHealthProbe {
    tun_name: String,
    links: Arc<dyn LinkProbe>,
}

impl TunHealthProbe {
    pub fn new(tun_name: impl Into<String>, links: Arc<dyn LinkProbe>) -> Self {
        Self { tun_name: tun_name.into(), links }
    }

    pub fn tun_name(&self) -> &str {
        &self.tun_name
    }
}

impl HealthProbe for TunHealthProbe {
    fn is_healthy(&self) -> bool {
        self.links.link_exists(&self.tun_name)
    }
}

/// A process definition handed to the supervisor.
#[derive(Clone)]
pub struct ManagedProcess {
    pub id: String,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub auto_restart: bool,
    pub health_probe: Option<Arc<dyn HealthProbe>>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("auto_restart", &self.auto_restart)
            .field("health_probe", &self.health_probe.is_some())
            .finish()
    }
}

/// Supervisor-reported process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub id: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub restarts: u32,
}

/// Supervisor operations keyed by process ID.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn add(&self, process: ManagedProcess) -> Result<()>;
    async fn start(&self, id: &str) -> Result<()>;
    async fn stop(&self, id: &str) -> Result<()>;
    /// `None` if the process is not registered.
    async fn get(&self, id: &str) -> Option<ProcessInfo>;
    async fn remove(&self, id: &str) -> Result<()>;
}
