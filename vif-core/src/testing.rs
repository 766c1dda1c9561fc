//! In-process test doubles for the external collaborators.

use crate::error::{Result, VifError};
use crate::network::container::{FilterRule, PacketFilter};
use crate::network::ingress::{DhcpServer, IngressDhcpConfig};
use crate::network::link::LinkProbe;
use crate::network::supervisor::{ManagedProcess, ProcessInfo, ProcessState, ProcessSupervisor};
use crate::router::{CommandResult, RouterCommand, RouterPort};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

// ======================== Router ========================

#[derive(Default)]
struct RouterState {
    commands: Vec<RouterCommand>,
    failures: HashSet<(String, String)>,
    items: HashMap<String, Vec<HashMap<String, String>>>,
    next_id: u32,
}

/// Router that records every command and keeps a per-path item table, so
/// `print` reflects earlier `add`/`set`/`remove` calls.
#[derive(Default)]
pub(crate) struct RecordingRouter {
    state: Mutex<RouterState>,
}

fn row_matches(row: &HashMap<String, String>, cmd: &RouterCommand) -> bool {
    if let Some(id) = &cmd.id {
        return row.get(".id") == Some(id);
    }
    if let Some(numbers) = cmd.args.get("numbers") {
        return ["name", "address", ".id"].iter().any(|k| row.get(*k) == Some(numbers));
    }
    !cmd.args.is_empty() && cmd.args.iter().all(|(k, v)| row.get(k) == Some(v))
}

impl RecordingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every subsequent `action` on `path`.
    pub fn fail_on(&self, path: &str, action: &str) {
        self.state.lock().unwrap().failures.insert((path.to_string(), action.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// Insert an item directly, bypassing the command log. Returns its ID.
    pub fn seed(&self, path: &str, fields: &[(&str, &str)]) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("*{}", state.next_id);
        let mut row: HashMap<String, String> =
            fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        row.insert(".id".to_string(), id.clone());
        state.items.entry(path.to_string()).or_default().push(row);
        id
    }

    pub fn commands(&self) -> Vec<RouterCommand> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Commands formatted as `path action`.
    pub fn command_log(&self) -> Vec<String> {
        self.commands().iter().map(|c| format!("{} {}", c.path, c.action)).collect()
    }

    pub fn count(&self, path: &str, action: &str) -> usize {
        self.commands().iter().filter(|c| c.path == path && c.action == action).count()
    }

    pub fn items(&self, path: &str) -> Vec<HashMap<String, String>> {
        self.state.lock().unwrap().items.get(path).cloned().unwrap_or_default()
    }

    pub fn item(&self, path: &str, id: &str) -> Option<HashMap<String, String>> {
        self.items(path).into_iter().find(|r| r.get(".id").map(String::as_str) == Some(id))
    }
}

#[async_trait]
impl RouterPort for RecordingRouter {
    async fn execute(&self, cmd: &RouterCommand) -> Result<CommandResult> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(cmd.clone());

        if state.failures.contains(&(cmd.path.clone(), cmd.action.clone())) {
            return Ok(CommandResult::failed("injected failure"));
        }

        match cmd.action.as_str() {
            "add" => {
                state.next_id += 1;
                let id = format!("*{}", state.next_id);
                let mut row = cmd.args.clone().into_iter().collect::<HashMap<_, _>>();
                row.insert(".id".to_string(), id.clone());
                state.items.entry(cmd.path.clone()).or_default().push(row);
                Ok(CommandResult::created(id))
            }
            "remove" => {
                let rows = state.items.entry(cmd.path.clone()).or_default();
                let before = rows.len();
                rows.retain(|r| !row_matches(r, cmd));
                if rows.len() == before {
                    Ok(CommandResult::failed("no such item"))
                } else {
                    Ok(CommandResult::ok())
                }
            }
            "set" => {
                // `set` targets by ID only; its args are the new values.
                let rows = state.items.entry(cmd.path.clone()).or_default();
                let mut found = false;
                for row in rows.iter_mut().filter(|r| cmd.id.is_some() && r.get(".id") == cmd.id.as_ref()) {
                    for (k, v) in &cmd.args {
                        row.insert(k.clone(), v.clone());
                    }
                    found = true;
                }
                if found {
                    Ok(CommandResult::ok())
                } else {
                    Ok(CommandResult::failed("no such item"))
                }
            }
            "print" => {
                let rows = state
                    .items
                    .get(&cmd.path)
                    .map(|rows| {
                        rows.iter()
                            .filter(|r| cmd.query.iter().all(|(k, v)| r.get(k) == Some(v)))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(CommandResult::rows(rows))
            }
            _ => Ok(CommandResult::ok()),
        }
    }
}

// ======================== Links ========================

/// Mutable stand-in for the host interface table.
#[derive(Default)]
pub(crate) struct FakeLinkTable {
    links: Mutex<HashSet<String>>,
}

impl FakeLinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str) {
        self.links.lock().unwrap().insert(name.to_string());
    }

    pub fn remove(&self, name: &str) {
        self.links.lock().unwrap().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.links.lock().unwrap().contains(name)
    }
}

impl LinkProbe for FakeLinkTable {
    fn link_exists(&self, name: &str) -> bool {
        self.contains(name)
    }
}

// ======================== Supervisor ========================

#[derive(Default)]
struct SupervisorState {
    processes: HashMap<String, (ManagedProcess, ProcessInfo)>,
    tun_names: HashMap<String, String>,
    calls: Vec<String>,
    fail_start: bool,
    links: Option<Arc<FakeLinkTable>>,
    next_pid: u32,
}

/// Supervisor that records calls and optionally creates the TUN device named
/// in the gateway config when a process starts.
#[derive(Default)]
pub(crate) struct ScriptedSupervisor {
    state: Mutex<SupervisorState>,
}

fn tun_name_from_config(path: &str) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let value: serde_yaml::Value = serde_yaml::from_str(&content).ok()?;
    value.get("tunnel")?.get("name")?.as_str().map(String::from)
}

impl ScriptedSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Started processes bring their TUN up in `links`; stopping takes it down.
    pub fn bring_up_links(&self, links: Arc<FakeLinkTable>) {
        self.state.lock().unwrap().links = Some(links);
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    pub fn process(&self, id: &str) -> Option<ManagedProcess> {
        self.state.lock().unwrap().processes.get(id).map(|(p, _)| p.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Drop a process without going through `remove`.
    pub fn forget(&self, id: &str) {
        self.state.lock().unwrap().processes.remove(id);
    }

    pub fn set_state(&self, id: &str, process_state: ProcessState) {
        if let Some((_, info)) = self.state.lock().unwrap().processes.get_mut(id) {
            info.state = process_state;
        }
    }
}

#[async_trait]
impl ProcessSupervisor for ScriptedSupervisor {
    async fn add(&self, process: ManagedProcess) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("add:{}", process.id));
        let info = ProcessInfo {
            id: process.id.clone(),
            state: ProcessState::Registered,
            pid: None,
            started_at: None,
            restarts: 0,
        };
        state.processes.insert(process.id.clone(), (process, info));
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start:{}", id));
        if state.fail_start {
            return Err(VifError::Internal("spawn refused".to_string()));
        }

        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        let config_arg = {
            let (process, info) =
                state.processes.get_mut(id).ok_or_else(|| VifError::not_found("process", id))?;
            info.state = ProcessState::Running;
            info.pid = Some(pid);
            info.started_at = Some(SystemTime::now());
            process.args.first().cloned()
        };

        if let (Some(links), Some(tun)) =
            (state.links.clone(), config_arg.as_deref().and_then(tun_name_from_config))
        {
            links.add(&tun);
            state.tun_names.insert(id.to_string(), tun);
        }
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("stop:{}", id));
        if let Some((_, info)) = state.processes.get_mut(id) {
            info.state = ProcessState::Stopped;
            info.pid = None;
        }
        if let (Some(links), Some(tun)) = (state.links.clone(), state.tun_names.remove(id)) {
            links.remove(&tun);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Option<ProcessInfo> {
        self.state.lock().unwrap().processes.get(id).map(|(_, info)| info.clone())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove:{}", id));
        state.processes.remove(id);
        Ok(())
    }
}

// ======================== Packet filter ========================

#[derive(Default)]
struct FilterState {
    active: Vec<FilterRule>,
    append_calls: usize,
    fail_append_call: usize,
}

/// Packet filter keeping installed rules in order.
#[derive(Default)]
pub(crate) struct RecordingPacketFilter {
    state: Mutex<FilterState>,
}

impl RecordingPacketFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`th append from now (1-based). `0` disables injection.
    pub fn fail_append_call(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.append_calls = 0;
        state.fail_append_call = n;
    }

    pub fn active_rules(&self) -> Vec<FilterRule> {
        self.state.lock().unwrap().active.clone()
    }
}

#[async_trait]
impl PacketFilter for RecordingPacketFilter {
    async fn append(&self, rule: &FilterRule) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.append_calls += 1;
        if state.fail_append_call != 0 && state.append_calls == state.fail_append_call {
            return Err(VifError::PacketFilterFailed {
                rule: rule.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        state.active.push(rule.clone());
        Ok(())
    }

    async fn delete(&self, rule: &FilterRule) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.active.iter().position(|r| r == rule) {
            Some(idx) => {
                state.active.remove(idx);
                Ok(())
            }
            None => Err(VifError::PacketFilterFailed {
                rule: rule.to_string(),
                reason: "no such rule".to_string(),
            }),
        }
    }
}

// ======================== DHCP ========================

#[derive(Default)]
struct DhcpState {
    running: HashMap<u16, IngressDhcpConfig>,
    fail_start: bool,
}

#[derive(Default)]
pub(crate) struct FakeDhcp {
    state: Mutex<DhcpState>,
}

impl FakeDhcp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    pub fn running(&self, vlan_id: u16) -> Option<IngressDhcpConfig> {
        self.state.lock().unwrap().running.get(&vlan_id).cloned()
    }
}

#[async_trait]
impl DhcpServer for FakeDhcp {
    async fn start_server(&self, config: &IngressDhcpConfig) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_start {
            return Err(VifError::Internal("dhcp daemon failed to start".to_string()));
        }
        state.running.insert(config.vlan_id, config.clone());
        Ok(())
    }

    async fn stop_server(&self, vlan_id: u16) -> Result<()> {
        self.state.lock().unwrap().running.remove(&vlan_id);
        Ok(())
    }
}
