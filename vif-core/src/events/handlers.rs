//! Cascade cleanup of device routings.
//!
//! When an interface or a service instance goes away, every device routing
//! that points at it is removed. One failing routing never blocks the rest;
//! the outcome is reported as counts.

use super::{Event, EventBus, EventPayload, EventType};
use crate::error::Result;
use crate::isolation::rules;
use crate::router::{execute_checked, RouterPort, PATH_MANGLE};
use crate::state::StateManager;
use crate::types::DeviceRouting;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Removes a single device routing.
#[async_trait]
pub trait RoutingRemover: Send + Sync {
    async fn remove_routing(&self, routing: &DeviceRouting) -> Result<()>;
}

/// Removes the routing's router rules, then its DB row.
pub struct RouterRoutingRemover {
    router: Arc<dyn RouterPort>,
    state: Arc<StateManager>,
}

impl RouterRoutingRemover {
    pub fn new(router: Arc<dyn RouterPort>, state: Arc<StateManager>) -> Self {
        Self { router, state }
    }
}

#[async_trait]
impl RoutingRemover for RouterRoutingRemover {
    async fn remove_routing(&self, routing: &DeviceRouting) -> Result<()> {
        if let Some(id) = &routing.mangle_rule_id {
            if let Err(e) = execute_checked(self.router.as_ref(), &rules::remove_rule(PATH_MANGLE, id)).await {
                warn!(routing_id = %routing.id, error = %e, "Failed to remove mangle rule");
            }
        }

        if let Some(id) = &routing.kill_switch.rule_id {
            let path = rules::rule_path(routing.kill_switch.mode);
            if let Err(e) = execute_checked(self.router.as_ref(), &rules::remove_rule(path, id)).await {
                warn!(routing_id = %routing.id, error = %e, "Failed to remove kill switch rule");
            }
        }

        if !self.state.delete_routing(&routing.id).await? {
            debug!(routing_id = %routing.id, "Routing already deleted");
        }
        Ok(())
    }
}

/// Aggregate result of one cascade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub matched: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CascadeTarget {
    Interface(String),
    Instance(String),
}

fn is_removal_status(status: &str) -> bool {
    matches!(status, "removed" | "deleted")
}

/// Work out what an event refers to, if it calls for a cascade.
fn cascade_target(event: &Event) -> Option<CascadeTarget> {
    match &event.payload {
        EventPayload::ServiceInstanceRemoved { instance_id } => {
            return Some(CascadeTarget::Instance(instance_id.clone()));
        }
        EventPayload::InterfaceStatusChanged { interface_id, new_status, .. }
            if event.is(EventType::InterfaceRemoved) || is_removal_status(new_status) =>
        {
            return Some(CascadeTarget::Interface(interface_id.clone()));
        }
        EventPayload::InterfaceStatusChanged { .. } => return None,
        _ => {}
    }

    // Generic events carry their fields in metadata
    let meta = |key: &str| event.metadata.get(key).filter(|v| !v.is_empty()).cloned();
    if event.is(EventType::ServiceInstanceRemoved) {
        return meta("instance_id").map(CascadeTarget::Instance);
    }
    if event.is(EventType::InterfaceRemoved)
        || (event.is(EventType::InterfaceStatusChanged)
            && meta("new_status").is_some_and(|s| is_removal_status(&s)))
    {
        return meta("interface_id").map(CascadeTarget::Interface);
    }
    None
}

/// Deletes device routings whose interface or instance is gone.
pub struct CascadeHandler {
    state: Arc<StateManager>,
    remover: Arc<dyn RoutingRemover>,
}

impl CascadeHandler {
    pub fn new(state: Arc<StateManager>, remover: Arc<dyn RoutingRemover>) -> Self {
        Self { state, remover }
    }

    /// Handle one event. `None` if the event does not call for a cascade.
    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn handle_event(&self, event: &Event) -> Option<CascadeReport> {
        let target = cascade_target(event)?;
        let routings = match &target {
            CascadeTarget::Interface(id) => self.state.list_routings_by_interface(id).await,
            CascadeTarget::Instance(id) => self.state.list_routings_by_instance(id).await,
        };
        let routings = match routings {
            Ok(routings) => routings,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => {
                warn!(?target, error = %e, "Failed to query routings for cascade");
                return Some(CascadeReport::default());
            }
        };

        let mut report = CascadeReport { matched: routings.len(), ..Default::default() };
        for routing in &routings {
            match self.remover.remove_routing(routing).await {
                Ok(()) => report.removed += 1,
                Err(e) if e.is_not_found() => report.removed += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(routing_id = %routing.id, error = %e, "Failed to remove routing");
                }
            }
        }

        if report.matched > 0 {
            info!(
                ?target,
                matched = report.matched,
                removed = report.removed,
                failed = report.failed,
                "Cascade cleanup complete"
            );
        }
        Some(report)
    }

    /// Consume removal events from the bus until it closes.
    pub fn spawn(self: Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        let mut subscriber = events.subscribe(vec![
            EventType::InterfaceRemoved.as_str().to_string(),
            EventType::InterfaceStatusChanged.as_str().to_string(),
            EventType::ServiceInstanceRemoved.as_str().to_string(),
        ]);
        tokio::spawn(async move {
            while let Some(event) = subscriber.recv().await {
                self.handle_event(&event).await;
            }
            debug!("Cascade handler stopped");
        })
    }
}
