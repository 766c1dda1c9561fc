//! Drives kill switches from service health events.

use super::KillSwitchManager;
use crate::events::{Event, EventBus, EventPayload, EventType, HealthState};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a health event did to an instance's kill switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthReaction {
    Suspended(usize),
    Resumed(usize),
}

/// Activates kill switches when an instance turns unhealthy and deactivates
/// them when it recovers. Failures are logged; the next health event or
/// reconciliation pass retries.
pub struct KillSwitchListener {
    manager: Arc<KillSwitchManager>,
}

impl KillSwitchListener {
    pub fn new(manager: Arc<KillSwitchManager>) -> Self {
        Self { manager }
    }

    /// Handle one event. `None` for events that are not health transitions.
    pub async fn handle_event(&self, event: &Event) -> Option<HealthReaction> {
        let EventPayload::HealthChanged { instance_id, previous, current } = &event.payload else {
            return None;
        };

        match (previous, current) {
            (HealthState::Healthy, HealthState::Unhealthy) => {
                match self.manager.suspend_routing(instance_id).await {
                    Ok(count) => {
                        if count > 0 {
                            warn!(instance_id = %instance_id, count, "Service unhealthy, kill switches activated");
                        }
                        Some(HealthReaction::Suspended(count))
                    }
                    Err(e) => {
                        warn!(instance_id = %instance_id, error = %e, "Failed to activate kill switches");
                        None
                    }
                }
            }
            (HealthState::Unhealthy, HealthState::Healthy) => {
                match self.manager.resume_routing(instance_id).await {
                    Ok(count) => {
                        if count > 0 {
                            info!(instance_id = %instance_id, count, "Service recovered, kill switches deactivated");
                        }
                        Some(HealthReaction::Resumed(count))
                    }
                    Err(e) => {
                        warn!(instance_id = %instance_id, error = %e, "Failed to deactivate kill switches");
                        None
                    }
                }
            }
            _ => {
                debug!(instance_id = %instance_id, ?previous, ?current, "Ignoring health event");
                None
            }
        }
    }

    /// Consume health events from the bus until it closes.
    pub fn spawn(self: Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        let mut subscriber = events.subscribe(vec![EventType::ServiceHealthChanged.as_str().to_string()]);
        tokio::spawn(async move {
            while let Some(event) = subscriber.recv().await {
                self.handle_event(&event).await;
            }
            debug!("Kill switch listener stopped");
        })
    }
}
