//! Per-device kill switches.
//!
//! A kill switch is a router rule matched on a device's MAC address that is
//! created once in the disabled state and then only toggled: enabled while
//! the device's service is unhealthy, disabled otherwise.

pub mod listener;
pub mod rules;

use crate::error::{Result, VifError};
use crate::events::{Event, EventBus, EventType};
use crate::router::{execute_checked, RouterCommand, RouterPort, PATH_FILTER, PATH_MANGLE};
use crate::state::StateManager;
use crate::types::{DeviceRouting, KillSwitchMode, KillSwitchState};
use async_trait::async_trait;
use rules::RouterRule;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, instrument, warn};

pub use listener::KillSwitchListener;

/// Current health of service instances.
#[async_trait]
pub trait HealthSource: Send + Sync {
    /// `None` when the instance's health is unknown.
    async fn is_healthy(&self, instance_id: &str) -> Option<bool>;
}

/// Outcome of a kill-switch reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillSwitchReconcileReport {
    /// Rules on the router with no DB record
    pub orphaned: usize,
    /// DB records whose rule is missing on the router
    pub missing: usize,
    /// Rules whose disabled flag disagrees with the DB
    pub mismatched: usize,
    /// Active kill switches whose instance is healthy
    pub stale: usize,
    pub removed: usize,
    pub recreated: usize,
    pub fixed: usize,
    pub deactivated: usize,
    pub errors: Vec<String>,
}

/// Manages kill-switch rules on one router.
pub struct KillSwitchManager {
    router: Arc<dyn RouterPort>,
    state: Arc<StateManager>,
    events: EventBus,
    health: Option<Arc<dyn HealthSource>>,
}

impl KillSwitchManager {
    pub fn new(router: Arc<dyn RouterPort>, state: Arc<StateManager>, events: EventBus) -> Self {
        Self { router, state, events, health: None }
    }

    /// Attach a health source, enabling stale-activation repair in reconciliation.
    pub fn with_health_source(mut self, health: Arc<dyn HealthSource>) -> Self {
        self.health = Some(health);
        self
    }

    fn publish(&self, event_type: EventType, routing: &DeviceRouting, message: &str) {
        self.events.publish(
            Event::new(event_type, &routing.id, message)
                .with_metadata("routing_id", &routing.id)
                .with_metadata("instance_id", &routing.instance_id)
                .with_metadata("mac_address", &routing.mac_address)
                .with_metadata("mode", routing.kill_switch.mode),
        );
    }

    async fn fallback_mark(&self, fallback_interface_id: &str) -> Result<String> {
        let vif = self.state.get_interface(fallback_interface_id).await?;
        if vif.routing_mark.is_empty() {
            return Err(VifError::InvalidConfig {
                reason: format!("fallback interface {} has no routing mark", fallback_interface_id),
            });
        }
        Ok(vif.routing_mark)
    }

    /// Create a rule on the router and return its ID.
    async fn create_rule(
        &self,
        routing: &DeviceRouting,
        mode: KillSwitchMode,
        fallback_interface_id: Option<&str>,
        disabled: bool,
    ) -> Result<String> {
        let mark = match (mode, fallback_interface_id) {
            (KillSwitchMode::FallbackService, Some(id)) => Some(self.fallback_mark(id).await?),
            (KillSwitchMode::FallbackService, None) => {
                return Err(VifError::FallbackInterfaceRequired { routing_id: routing.id.clone() })
            }
            _ => None,
        };

        let cmd = rules::create_rule(routing, mode, mark.as_deref(), disabled);
        let result = execute_checked(self.router.as_ref(), &cmd).await?;
        result.id.filter(|id| !id.is_empty()).ok_or_else(|| VifError::RouterCommandFailed {
            path: cmd.path.clone(),
            action: cmd.action.clone(),
            reason: "router did not return .id for created rule".to_string(),
        })
    }

    async fn remove_rule_best_effort(&self, path: &str, rule_id: &str) {
        if let Err(e) = execute_checked(self.router.as_ref(), &rules::remove_rule(path, rule_id)).await {
            warn!(rule_id, error = %e, "Failed to remove kill switch rule");
        }
    }

    /// Pre-create a disabled kill-switch rule for a routing.
    #[instrument(skip(self), fields(routing_id = %routing_id))]
    pub async fn enable(
        &self,
        routing_id: &str,
        mode: KillSwitchMode,
        fallback_interface_id: Option<&str>,
    ) -> Result<DeviceRouting> {
        let mut routing = self.state.get_routing(routing_id).await?;
        if mode == KillSwitchMode::FallbackService && fallback_interface_id.is_none() {
            return Err(VifError::FallbackInterfaceRequired { routing_id: routing_id.to_string() });
        }
        if routing.kill_switch.enabled {
            return Err(VifError::KillSwitchAlreadyEnabled { routing_id: routing_id.to_string() });
        }

        let rule_id = self.create_rule(&routing, mode, fallback_interface_id, true).await?;
        let ks = KillSwitchState {
            enabled: true,
            mode,
            rule_id: Some(rule_id.clone()),
            active: false,
            activated_at: None,
            fallback_interface_id: fallback_interface_id.map(String::from),
        };

        if let Err(e) = self.state.update_kill_switch(routing_id, &ks).await {
            self.remove_rule_best_effort(rules::rule_path(mode), &rule_id).await;
            return Err(e);
        }
        routing.kill_switch = ks;

        info!(mode = %mode, rule_id = %rule_id, "Kill switch enabled");
        self.publish(EventType::KillSwitchEnabled, &routing, "Kill switch enabled");
        Ok(routing)
    }

    /// Remove a routing's kill-switch rule and clear its kill-switch fields.
    #[instrument(skip(self), fields(routing_id = %routing_id))]
    pub async fn disable(&self, routing_id: &str) -> Result<()> {
        let routing = self.state.get_routing(routing_id).await?;
        if !routing.kill_switch.enabled {
            return Err(VifError::KillSwitchNotEnabled { routing_id: routing_id.to_string() });
        }

        if let Some(rule_id) = &routing.kill_switch.rule_id {
            let cmd = rules::remove_rule(rules::rule_path(routing.kill_switch.mode), rule_id);
            execute_checked(self.router.as_ref(), &cmd).await?;
        }
        self.state.update_kill_switch(routing_id, &KillSwitchState::default()).await?;

        info!("Kill switch disabled");
        self.publish(EventType::KillSwitchDisabled, &routing, "Kill switch disabled");
        Ok(())
    }

    /// Turn the kill switch on. No-op if already active.
    #[instrument(skip(self), fields(routing_id = %routing_id))]
    pub async fn activate(&self, routing_id: &str) -> Result<()> {
        self.set_active(routing_id, true).await
    }

    /// Turn the kill switch off. No-op if already inactive.
    #[instrument(skip(self), fields(routing_id = %routing_id))]
    pub async fn deactivate(&self, routing_id: &str) -> Result<()> {
        self.set_active(routing_id, false).await
    }

    async fn set_active(&self, routing_id: &str, active: bool) -> Result<()> {
        let routing = self.state.get_routing(routing_id).await?;
        let ks = &routing.kill_switch;
        let rule_id = match (&ks.rule_id, ks.enabled) {
            (Some(id), true) => id.clone(),
            _ => return Err(VifError::KillSwitchNotEnabled { routing_id: routing_id.to_string() }),
        };
        if ks.active == active {
            debug!(active, "Kill switch already in requested state");
            return Ok(());
        }

        let path = rules::rule_path(ks.mode);
        execute_checked(self.router.as_ref(), &rules::toggle_rule(path, &rule_id, active)).await?;

        let updated = KillSwitchState {
            active,
            activated_at: active.then(SystemTime::now),
            ..ks.clone()
        };
        if let Err(e) = self.state.update_kill_switch(routing_id, &updated).await {
            let undo = rules::toggle_rule(path, &rule_id, !active);
            if let Err(undo_err) = execute_checked(self.router.as_ref(), &undo).await {
                warn!(error = %undo_err, "Failed to roll back kill switch toggle");
            }
            return Err(e);
        }

        if active {
            warn!(mac = %routing.mac_address, instance_id = %routing.instance_id, "Kill switch activated");
            metrics::counter!("nnc_killswitch_activations_total", "mode" => ks.mode.as_str())
                .increment(1);
            self.publish(EventType::KillSwitchActivated, &routing, "Kill switch activated");
        } else {
            info!(mac = %routing.mac_address, instance_id = %routing.instance_id, "Kill switch deactivated");
            metrics::counter!("nnc_killswitch_deactivations_total", "mode" => ks.mode.as_str())
                .increment(1);
            self.publish(EventType::KillSwitchDeactivated, &routing, "Kill switch deactivated");
        }
        Ok(())
    }

    // ======================== Instance-wide Operations ========================

    /// Activate every enabled kill switch routed through an instance.
    ///
    /// Returns how many were activated. Individual failures are logged.
    #[instrument(skip(self))]
    pub async fn suspend_routing(&self, instance_id: &str) -> Result<usize> {
        self.set_instance_active(instance_id, true).await
    }

    /// Deactivate every active kill switch routed through an instance.
    #[instrument(skip(self))]
    pub async fn resume_routing(&self, instance_id: &str) -> Result<usize> {
        self.set_instance_active(instance_id, false).await
    }

    async fn set_instance_active(&self, instance_id: &str, active: bool) -> Result<usize> {
        let routings = self.state.list_routings_by_instance(instance_id).await?;
        let mut changed = 0;
        for routing in routings
            .iter()
            .filter(|r| r.kill_switch.enabled && r.kill_switch.active != active)
        {
            match self.set_active(&routing.id, active).await {
                Ok(()) => changed += 1,
                Err(e) => warn!(routing_id = %routing.id, active, error = %e, "Kill switch toggle failed"),
            }
        }
        Ok(changed)
    }

    /// MAC addresses of devices whose kill switch is active for an instance.
    pub async fn suspended_devices(&self, instance_id: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .list_routings_by_instance(instance_id)
            .await?
            .into_iter()
            .filter(|r| r.kill_switch.enabled && r.kill_switch.active)
            .map(|r| r.mac_address)
            .collect())
    }

    pub async fn is_suspended(&self, instance_id: &str) -> Result<bool> {
        Ok(!self.suspended_devices(instance_id).await?.is_empty())
    }

    // ======================== Reconciliation ========================

    async fn list_router_rules(&self) -> Result<Vec<RouterRule>> {
        let mut found = Vec::new();
        for path in [PATH_FILTER, PATH_MANGLE] {
            let result = execute_checked(self.router.as_ref(), &RouterCommand::print(path)).await?;
            found.extend(result.data.iter().filter_map(|row| RouterRule::from_row(path, row)));
        }
        Ok(found)
    }

    /// Repair drift between DB kill-switch state and router rules.
    #[instrument(skip(self))]
    pub async fn reconcile_router(&self, router_id: &str) -> Result<KillSwitchReconcileReport> {
        let mut report = KillSwitchReconcileReport::default();
        let routings = self.state.list_kill_switch_enabled(router_id).await?;
        let router_rules = self.list_router_rules().await?;

        let expected: HashSet<&str> =
            routings.iter().filter_map(|r| r.kill_switch.rule_id.as_deref()).collect();
        let by_id: HashMap<&str, &RouterRule> =
            router_rules.iter().map(|r| (r.id.as_str(), r)).collect();

        for rule in router_rules.iter().filter(|r| !expected.contains(r.id.as_str())) {
            report.orphaned += 1;
            match execute_checked(self.router.as_ref(), &rules::remove_rule(rule.path, &rule.id)).await {
                Ok(_) => report.removed += 1,
                Err(e) => report.errors.push(format!("remove orphaned rule {}: {}", rule.id, e)),
            }
        }

        for routing in &routings {
            let ks = &routing.kill_switch;
            let Some(rule_id) = ks.rule_id.as_deref() else { continue };

            match by_id.get(rule_id) {
                None => {
                    report.missing += 1;
                    self.recreate_rule(routing, &mut report).await;
                }
                Some(rule) if rule.disabled == ks.active => {
                    report.mismatched += 1;
                    let cmd = rules::toggle_rule(rule.path, rule_id, ks.active);
                    match execute_checked(self.router.as_ref(), &cmd).await {
                        Ok(_) => report.fixed += 1,
                        Err(e) => report.errors.push(format!("fix rule state for {}: {}", routing.id, e)),
                    }
                }
                Some(_) => {}
            }
        }

        if let Some(health) = &self.health {
            for routing in routings.iter().filter(|r| r.kill_switch.active) {
                if health.is_healthy(&routing.instance_id).await == Some(true) {
                    report.stale += 1;
                    match self.deactivate(&routing.id).await {
                        Ok(()) => report.deactivated += 1,
                        Err(e) => report.errors.push(format!("deactivate stale {}: {}", routing.id, e)),
                    }
                }
            }
        }

        info!(
            orphaned = report.orphaned,
            missing = report.missing,
            mismatched = report.mismatched,
            stale = report.stale,
            errors = report.errors.len(),
            "Kill switch reconciliation complete"
        );
        self.events.publish(
            Event::new(EventType::KillSwitchReconciled, router_id, "Kill switch rules reconciled")
                .with_metadata("orphaned", report.orphaned)
                .with_metadata("missing", report.missing)
                .with_metadata("mismatched", report.mismatched)
                .with_metadata("stale", report.stale),
        );
        Ok(report)
    }

    async fn recreate_rule(&self, routing: &DeviceRouting, report: &mut KillSwitchReconcileReport) {
        let ks = &routing.kill_switch;
        let rule_id = match self
            .create_rule(routing, ks.mode, ks.fallback_interface_id.as_deref(), !ks.active)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                report.errors.push(format!("recreate rule for {}: {}", routing.id, e));
                return;
            }
        };

        let updated = KillSwitchState { rule_id: Some(rule_id.clone()), ..ks.clone() };
        match self.state.update_kill_switch(&routing.id, &updated).await {
            Ok(()) => report.recreated += 1,
            Err(e) => {
                report.errors.push(format!("persist recreated rule for {}: {}", routing.id, e));
                self.remove_rule_best_effort(rules::rule_path(ks.mode), &rule_id).await;
            }
        }
    }
}
