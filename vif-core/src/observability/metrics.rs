//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - plain names for gauges

use metrics::{describe_counter, describe_gauge};

/// Register all core metrics with descriptions.
///
/// This ensures metrics appear in `/metrics` with proper metadata.
pub fn register_core_metrics() {
    // VLAN pool
    describe_counter!("nnc_vlan_allocated_total", "VLAN allocation attempts (by status: success, exhausted)");
    describe_counter!("nnc_vlan_released_total", "VLAN IDs returned to the pool");
    describe_gauge!("nnc_vlan_pool_available", "Free VLAN IDs in the pool (by router_id)");

    // Router interfaces
    describe_counter!("nnc_interface_created_total", "Virtual interfaces fully provisioned");
    describe_counter!(
        "nnc_interface_rollback_total",
        "Interface creations rolled back (by failing step)"
    );
    describe_counter!("nnc_interface_removed_total", "Virtual interfaces removed");
    describe_counter!(
        "nnc_reconcile_orphans_removed_total",
        "Orphaned router interfaces removed at startup"
    );

    // Gateways and forwarding
    describe_counter!("nnc_gateway_started_total", "Gateways started with their TUN device up");
    describe_counter!("nnc_gateway_start_failures_total", "Gateway starts that failed");
    describe_gauge!("nnc_gateway_running", "Gateways currently running");
    describe_gauge!("nnc_forwarding_rules_active", "Active ingress/egress forwarding rule groups");

    // Kill switch
    describe_counter!("nnc_killswitch_activations_total", "Kill switch activations (by mode)");
    describe_counter!("nnc_killswitch_deactivations_total", "Kill switch deactivations (by mode)");

    // Database
    describe_counter!("nnc_db_errors_total", "Database query failures (by operation)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_without_recorder() {
        // Descriptions are dropped by the no-op recorder
        register_core_metrics();
        register_core_metrics();
    }
}
