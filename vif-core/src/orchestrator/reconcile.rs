//! Startup drift repair between the router and the interface records.

use super::BridgeOrchestrator;
use crate::error::Result;
use crate::router::{execute_checked, RouterCommand, PATH_VLAN};
use crate::types::interface::INTERFACE_PREFIX;
use std::collections::HashSet;
use tracing::{info, instrument, warn};

/// Outcome of a startup reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Managed interfaces present on the router
    pub router_interfaces: usize,
    pub db_records: usize,
    pub orphans_found: usize,
    pub orphans_removed: usize,
}

impl BridgeOrchestrator {
    /// Remove managed VLAN interfaces the router has but the records don't.
    ///
    /// A crash between a router step and its record update can leave such
    /// interfaces behind. Ingress VLANs this process is tracking are kept.
    /// Run once at startup, before any bridge operation.
    #[instrument(skip(self))]
    pub async fn reconcile_on_startup(&self) -> Result<ReconcileReport> {
        let listed = execute_checked(self.router.as_ref(), &RouterCommand::print(PATH_VLAN)).await?;
        let on_router: Vec<String> = listed
            .data
            .into_iter()
            .filter_map(|mut row| row.remove("name"))
            .filter(|name| name.starts_with(INTERFACE_PREFIX))
            .collect();

        let records = self.state.list_interfaces().await?;
        let mut known: HashSet<String> = records.iter().map(|vif| vif.interface_name.clone()).collect();
        if let Some(deps) = &self.dual {
            known.extend(deps.ingress.list_vlans().into_iter().map(|v| v.router_interface));
        }

        let mut report = ReconcileReport {
            router_interfaces: on_router.len(),
            db_records: records.len(),
            ..Default::default()
        };

        for name in on_router.iter().filter(|name| !known.contains(*name)) {
            report.orphans_found += 1;
            let cmd = RouterCommand::remove(PATH_VLAN).arg("numbers", name);
            match execute_checked(self.router.as_ref(), &cmd).await {
                Ok(_) => {
                    report.orphans_removed += 1;
                    metrics::counter!("nnc_reconcile_orphans_removed_total").increment(1);
                    info!(interface = %name, "Removed orphaned interface");
                }
                Err(e) => warn!(interface = %name, error = %e, "Failed to remove orphaned interface"),
            }
        }

        info!(
            router_interfaces = report.router_interfaces,
            db_records = report.db_records,
            orphans_found = report.orphans_found,
            orphans_removed = report.orphans_removed,
            "Startup reconciliation complete"
        );
        Ok(report)
    }
}
