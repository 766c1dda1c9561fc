//! VLAN ID allocation.
//!
//! Allocation scans the pool from a rotating cursor, so a just-released ID is
//! not handed out again until the rest of the pool has been tried.

use crate::config::{MAX_ADDRESSABLE_VLAN_ID, MAX_VLAN_ID};
use crate::error::{Result, VifError};
use crate::events::{Event, EventBus, EventType};
use crate::router::{execute_checked, RouterCommand, RouterPort, PATH_VLAN};
use crate::state::StateManager;
use crate::types::VirtualInterface;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

/// Allocates VLAN IDs from a bounded pool.
#[async_trait]
pub trait VlanAllocator: Send + Sync {
    /// Allocate a free VLAN ID for an instance.
    ///
    /// # Errors
    ///
    /// Returns `VifError::VlanPoolExhausted` after a full cycle finds nothing free.
    async fn allocate(&self, router_id: &str, instance_id: &str, service_type: &str) -> Result<u16>;

    /// Release an ID. Releasing a free ID is a no-op.
    async fn release(&self, router_id: &str, vlan_id: u16) -> Result<()>;

    async fn is_allocated(&self, router_id: &str, vlan_id: u16) -> Result<bool>;

    /// Instance currently holding an ID.
    async fn owner_of(&self, router_id: &str, vlan_id: u16) -> Result<Option<String>>;
}

/// VLAN IDs reserved by IEEE 802.1Q conventions on the managed router.
fn is_reserved(vlan_id: u16) -> bool {
    vlan_id == 1 || vlan_id == MAX_VLAN_ID
}

/// Pools must stay within the IDs the `10.99.{vlan}.0/24` plan can address.
fn validate_range(start: u16, end: u16) -> Result<()> {
    if start == 0 || end > MAX_ADDRESSABLE_VLAN_ID {
        return Err(VifError::InvalidPoolRange {
            start,
            end,
            reason: format!("pool must lie within 1..={}", MAX_ADDRESSABLE_VLAN_ID),
        });
    }
    if start > end {
        return Err(VifError::InvalidPoolRange {
            start,
            end,
            reason: "start is greater than end".to_string(),
        });
    }
    Ok(())
}

/// Walk one full cycle of `start..=end` beginning at `cursor`.
fn scan(start: u16, end: u16, cursor: u16, mut is_free: impl FnMut(u16) -> bool) -> Option<u16> {
    let size = u32::from(end - start) + 1;
    let offset = u32::from(cursor.clamp(start, end) - start);
    (0..size)
        .map(|i| start + ((offset + i) % size) as u16)
        .find(|&id| is_free(id))
}

fn next_cursor(start: u16, end: u16, allocated: u16) -> u16 {
    if allocated >= end {
        start
    } else {
        allocated + 1
    }
}

// ======================== Sequential ========================

struct SequentialState {
    /// vlan_id -> owning instance
    used: HashMap<u16, String>,
    cursor: u16,
}

/// In-memory allocator with a single pool shared by all routers.
pub struct SequentialVlanAllocator {
    start: u16,
    end: u16,
    state: Mutex<SequentialState>,
}

impl SequentialVlanAllocator {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        validate_range(start, end)?;
        Ok(Self { start, end, state: Mutex::new(SequentialState { used: HashMap::new(), cursor: start }) })
    }

    pub fn allocated_count(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).used.len()
    }
}

#[async_trait]
impl VlanAllocator for SequentialVlanAllocator {
    async fn allocate(&self, router_id: &str, instance_id: &str, _service_type: &str) -> Result<u16> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = scan(self.start, self.end, state.cursor, |id| !state.used.contains_key(&id))
            .ok_or_else(|| VifError::VlanPoolExhausted { router_id: router_id.to_string() })?;

        state.used.insert(id, instance_id.to_string());
        state.cursor = next_cursor(self.start, self.end, id);
        debug!(vlan_id = id, instance_id = %instance_id, "VLAN allocated");
        Ok(id)
    }

    async fn release(&self, _router_id: &str, vlan_id: u16) -> Result<()> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).used.remove(&vlan_id);
        Ok(())
    }

    async fn is_allocated(&self, _router_id: &str, vlan_id: u16) -> Result<bool> {
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).used.contains_key(&vlan_id))
    }

    async fn owner_of(&self, _router_id: &str, vlan_id: u16) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).used.get(&vlan_id).cloned())
    }
}

// ======================== Persistent ========================

/// Pool utilization (percent) at which a warning event is published.
const POOL_WARNING_PERCENT: f64 = 80.0;
const POOL_CRITICAL_PERCENT: f64 = 95.0;

/// Database-backed allocator, scoped per router.
///
/// Each allocation records the owning instance, service type and subnet in
/// the `vlan_allocations` ledger. Reserved ID 1 is never handed out.
///
/// With a router attached, IDs already configured on the router's VLAN
/// interfaces are skipped too. If the router cannot be queried nothing is
/// allocated.
pub struct PersistentVlanAllocator {
    state: Arc<StateManager>,
    start: u16,
    end: u16,
    router: Option<Arc<dyn RouterPort>>,
    events: Option<EventBus>,
    /// Serializes read-then-insert per allocator; router_id -> cursor.
    cursors: tokio::sync::Mutex<HashMap<String, u16>>,
}

impl PersistentVlanAllocator {
    pub fn new(state: Arc<StateManager>, start: u16, end: u16) -> Result<Self> {
        validate_range(start, end)?;
        info!(pool_start = start, pool_end = end, "Creating VLAN allocator");
        Ok(Self {
            state,
            start,
            end,
            router: None,
            events: None,
            cursors: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Skip IDs the router already uses for VLAN interfaces.
    pub fn with_router_check(mut self, router: Arc<dyn RouterPort>) -> Self {
        self.router = Some(router);
        self
    }

    /// Publish `vlan.pool.warning` when an allocation pushes utilization
    /// past 80% or 95%.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// VLAN IDs present on the router, or an empty set without a router.
    async fn router_vlan_ids(&self) -> Result<HashSet<u16>> {
        let Some(router) = &self.router else {
            return Ok(HashSet::new());
        };
        let listed = execute_checked(router.as_ref(), &RouterCommand::print(PATH_VLAN)).await?;
        Ok(listed
            .data
            .iter()
            .filter_map(|row| row.get("vlan-id"))
            .filter_map(|v| v.parse::<u16>().ok())
            .collect())
    }

    fn check_pool_utilization(&self, router_id: &str, allocated: usize) {
        let Some(events) = &self.events else {
            return;
        };
        let total = self.usable_size();
        if total == 0 {
            return;
        }
        let utilization = (allocated * 100) as f64 / total as f64;
        let (level, action) = if utilization >= POOL_CRITICAL_PERCENT {
            ("critical", "expand_pool")
        } else if utilization >= POOL_WARNING_PERCENT {
            ("warning", "cleanup")
        } else {
            return;
        };

        warn!(router_id = %router_id, utilization, warning_level = level, "VLAN pool utilization high");
        events.publish(
            Event::new(
                EventType::VlanPoolWarning,
                router_id,
                &format!("VLAN pool {:.1}% utilized", utilization),
            )
            .with_metadata("router_id", router_id)
            .with_metadata("total", total)
            .with_metadata("allocated", allocated)
            .with_metadata("available", total.saturating_sub(allocated))
            .with_metadata("utilization", format!("{:.1}", utilization))
            .with_metadata("warning_level", level)
            .with_metadata("recommended_action", action),
        );
    }

    fn usable_size(&self) -> usize {
        (self.start..=self.end).filter(|id| !is_reserved(*id)).count()
    }

    fn report_available(&self, router_id: &str, allocated: usize) {
        let available = self.usable_size().saturating_sub(allocated);
        metrics::gauge!("nnc_vlan_pool_available", "router_id" => router_id.to_string())
            .set(available as f64);
    }
}

#[async_trait]
impl VlanAllocator for PersistentVlanAllocator {
    #[instrument(skip(self), fields(router_id = %router_id, instance_id = %instance_id))]
    async fn allocate(&self, router_id: &str, instance_id: &str, service_type: &str) -> Result<u16> {
        let mut cursors = self.cursors.lock().await;
        let cursor = cursors.get(router_id).copied().unwrap_or(self.start);

        let allocated = self.state.allocated_vlan_ids(router_id).await?;
        let on_router = self.router_vlan_ids().await.map_err(|e| {
            warn!(error = %e, "Router VLAN query failed, refusing to allocate");
            metrics::counter!("nnc_vlan_allocated_total", "status" => "router_check_failed").increment(1);
            e
        })?;
        let Some(id) = scan(self.start, self.end, cursor, |id| {
            !is_reserved(id) && !allocated.contains(&id) && !on_router.contains(&id)
        }) else {
            warn!(allocated = allocated.len(), "VLAN pool exhausted");
            metrics::counter!("nnc_vlan_allocated_total", "status" => "exhausted").increment(1);
            return Err(VifError::VlanPoolExhausted { router_id: router_id.to_string() });
        };

        let subnet = VirtualInterface::subnet_for(id);
        self.state.upsert_vlan_allocation(router_id, id, instance_id, service_type, &subnet).await?;
        cursors.insert(router_id.to_string(), next_cursor(self.start, self.end, id));

        info!(vlan_id = id, subnet = %subnet, "VLAN allocated");
        metrics::counter!("nnc_vlan_allocated_total", "status" => "success").increment(1);
        self.report_available(router_id, allocated.len() + 1);
        self.check_pool_utilization(router_id, allocated.len() + 1);
        Ok(id)
    }

    #[instrument(skip(self), fields(router_id = %router_id))]
    async fn release(&self, router_id: &str, vlan_id: u16) -> Result<()> {
        let _cursors = self.cursors.lock().await;
        if self.state.release_vlan_allocation(router_id, vlan_id).await? {
            info!(vlan_id, "VLAN released");
            metrics::counter!("nnc_vlan_released_total").increment(1);
            let allocated = self.state.allocated_vlan_ids(router_id).await?;
            self.report_available(router_id, allocated.len());
        } else {
            debug!(vlan_id, "VLAN was not allocated");
        }
        Ok(())
    }

    async fn is_allocated(&self, router_id: &str, vlan_id: u16) -> Result<bool> {
        Ok(self.state.allocated_vlan_ids(router_id).await?.contains(&vlan_id))
    }

    async fn owner_of(&self, router_id: &str, vlan_id: u16) -> Result<Option<String>> {
        self.state.vlan_owner(router_id, vlan_id).await
    }
}
