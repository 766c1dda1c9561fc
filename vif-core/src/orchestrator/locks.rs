//! Per-instance exclusion for bridge lifecycle operations.

use crate::error::{Result, VifError};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Set of instance IDs with a setup or teardown in progress.
#[derive(Default)]
pub(crate) struct InFlight {
    ids: Mutex<HashSet<String>>,
}

impl InFlight {
    /// Claim an instance. Fails fast if another operation holds it.
    pub fn acquire(&self, instance_id: &str) -> Result<InFlightGuard<'_>> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(instance_id.to_string()) {
            return Err(VifError::OperationInProgress { instance_id: instance_id.to_string() });
        }
        Ok(InFlightGuard { owner: self, instance_id: instance_id.to_string() })
    }

    pub fn is_busy(&self, instance_id: &str) -> bool {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).contains(instance_id)
    }
}

/// Releases the claim on drop, including when the operation is cancelled.
pub(crate) struct InFlightGuard<'a> {
    owner: &'a InFlight,
    instance_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.ids.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.instance_id);
    }
}
