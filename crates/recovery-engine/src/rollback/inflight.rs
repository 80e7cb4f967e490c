//! Per-unit bookkeeping of rollbacks and updates currently in progress.
//!
//! At most one rollback may hold a unit. Leases release on drop, including
//! when the owning task panics or is abandoned after a timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
struct InFlight {
    /// unit id -> snapshot id of the active rollback
    rollbacks: HashMap<String, String>,
    /// unit id -> number of updates being applied
    updates: HashMap<String, usize>,
}

/// Shared registry of in-flight operations.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<Mutex<InFlight>>,
}

impl InFlightRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InFlight> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `unit_id` for a rollback, or `None` if another rollback holds it.
    pub fn try_acquire_rollback(&self, unit_id: &str, snapshot_id: &str) -> Option<RollbackLease> {
        let mut inner = self.lock();
        if let Some(holder) = inner.rollbacks.get(unit_id) {
            debug!(unit_id = %unit_id, holder = %holder, "Unit already has an active rollback");
            return None;
        }
        inner
            .rollbacks
            .insert(unit_id.to_string(), snapshot_id.to_string());
        Some(RollbackLease {
            unit_id: unit_id.to_string(),
            registry: self.clone(),
        })
    }

    /// Register an update of `unit_id` for as long as the lease lives.
    #[must_use]
    pub fn begin_update(&self, unit_id: &str) -> UpdateLease {
        *self.lock().updates.entry(unit_id.to_string()).or_insert(0) += 1;
        UpdateLease {
            unit_id: unit_id.to_string(),
            registry: self.clone(),
        }
    }

    pub fn rollback_active(&self, unit_id: &str) -> bool {
        self.lock().rollbacks.contains_key(unit_id)
    }

    pub fn update_active(&self, unit_id: &str) -> bool {
        self.lock().updates.contains_key(unit_id)
    }
}

/// Exclusive claim on a unit for one rollback.
#[derive(Debug)]
pub struct RollbackLease {
    unit_id: String,
    registry: InFlightRegistry,
}

impl RollbackLease {
    #[must_use]
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }
}

impl Drop for RollbackLease {
    fn drop(&mut self) {
        self.registry.lock().rollbacks.remove(&self.unit_id);
    }
}

/// Marks an update as in progress until dropped.
#[derive(Debug)]
#[must_use = "the update is only registered while the lease is held"]
pub struct UpdateLease {
    unit_id: String,
    registry: InFlightRegistry,
}

impl UpdateLease {
    #[must_use]
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }
}

impl Drop for UpdateLease {
    fn drop(&mut self) {
        let mut inner = self.registry.lock();
        if let Some(count) = inner.updates.get_mut(&self.unit_id) {
            *count -= 1;
            if *count == 0 {
                inner.updates.remove(&self.unit_id);
            }
        }
    }
}
