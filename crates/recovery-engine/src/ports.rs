//! Interfaces to the collaborators the engine drives but does not implement.
//!
//! - [`UpdateApplier`] applies and restores implementations on a live unit
//! - [`CompatibilityValidator`] vets a candidate before it is applied
//! - [`InstanceRegistry`] reports how many live instances a unit has
//! - [`RuntimeControl`] carries out non-rollback recovery actions

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ApplierError, ControlError, ValidationError};

/// Applies new implementations to running units and restores old ones.
///
/// Calls are never pre-empted by the engine; a timed-out restore keeps
/// running to completion in the background.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpdateApplier: Send + Sync {
    /// Apply a new implementation to a unit.
    async fn apply_update(&self, unit_id: &str, implementation: &[u8]) -> Result<(), ApplierError>;

    /// Put a previously captured implementation back in place.
    async fn restore_implementation(&self, unit_id: &str, prior: &[u8]) -> Result<(), ApplierError>;

    /// Restore live-instance state to what it was when the snapshot was taken.
    async fn restore_instance_state(
        &self,
        unit_id: &str,
        instance_count: usize,
    ) -> Result<(), ApplierError>;
}

/// Result of a successful validation call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether the candidate may be applied
    pub compatible: bool,
    /// Non-fatal findings
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ValidationReport {
    #[must_use]
    pub fn compatible() -> Self {
        Self {
            compatible: true,
            warnings: Vec::new(),
        }
    }
}

/// Decides whether a candidate implementation is structurally safe to apply.
#[async_trait]
pub trait CompatibilityValidator: Send + Sync {
    async fn validate(
        &self,
        candidate: &[u8],
        current: Option<&[u8]>,
    ) -> Result<ValidationReport, ValidationError>;
}

/// Reports live instance counts for snapshot stamping and drift checks.
pub trait InstanceRegistry: Send + Sync {
    fn count_instances(&self, unit_id: &str) -> usize;

    /// Drop bookkeeping for instances that no longer exist.
    ///
    /// Called on the same cadence as snapshot cleanup. Returns the number of
    /// entries removed.
    fn purge_dead(&self) -> usize {
        0
    }
}

/// Carries out recovery actions that are not rollbacks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuntimeControl: Send + Sync {
    async fn emergency_shutdown(&self, unit_id: &str, reason: &str) -> Result<(), ControlError>;

    async fn activate_fallback(&self, unit_id: &str, reason: &str) -> Result<(), ControlError>;

    async fn restart_unit(&self, unit_id: &str) -> Result<(), ControlError>;

    async fn apply_hotfix(&self, unit_id: &str, hotfix: &[u8]) -> Result<(), ControlError>;

    async fn cleanup_resources(&self, unit_id: &str) -> Result<(), ControlError>;

    async fn notify_operators(&self, unit_id: &str, message: &str) -> Result<(), ControlError>;
}

/// Default [`RuntimeControl`] that only records the requested action in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingRuntimeControl;

#[async_trait]
impl RuntimeControl for LoggingRuntimeControl {
    async fn emergency_shutdown(&self, unit_id: &str, reason: &str) -> Result<(), ControlError> {
        warn!(unit_id = %unit_id, reason = %reason, "Emergency shutdown requested");
        Ok(())
    }

    async fn activate_fallback(&self, unit_id: &str, reason: &str) -> Result<(), ControlError> {
        warn!(unit_id = %unit_id, reason = %reason, "Fallback mode requested");
        Ok(())
    }

    async fn restart_unit(&self, unit_id: &str) -> Result<(), ControlError> {
        info!(unit_id = %unit_id, "Unit restart requested");
        Ok(())
    }

    async fn apply_hotfix(&self, unit_id: &str, hotfix: &[u8]) -> Result<(), ControlError> {
        info!(unit_id = %unit_id, bytes = hotfix.len(), "Hotfix requested");
        Ok(())
    }

    async fn cleanup_resources(&self, unit_id: &str) -> Result<(), ControlError> {
        info!(unit_id = %unit_id, "Resource cleanup requested");
        Ok(())
    }

    async fn notify_operators(&self, unit_id: &str, message: &str) -> Result<(), ControlError> {
        warn!(unit_id = %unit_id, message = %message, "Operator notification");
        Ok(())
    }
}
