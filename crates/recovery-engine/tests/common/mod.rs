//! Stub ports shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use recovery_engine::{
    ApplierError, CompatibilityValidator, ControlError, RuntimeControl, UpdateApplier,
    ValidationError, ValidationReport,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Install a subscriber once so `RUST_LOG` works while debugging tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Update Applier
// =============================================================================

/// Applier that fails for configured units and can be slowed down.
#[derive(Default)]
pub struct ScriptedApplier {
    failing_units: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    /// Calls to `apply_update`
    pub applies: AtomicUsize,
    /// Calls to either restore method
    pub restores: AtomicUsize,
    /// Units restored, in call order
    pub restored_units: Mutex<Vec<String>>,
}

impl ScriptedApplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, unit_id: &str) {
        self.failing_units
            .lock()
            .unwrap()
            .insert(unit_id.to_string());
    }

    pub fn heal(&self, unit_id: &str) {
        self.failing_units.lock().unwrap().remove(unit_id);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    async fn step(&self, unit_id: &str) -> Result<(), ApplierError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_units.lock().unwrap().contains(unit_id) {
            return Err(ApplierError::Rejected(format!("{unit_id} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateApplier for ScriptedApplier {
    async fn apply_update(
        &self,
        unit_id: &str,
        _implementation: &[u8],
    ) -> Result<(), ApplierError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.step(unit_id).await
    }

    async fn restore_implementation(
        &self,
        unit_id: &str,
        _prior: &[u8],
    ) -> Result<(), ApplierError> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        self.step(unit_id).await
    }

    async fn restore_instance_state(
        &self,
        unit_id: &str,
        _instance_count: usize,
    ) -> Result<(), ApplierError> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        self.step(unit_id).await?;
        self.restored_units
            .lock()
            .unwrap()
            .push(unit_id.to_string());
        Ok(())
    }
}

// =============================================================================
// Compatibility Validator
// =============================================================================

/// Accepts every candidate except the ones listed.
#[derive(Default)]
pub struct ListValidator {
    pub incompatible: Vec<Vec<u8>>,
}

#[async_trait]
impl CompatibilityValidator for ListValidator {
    async fn validate(
        &self,
        candidate: &[u8],
        _current: Option<&[u8]>,
    ) -> Result<ValidationReport, ValidationError> {
        if candidate.is_empty() {
            return Err(ValidationError::Malformed("empty implementation".to_string()));
        }
        if self.incompatible.iter().any(|c| c == candidate) {
            return Ok(ValidationReport {
                compatible: false,
                warnings: vec!["field removed".to_string()],
            });
        }
        Ok(ValidationReport::compatible())
    }
}

// =============================================================================
// Runtime Control
// =============================================================================

/// Records every action the manager asks for.
#[derive(Default)]
pub struct RecordingRuntime {
    pub calls: Mutex<Vec<String>>,
    pub fail_fallback: bool,
}

impl RecordingRuntime {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RuntimeControl for RecordingRuntime {
    async fn emergency_shutdown(&self, unit_id: &str, _reason: &str) -> Result<(), ControlError> {
        self.record(format!("shutdown:{unit_id}"));
        Ok(())
    }

    async fn activate_fallback(&self, unit_id: &str, _reason: &str) -> Result<(), ControlError> {
        self.record(format!("fallback:{unit_id}"));
        if self.fail_fallback {
            return Err(ControlError::Failed("no fallback configured".to_string()));
        }
        Ok(())
    }

    async fn restart_unit(&self, unit_id: &str) -> Result<(), ControlError> {
        self.record(format!("restart:{unit_id}"));
        Ok(())
    }

    async fn apply_hotfix(&self, unit_id: &str, _hotfix: &[u8]) -> Result<(), ControlError> {
        self.record(format!("hotfix:{unit_id}"));
        Ok(())
    }

    async fn cleanup_resources(&self, unit_id: &str) -> Result<(), ControlError> {
        self.record(format!("cleanup:{unit_id}"));
        Ok(())
    }

    async fn notify_operators(&self, unit_id: &str, _message: &str) -> Result<(), ControlError> {
        self.record(format!("notify:{unit_id}"));
        Ok(())
    }
}
