//! Caller-facing facade wiring every component together.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::audit::{AuditExport, AuditTrail};
use crate::config::EngineConfig;
use crate::context::RecoveryContext;
use crate::error::{EngineResult, ErrorKind};
use crate::instances::InstanceTracker;
use crate::ports::{
    CompatibilityValidator, InstanceRegistry, LoggingRuntimeControl, RuntimeControl,
    UpdateApplier, ValidationReport,
};
use crate::recovery::{
    FailureReport, RecoveryManager, RecoveryOutcome, RecoveryStrategy, RecoveryStrategyMapper,
};
use crate::rollback::{
    CascadingRollbackOutcome, ConflictResolutionOutcome, ConflictResolutionStrategy,
    DependencyGraph, InFlightRegistry, RollbackCoordinator, RollbackOutcome, UpdateLease,
};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::stats::RecoveryStatistics;

/// Result of a snapshot cleanup pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupOutcome {
    pub success: bool,
    pub cleaned_count: usize,
    /// Expired snapshots kept because a rollback was using them
    pub skipped_pinned: usize,
    /// Dead instance entries dropped from the registry
    pub purged_instances: usize,
    pub duration: Duration,
}

/// Result of [`RecoveryEngine::attempt_update`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAttempt {
    pub unit_id: String,
    /// Snapshot taken before the update
    pub snapshot_id: String,
    pub applied: bool,
    pub validation: Option<ValidationReport>,
    /// Present when the update was rejected or failed
    pub recovery: Option<RecoveryOutcome>,
}

pub struct RecoveryEngineBuilder {
    applier: Arc<dyn UpdateApplier>,
    registry: Option<Arc<dyn InstanceRegistry>>,
    runtime: Option<Arc<dyn RuntimeControl>>,
    validator: Option<Arc<dyn CompatibilityValidator>>,
    config: EngineConfig,
    strategies: Vec<(ErrorKind, RecoveryStrategy)>,
}

impl RecoveryEngineBuilder {
    /// Instance registry; an empty [`InstanceTracker`] when unset.
    #[must_use]
    pub fn registry(mut self, registry: Arc<dyn InstanceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Runtime control; [`LoggingRuntimeControl`] when unset.
    #[must_use]
    pub fn runtime(mut self, runtime: Arc<dyn RuntimeControl>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Validator consulted by [`RecoveryEngine::attempt_update`].
    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn CompatibilityValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default strategy for one error kind.
    #[must_use]
    pub fn strategy(mut self, kind: ErrorKind, strategy: RecoveryStrategy) -> Self {
        self.strategies.push((kind, strategy));
        self
    }

    #[must_use]
    pub fn build(self) -> RecoveryEngine {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(InstanceTracker::new()));
        let runtime = self
            .runtime
            .unwrap_or_else(|| Arc::new(LoggingRuntimeControl));

        let audit = Arc::new(AuditTrail::new());
        let store = Arc::new(SnapshotStore::new(
            Arc::clone(&registry),
            Arc::clone(&audit),
        ));
        let inflight = InFlightRegistry::new();
        let coordinator = Arc::new(RollbackCoordinator::new(
            Arc::clone(&self.applier),
            Arc::clone(&store),
            Arc::clone(&audit),
            Arc::clone(&registry),
            inflight.clone(),
            &self.config,
        ));

        let mut mapper = RecoveryStrategyMapper::new(self.config.retry.clone());
        for (kind, strategy) in self.strategies {
            mapper.register(kind, strategy);
        }
        let manager = RecoveryManager::new(
            mapper,
            Arc::clone(&coordinator),
            Arc::clone(&store),
            Arc::clone(&self.applier),
            runtime,
            Arc::clone(&registry),
            self.config.clone(),
        );

        RecoveryEngine {
            config: self.config,
            audit,
            store,
            inflight,
            coordinator,
            manager,
            registry,
            applier: self.applier,
            validator: self.validator,
        }
    }
}

/// Snapshot, rollback and recovery engine.
///
/// All operations take `&self` and are safe to call concurrently; share the
/// engine behind an [`Arc`].
pub struct RecoveryEngine {
    config: EngineConfig,
    audit: Arc<AuditTrail>,
    store: Arc<SnapshotStore>,
    inflight: InFlightRegistry,
    coordinator: Arc<RollbackCoordinator>,
    manager: RecoveryManager,
    registry: Arc<dyn InstanceRegistry>,
    applier: Arc<dyn UpdateApplier>,
    validator: Option<Arc<dyn CompatibilityValidator>>,
}

impl RecoveryEngine {
    pub fn builder(applier: Arc<dyn UpdateApplier>) -> RecoveryEngineBuilder {
        RecoveryEngineBuilder {
            applier,
            registry: None,
            runtime: None,
            validator: None,
            config: EngineConfig::default(),
            strategies: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn create_snapshot(&self, unit_id: &str) -> EngineResult<Arc<Snapshot>> {
        self.store.create(unit_id).await
    }

    pub async fn create_snapshot_with_implementation(
        &self,
        unit_id: &str,
        implementation: Vec<u8>,
    ) -> EngineResult<Arc<Snapshot>> {
        self.store
            .create_with_implementation(unit_id, implementation)
            .await
    }

    pub async fn snapshot(&self, snapshot_id: &str) -> EngineResult<Arc<Snapshot>> {
        self.store.get(snapshot_id).await
    }

    pub async fn latest_snapshot(&self, unit_id: &str) -> Option<Arc<Snapshot>> {
        self.store.latest_for_unit(unit_id).await
    }

    pub async fn recover_from_failure(
        &self,
        failure: &FailureReport,
        ctx: &RecoveryContext,
    ) -> RecoveryOutcome {
        self.manager.recover(failure, ctx).await
    }

    pub async fn recover_batch(
        &self,
        failures: &[FailureReport],
        ctx: &RecoveryContext,
    ) -> Vec<RecoveryOutcome> {
        self.manager.recover_batch(failures, ctx).await
    }

    /// Underlying coordinator. Rollbacks started on it directly are audited
    /// but left out of [`Self::statistics`].
    #[must_use]
    pub fn coordinator(&self) -> &RollbackCoordinator {
        &self.coordinator
    }

    fn counted(&self, outcome: RollbackOutcome) -> RollbackOutcome {
        self.manager.record_rollback(&outcome);
        outcome
    }

    fn counted_cascade(&self, outcome: CascadingRollbackOutcome) -> CascadingRollbackOutcome {
        for step in &outcome.individual_outcomes {
            self.manager.record_rollback(step);
        }
        outcome
    }

    pub async fn rollback_to_snapshot(
        &self,
        snapshot: &Snapshot,
        failure_context: Option<&str>,
    ) -> RollbackOutcome {
        let outcome = self
            .coordinator
            .rollback_to_snapshot(snapshot, failure_context)
            .await;
        self.counted(outcome)
    }

    /// Full restore of a stored snapshot looked up by id.
    pub async fn rollback_by_id(&self, snapshot_id: &str) -> EngineResult<RollbackOutcome> {
        let snapshot = self.store.get(snapshot_id).await?;
        Ok(self.rollback_to_snapshot(&snapshot, None).await)
    }

    pub async fn rollback_instance_states(&self, snapshot: &Snapshot) -> RollbackOutcome {
        let outcome = self.coordinator.rollback_instance_states(snapshot).await;
        self.counted(outcome)
    }

    pub async fn rollback_implementation(
        &self,
        snapshot: &Snapshot,
        current: Option<&[u8]>,
    ) -> RollbackOutcome {
        let outcome = self
            .coordinator
            .rollback_implementation(snapshot, current)
            .await;
        self.counted(outcome)
    }

    pub async fn rollback_with_timeout(
        &self,
        snapshot: &Snapshot,
        timeout: Duration,
    ) -> RollbackOutcome {
        let outcome = self
            .coordinator
            .rollback_with_timeout(snapshot, timeout)
            .await;
        self.counted(outcome)
    }

    pub async fn rollback_cascading(
        &self,
        snapshots: &[Arc<Snapshot>],
    ) -> CascadingRollbackOutcome {
        let outcome = self.coordinator.rollback_cascading(snapshots).await;
        self.counted_cascade(outcome)
    }

    pub async fn rollback_dependency_cascade(
        &self,
        primary_unit: &str,
        graph: &DependencyGraph,
    ) -> CascadingRollbackOutcome {
        let outcome = self
            .coordinator
            .rollback_dependency_cascade(primary_unit, graph)
            .await;
        self.counted_cascade(outcome)
    }

    pub async fn rollback_with_conflict_resolution(
        &self,
        snapshot: &Snapshot,
        strategy: ConflictResolutionStrategy,
    ) -> ConflictResolutionOutcome {
        let outcome = self
            .coordinator
            .rollback_with_conflict_resolution(snapshot, strategy)
            .await;
        if let Some(rollback) = &outcome.rollback {
            self.manager.record_rollback(rollback);
        }
        outcome
    }

    /// Mark an update of `unit_id` as in progress until the lease drops.
    pub fn begin_update(&self, unit_id: &str) -> UpdateLease {
        self.inflight.begin_update(unit_id)
    }

    pub async fn audit_trail(&self) -> AuditExport {
        self.audit.export().await
    }

    /// Operation counters: one per recovery plus one per rollback requested
    /// through this engine. A rollback run as part of a recovery is counted
    /// once, as that recovery.
    pub fn statistics(&self) -> RecoveryStatistics {
        self.manager.statistics()
    }

    /// Rollback counters from the audit trail, including rollbacks run by
    /// recoveries.
    pub fn rollback_statistics(&self) -> RecoveryStatistics {
        self.coordinator.statistics()
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.manager.is_healthy()
            && self
                .rollback_statistics()
                .is_healthy(self.config.healthy_success_rate)
    }

    /// Drop snapshots older than `max_age` and purge dead instance entries.
    pub async fn cleanup_snapshots(&self, max_age: Duration) -> CleanupOutcome {
        let started = Instant::now();
        let sweep = self.store.sweep(max_age).await;
        let purged_instances = self.registry.purge_dead();
        self.audit.record_cleanup(sweep.removed_count).await;

        let outcome = CleanupOutcome {
            success: true,
            cleaned_count: sweep.removed_count,
            skipped_pinned: sweep.skipped_pinned,
            purged_instances,
            duration: started.elapsed(),
        };
        info!(
            cleaned = outcome.cleaned_count,
            skipped_pinned = outcome.skipped_pinned,
            purged_instances = outcome.purged_instances,
            "Cleanup finished"
        );
        outcome
    }

    /// Cleanup using the configured snapshot retention.
    pub async fn cleanup_expired(&self) -> CleanupOutcome {
        self.cleanup_snapshots(self.config.snapshot_max_age()).await
    }

    /// Snapshot, validate and apply `candidate`, recovering if it is
    /// rejected or fails to apply.
    pub async fn attempt_update(
        &self,
        unit_id: &str,
        candidate: Vec<u8>,
        current: Option<Vec<u8>>,
        ctx: &RecoveryContext,
    ) -> EngineResult<UpdateAttempt> {
        let snapshot = match current.clone() {
            Some(current) => {
                self.store
                    .create_with_implementation(unit_id, current)
                    .await?
            }
            None => self.store.create(unit_id).await?,
        };

        let mut attempt = UpdateAttempt {
            unit_id: unit_id.to_string(),
            snapshot_id: snapshot.snapshot_id.clone(),
            applied: false,
            validation: None,
            recovery: None,
        };

        if let Some(validator) = &self.validator {
            let rejection = match validator.validate(&candidate, current.as_deref()).await {
                Ok(report) if report.compatible => {
                    attempt.validation = Some(report);
                    None
                }
                Ok(report) => {
                    let reason = if report.warnings.is_empty() {
                        "candidate is incompatible".to_string()
                    } else {
                        report.warnings.join("; ")
                    };
                    attempt.validation = Some(report);
                    Some((ErrorKind::ValidationError, reason))
                }
                Err(e) => Some((ErrorKind::from(&e), e.to_string())),
            };

            if let Some((kind, reason)) = rejection {
                warn!(unit_id = %unit_id, reason = %reason, "Update rejected by validation");
                let failure = FailureReport::new(unit_id, kind, reason)
                    .with_operation("validate")
                    .with_snapshot(snapshot.snapshot_id.clone());
                attempt.recovery = Some(self.manager.recover(&failure, ctx).await);
                return Ok(attempt);
            }
        }

        let applied = {
            let _update = self.inflight.begin_update(unit_id);
            self.applier.apply_update(unit_id, &candidate).await
        };

        match applied {
            Ok(()) => {
                info!(unit_id = %unit_id, snapshot_id = %snapshot.snapshot_id, "Update applied");
                attempt.applied = true;
            }
            Err(e) => {
                warn!(unit_id = %unit_id, error = %e, "Update failed, starting recovery");
                let failure = FailureReport::new(unit_id, ErrorKind::from(&e), e.to_string())
                    .with_operation("apply_update")
                    .with_snapshot(snapshot.snapshot_id.clone())
                    .with_candidate(candidate);
                attempt.recovery = Some(self.manager.recover(&failure, ctx).await);
            }
        }

        Ok(attempt)
    }
}
