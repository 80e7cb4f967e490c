//! Conflict detection and resolution for rollbacks racing other work.
//!
//! Detection is deterministic: it compares the unit's in-flight operations,
//! its newest snapshot and its live instance count against the snapshot
//! being restored. Waiting on a blocking conflict is bounded by the
//! configured wait timeout, so `resolve` always returns.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::coordinator::RestoreExecutor;
use super::inflight::InFlightRegistry;
use super::types::{
    ConflictKind, ConflictResolutionOutcome, ConflictResolutionStrategy, RollbackOperationKind,
};
use crate::ports::InstanceRegistry;
use crate::snapshot::{Snapshot, SnapshotStore};

pub struct ConflictResolver {
    executor: Arc<RestoreExecutor>,
    store: Arc<SnapshotStore>,
    registry: Arc<dyn InstanceRegistry>,
    inflight: InFlightRegistry,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl ConflictResolver {
    pub(crate) fn new(
        executor: Arc<RestoreExecutor>,
        store: Arc<SnapshotStore>,
        registry: Arc<dyn InstanceRegistry>,
        inflight: InFlightRegistry,
        wait_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            executor,
            store,
            registry,
            inflight,
            wait_timeout,
            poll_interval,
        }
    }

    /// Conflicts that currently affect a rollback to `snapshot`.
    pub async fn detect(&self, snapshot: &Snapshot) -> Vec<ConflictKind> {
        let unit_id = snapshot.unit_id.as_str();
        let mut conflicts = Vec::new();

        if self.inflight.rollback_active(unit_id) {
            conflicts.push(ConflictKind::RollbackInFlight);
        }
        if self.inflight.update_active(unit_id) {
            conflicts.push(ConflictKind::UpdateInFlight);
        }
        if let Some(latest) = self.store.latest_for_unit(unit_id).await {
            if latest.snapshot_id != snapshot.snapshot_id {
                conflicts.push(ConflictKind::StaleSnapshot);
            }
        }
        if self.registry.count_instances(unit_id) != snapshot.instance_count {
            conflicts.push(ConflictKind::InstanceDrift);
        }

        conflicts
    }

    pub async fn resolve(
        &self,
        snapshot: &Snapshot,
        strategy: ConflictResolutionStrategy,
    ) -> ConflictResolutionOutcome {
        let conflicts = self.detect(snapshot).await;
        self.resolve_detected(snapshot, strategy, conflicts).await
    }

    pub(crate) async fn resolve_detected(
        &self,
        snapshot: &Snapshot,
        strategy: ConflictResolutionStrategy,
        conflicts: Vec<ConflictKind>,
    ) -> ConflictResolutionOutcome {
        let unit_id = snapshot.unit_id.as_str();
        let mut outcome = ConflictResolutionOutcome {
            resolved: false,
            strategy_used: None,
            conflicts,
            description: String::new(),
            unit_id: unit_id.to_string(),
            timestamp: Utc::now(),
            requires_manual_intervention: false,
            rollback: None,
        };

        if outcome.conflicts.is_empty() {
            let rollback = self
                .executor
                .execute(snapshot, RollbackOperationKind::FullRestore, None)
                .await;
            outcome.resolved = rollback.success;
            outcome.description = format!("No conflicts detected: {}", rollback.message);
            outcome.rollback = Some(rollback);
            return outcome;
        }

        info!(
            unit_id = %unit_id,
            strategy = %strategy,
            conflicts = ?outcome.conflicts,
            "Resolving rollback conflicts"
        );
        outcome.strategy_used = Some(strategy);

        let update_in_flight = outcome.conflicts.contains(&ConflictKind::UpdateInFlight);
        let (wait_for_updates, kind) = match strategy {
            ConflictResolutionStrategy::AbortOnConflict => {
                outcome.description = format!(
                    "Rollback aborted: {} conflict(s) detected",
                    outcome.conflicts.len()
                );
                return outcome;
            }
            ConflictResolutionStrategy::ManualResolution => {
                warn!(unit_id = %unit_id, "Rollback conflict requires manual resolution");
                outcome.requires_manual_intervention = true;
                outcome.description = "Conflicts escalated for manual resolution".to_string();
                return outcome;
            }
            ConflictResolutionStrategy::PreferCurrent => {
                outcome.resolved = true;
                outcome.description = "Current state kept, rollback skipped".to_string();
                return outcome;
            }
            ConflictResolutionStrategy::PreferRollback if update_in_flight => {
                outcome.description =
                    "Rollback refused while an update is being applied".to_string();
                return outcome;
            }
            ConflictResolutionStrategy::PreferRollback
            | ConflictResolutionStrategy::ForceRollback => {
                (false, RollbackOperationKind::FullRestore)
            }
            ConflictResolutionStrategy::MergeChanges => {
                let kind = if snapshot.has_implementation() {
                    RollbackOperationKind::ImplementationRestore
                } else {
                    RollbackOperationKind::InstanceStateRestore
                };
                (true, kind)
            }
        };

        if !self.wait_until_clear(unit_id, wait_for_updates).await {
            outcome.description = format!(
                "Conflicting operation still active after {}ms",
                self.wait_timeout.as_millis()
            );
            warn!(
                unit_id = %unit_id,
                strategy = %strategy,
                "Gave up waiting for conflicting operation"
            );
            return outcome;
        }

        let rollback = self.executor.execute(snapshot, kind, None).await;
        outcome.resolved = rollback.success;
        outcome.description = format!("{}: {}", strategy.description(), rollback.message);
        outcome.rollback = Some(rollback);
        outcome
    }

    /// Poll until no blocking operation holds the unit, up to the wait timeout.
    async fn wait_until_clear(&self, unit_id: &str, include_updates: bool) -> bool {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            let busy = self.inflight.rollback_active(unit_id)
                || (include_updates && self.inflight.update_active(unit_id));
            if !busy {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
