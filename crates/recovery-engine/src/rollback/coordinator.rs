//! Single-unit rollbacks and the restore job they share.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::conflict::ConflictResolver;
use super::inflight::InFlightRegistry;
use super::types::{
    ConflictResolutionOutcome, ConflictResolutionStrategy, RollbackOperationKind, RollbackOutcome,
    RollbackStatus,
};
use crate::audit::AuditTrail;
use crate::config::EngineConfig;
use crate::error::ApplierError;
use crate::ports::{InstanceRegistry, UpdateApplier};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::stats::RecoveryStatistics;

/// Runs restores against the applier under a unit lease and a snapshot pin.
pub(crate) struct RestoreExecutor {
    applier: Arc<dyn UpdateApplier>,
    audit: Arc<AuditTrail>,
    store: Arc<SnapshotStore>,
    inflight: InFlightRegistry,
}

impl RestoreExecutor {
    pub(crate) fn new(
        applier: Arc<dyn UpdateApplier>,
        audit: Arc<AuditTrail>,
        store: Arc<SnapshotStore>,
        inflight: InFlightRegistry,
    ) -> Self {
        Self {
            applier,
            audit,
            store,
            inflight,
        }
    }

    /// Restore `snapshot` and wait at most `deadline` for the result.
    ///
    /// The restore runs as its own task, so a missed deadline only stops the
    /// wait; the task finishes, records its audit entry and releases the unit.
    pub(crate) async fn execute(
        self: &Arc<Self>,
        snapshot: &Snapshot,
        kind: RollbackOperationKind,
        deadline: Option<Duration>,
    ) -> RollbackOutcome {
        if self.store.is_restored(&snapshot.snapshot_id, kind).await {
            return already_restored(snapshot, kind);
        }

        let Some(lease) = self
            .inflight
            .try_acquire_rollback(&snapshot.unit_id, &snapshot.snapshot_id)
        else {
            warn!(unit_id = %snapshot.unit_id, "Rollback rejected, unit busy");
            return RollbackOutcome::new(
                snapshot,
                kind,
                RollbackStatus::Rejected,
                format!("Another rollback is active for unit {}", snapshot.unit_id),
            );
        };
        // The previous lease holder may have restored this snapshot after the
        // first check.
        if self.store.is_restored(&snapshot.snapshot_id, kind).await {
            drop(lease);
            return already_restored(snapshot, kind);
        }
        let pin = self.store.pin(snapshot);

        let executor = Arc::clone(self);
        let job_snapshot = snapshot.clone();
        let job = tokio::spawn(async move {
            let outcome = executor.run(&job_snapshot, kind).await;
            drop(pin);
            drop(lease);
            outcome
        });

        let joined = match deadline {
            Some(limit) => match tokio::time::timeout(limit, job).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        unit_id = %snapshot.unit_id,
                        snapshot_id = %snapshot.snapshot_id,
                        timeout_ms = limit.as_millis(),
                        "Rollback timed out, restore continues in background"
                    );
                    return RollbackOutcome::new(
                        snapshot,
                        kind,
                        RollbackStatus::TimedOut,
                        format!("Rollback did not complete within {}ms", limit.as_millis()),
                    );
                }
            },
            None => job.await,
        };

        joined.unwrap_or_else(|e| {
            error!(unit_id = %snapshot.unit_id, error = %e, "Restore task aborted");
            RollbackOutcome::new(
                snapshot,
                kind,
                RollbackStatus::Failed,
                format!("Restore task aborted: {e}"),
            )
        })
    }

    async fn run(&self, snapshot: &Snapshot, kind: RollbackOperationKind) -> RollbackOutcome {
        let restore = AssertUnwindSafe(self.restore(snapshot, kind));
        let result = match restore.catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ApplierError::Other(format!(
                "applier panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        match result {
            Ok(()) => {
                self.audit
                    .record_rollback_performed(&snapshot.snapshot_id, &snapshot.unit_id, kind)
                    .await;
                self.store.mark_restored(&snapshot.snapshot_id, kind).await;
                info!(
                    unit_id = %snapshot.unit_id,
                    snapshot_id = %snapshot.snapshot_id,
                    operation = %kind,
                    "Rollback succeeded"
                );
                RollbackOutcome::new(
                    snapshot,
                    kind,
                    RollbackStatus::Succeeded,
                    format!("Rollback completed: {}", kind.description()),
                )
            }
            Err(e) => {
                let cause = e.to_string();
                self.audit
                    .record_rollback_failed(
                        &snapshot.snapshot_id,
                        &snapshot.unit_id,
                        kind,
                        &cause,
                    )
                    .await;
                error!(
                    unit_id = %snapshot.unit_id,
                    snapshot_id = %snapshot.snapshot_id,
                    operation = %kind,
                    error = %cause,
                    "Rollback failed"
                );
                RollbackOutcome::new(
                    snapshot,
                    kind,
                    RollbackStatus::Failed,
                    format!("Rollback failed: {cause}"),
                )
            }
        }
    }

    async fn restore(
        &self,
        snapshot: &Snapshot,
        kind: RollbackOperationKind,
    ) -> Result<(), ApplierError> {
        let unit_id = snapshot.unit_id.as_str();
        match kind {
            RollbackOperationKind::FullRestore => {
                if let Some(prior) = snapshot.prior_implementation.as_deref() {
                    self.applier.restore_implementation(unit_id, prior).await?;
                }
                self.applier
                    .restore_instance_state(unit_id, snapshot.instance_count)
                    .await
            }
            RollbackOperationKind::InstanceStateRestore => {
                self.applier
                    .restore_instance_state(unit_id, snapshot.instance_count)
                    .await
            }
            RollbackOperationKind::ImplementationRestore => {
                match snapshot.prior_implementation.as_deref() {
                    Some(prior) => self.applier.restore_implementation(unit_id, prior).await,
                    None => Err(ApplierError::Other(format!(
                        "snapshot {} has no implementation to restore",
                        snapshot.snapshot_id
                    ))),
                }
            }
        }
    }
}

fn already_restored(snapshot: &Snapshot, kind: RollbackOperationKind) -> RollbackOutcome {
    debug!(
        snapshot_id = %snapshot.snapshot_id,
        unit_id = %snapshot.unit_id,
        operation = %kind,
        "Snapshot already restored"
    );
    RollbackOutcome::new(
        snapshot,
        kind,
        RollbackStatus::AlreadyRestored,
        format!("Snapshot {} already restored", snapshot.snapshot_id),
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Rolls units back to their snapshots.
///
/// Only one rollback may be active per unit; a concurrent request for the
/// same unit gets a [`RollbackStatus::Rejected`] outcome. While a snapshot is
/// stored, repeating a successful rollback of it with the same operation
/// returns [`RollbackStatus::AlreadyRestored`] without touching the applier.
pub struct RollbackCoordinator {
    pub(crate) executor: Arc<RestoreExecutor>,
    pub(crate) resolver: ConflictResolver,
    pub(crate) store: Arc<SnapshotStore>,
    pub(crate) cascade_strategy: ConflictResolutionStrategy,
    audit: Arc<AuditTrail>,
}

impl RollbackCoordinator {
    pub fn new(
        applier: Arc<dyn UpdateApplier>,
        store: Arc<SnapshotStore>,
        audit: Arc<AuditTrail>,
        registry: Arc<dyn InstanceRegistry>,
        inflight: InFlightRegistry,
        config: &EngineConfig,
    ) -> Self {
        let executor = Arc::new(RestoreExecutor::new(
            applier,
            Arc::clone(&audit),
            Arc::clone(&store),
            inflight.clone(),
        ));
        let resolver = ConflictResolver::new(
            Arc::clone(&executor),
            Arc::clone(&store),
            registry,
            inflight,
            config.conflict_wait_timeout(),
            config.conflict_poll_interval(),
        );

        Self {
            executor,
            resolver,
            store,
            cascade_strategy: config.cascade_conflict_strategy,
            audit,
        }
    }

    /// Restore implementation (when captured) and instance state.
    pub async fn rollback_to_snapshot(
        &self,
        snapshot: &Snapshot,
        failure_context: Option<&str>,
    ) -> RollbackOutcome {
        if let Some(context) = failure_context {
            info!(unit_id = %snapshot.unit_id, failure = %context, "Rolling back after failure");
        }
        let mut outcome = self
            .executor
            .execute(snapshot, RollbackOperationKind::FullRestore, None)
            .await;
        if let Some(context) = failure_context {
            outcome.message = format!("{} (failure: {context})", outcome.message);
        }
        outcome
    }

    /// Restore instance state, leaving the current implementation in place.
    pub async fn rollback_instance_states(&self, snapshot: &Snapshot) -> RollbackOutcome {
        self.executor
            .execute(snapshot, RollbackOperationKind::InstanceStateRestore, None)
            .await
    }

    /// Restore only the captured implementation.
    ///
    /// When `current` already equals the captured implementation nothing is
    /// applied and the outcome is [`RollbackStatus::AlreadyRestored`].
    pub async fn rollback_implementation(
        &self,
        snapshot: &Snapshot,
        current: Option<&[u8]>,
    ) -> RollbackOutcome {
        let kind = RollbackOperationKind::ImplementationRestore;
        let Some(prior) = snapshot.prior_implementation.as_deref() else {
            warn!(snapshot_id = %snapshot.snapshot_id, "Snapshot carries no implementation");
            return RollbackOutcome::new(
                snapshot,
                kind,
                RollbackStatus::Failed,
                format!(
                    "Snapshot {} has no implementation to restore",
                    snapshot.snapshot_id
                ),
            );
        };
        if current == Some(prior) {
            return RollbackOutcome::new(
                snapshot,
                kind,
                RollbackStatus::AlreadyRestored,
                "Current implementation already matches the snapshot",
            );
        }
        self.executor.execute(snapshot, kind, None).await
    }

    /// Full restore bounded by a wall-clock deadline.
    pub async fn rollback_with_timeout(
        &self,
        snapshot: &Snapshot,
        timeout: Duration,
    ) -> RollbackOutcome {
        self.executor
            .execute(snapshot, RollbackOperationKind::FullRestore, Some(timeout))
            .await
    }

    /// Check for conflicts first and let `strategy` decide what is restored.
    pub async fn rollback_with_conflict_resolution(
        &self,
        snapshot: &Snapshot,
        strategy: ConflictResolutionStrategy,
    ) -> ConflictResolutionOutcome {
        self.resolver.resolve(snapshot, strategy).await
    }

    #[must_use]
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Rollback counters taken from the audit trail.
    pub fn statistics(&self) -> RecoveryStatistics {
        self.audit.statistics()
    }
}
