//! Executes recovery strategies for reported failures.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::mapper::RecoveryStrategyMapper;
use super::types::{
    ActionRun, ActionType, FailureReport, FinalState, RecoveryAction, RecoveryOutcome,
    RecoveryPhase, RecoveryStrategy,
};
use crate::config::{EngineConfig, RetryPolicy};
use crate::context::RecoveryContext;
use crate::ports::{InstanceRegistry, RuntimeControl, UpdateApplier};
use crate::rollback::{RollbackCoordinator, RollbackOutcome, RollbackStatus};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::stats::{OperationCounters, RecoveryStatistics};

/// Side effects of executing one action that shape the final outcome.
#[derive(Debug, Default)]
struct Escalation {
    timed_out: bool,
    /// A rollback failed or timed out and no fallback took over
    unresolved_rollback: bool,
}

/// Tracks the phase history of one recovery attempt.
struct PhaseLog<'a> {
    error_id: &'a str,
    history: Vec<RecoveryPhase>,
}

impl<'a> PhaseLog<'a> {
    fn new(error_id: &'a str) -> Self {
        let mut log = Self {
            error_id,
            history: Vec::with_capacity(6),
        };
        log.enter(RecoveryPhase::Received);
        log
    }

    fn enter(&mut self, phase: RecoveryPhase) {
        debug!(error_id = %self.error_id, phase = ?phase, "Recovery phase");
        self.history.push(phase);
    }
}

pub struct RecoveryManager {
    mapper: RecoveryStrategyMapper,
    coordinator: Arc<RollbackCoordinator>,
    store: Arc<SnapshotStore>,
    applier: Arc<dyn UpdateApplier>,
    runtime: Arc<dyn RuntimeControl>,
    registry: Arc<dyn InstanceRegistry>,
    config: EngineConfig,
    counters: OperationCounters,
}

impl RecoveryManager {
    pub fn new(
        mapper: RecoveryStrategyMapper,
        coordinator: Arc<RollbackCoordinator>,
        store: Arc<SnapshotStore>,
        applier: Arc<dyn UpdateApplier>,
        runtime: Arc<dyn RuntimeControl>,
        registry: Arc<dyn InstanceRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            mapper,
            coordinator,
            store,
            applier,
            runtime,
            registry,
            config,
            counters: OperationCounters::default(),
        }
    }

    /// Classify `failure`, run the mapped actions and count the attempt.
    ///
    /// Never fails: an unsuccessful recovery is reported through the outcome.
    pub async fn recover(
        &self,
        failure: &FailureReport,
        ctx: &RecoveryContext,
    ) -> RecoveryOutcome {
        ctx.scope(self.run(failure)).await
    }

    /// Recover each failure in turn, preserving input order.
    pub async fn recover_batch(
        &self,
        failures: &[FailureReport],
        ctx: &RecoveryContext,
    ) -> Vec<RecoveryOutcome> {
        info!(count = failures.len(), "Starting batch recovery");
        let mut outcomes = Vec::with_capacity(failures.len());
        for failure in failures {
            outcomes.push(self.recover(failure, &ctx.child()).await);
        }
        outcomes
    }

    pub fn statistics(&self) -> RecoveryStatistics {
        self.counters.statistics()
    }

    /// Count a rollback requested directly rather than through [`Self::recover`].
    ///
    /// Outcomes that never reached the applier are ignored.
    pub fn record_rollback(&self, outcome: &RollbackOutcome) {
        if outcome.status.is_operation() {
            self.counters.record(outcome.success, outcome.timestamp);
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.statistics().is_healthy(self.config.healthy_success_rate)
    }

    async fn run(&self, failure: &FailureReport) -> RecoveryOutcome {
        let start_time = Utc::now();
        let started = Instant::now();
        let mut phases = PhaseLog::new(&failure.error_id);

        let kind = failure.kind;
        phases.enter(RecoveryPhase::Classified);
        info!(
            error_id = %failure.error_id,
            unit_id = %failure.unit_id,
            kind = kind.as_str(),
            message = %failure.message,
            "Recovering from failure"
        );

        let selection = self.mapper.select(kind);
        phases.enter(RecoveryPhase::ActionSelected);
        let mut warnings = selection.warnings;

        phases.enter(RecoveryPhase::Executing);
        let mut actions = Vec::with_capacity(selection.actions.len());
        let mut escalation = Escalation::default();
        for action_type in &selection.actions {
            let mut taken = self
                .execute(
                    *action_type,
                    failure,
                    &selection.strategy,
                    &mut escalation,
                    &mut warnings,
                )
                .await;
            actions.append(&mut taken);
        }

        let all_succeeded = actions.iter().all(|a| a.successful);
        let final_state = if escalation.timed_out {
            FinalState::TimedOut
        } else if all_succeeded {
            FinalState::Succeeded
        } else {
            FinalState::Failed
        };
        phases.enter(final_state.phase());

        let success = final_state == FinalState::Succeeded;
        let manual_intervention_required = selection
            .actions
            .contains(&ActionType::EmergencyShutdown)
            || escalation.unresolved_rollback
            || !kind.is_recoverable();
        let retry_attempts = actions
            .iter()
            .filter(|a| a.action_type == ActionType::RetryOperation)
            .map(|a| a.attempts.saturating_sub(1))
            .sum();
        let recovery_error = actions.iter().find_map(|a| a.error.clone());

        let end_time = Utc::now();
        self.counters.record(success, end_time);
        phases.enter(RecoveryPhase::Recorded);

        if success {
            info!(
                error_id = %failure.error_id,
                unit_id = %failure.unit_id,
                strategy = %selection.strategy,
                "Recovery succeeded"
            );
        } else {
            error!(
                error_id = %failure.error_id,
                unit_id = %failure.unit_id,
                strategy = %selection.strategy,
                final_state = ?final_state,
                manual_intervention = manual_intervention_required,
                "Recovery did not succeed"
            );
        }

        RecoveryOutcome {
            success,
            strategy: selection.strategy,
            original_error_id: failure.error_id.clone(),
            unit_id: failure.unit_id.clone(),
            error_kind: kind,
            retry_attempts,
            operation_duration: started.elapsed(),
            start_time,
            end_time,
            recovery_error,
            actions_taken: actions,
            warnings,
            manual_intervention_required,
            statistics: self.counters.statistics(),
            final_state,
            phase_history: phases.history,
        }
    }

    /// Run one action. A failed rollback may add a fallback action.
    async fn execute(
        &self,
        action_type: ActionType,
        failure: &FailureReport,
        strategy: &RecoveryStrategy,
        escalation: &mut Escalation,
        warnings: &mut Vec<String>,
    ) -> Vec<RecoveryAction> {
        let unit_id = failure.unit_id.as_str();
        let run = ActionRun::start(action_type);

        let action = match action_type {
            ActionType::RollbackSnapshot => return self.rollback(failure, escalation).await,
            ActionType::RetryOperation => {
                let policy = match strategy {
                    RecoveryStrategy::Retry { policy } => policy.clone(),
                    _ => self.config.retry.clone(),
                };
                self.retry(failure, &policy).await
            }
            ActionType::PreserveState => match self.store.create(unit_id).await {
                Ok(snapshot) => run.succeed(format!(
                    "State preserved in snapshot {}",
                    snapshot.snapshot_id
                )),
                Err(e) => run.fail("Failed to preserve state", e.to_string()),
            },
            ActionType::ValidateState => {
                let live = self.registry.count_instances(unit_id);
                match self.store.latest_for_unit(unit_id).await {
                    Some(snapshot) if snapshot.instance_count != live => {
                        let warning = format!(
                            "Instance count drifted from {} to {live} for unit {unit_id}",
                            snapshot.instance_count
                        );
                        warn!(
                            unit_id = %unit_id,
                            expected = snapshot.instance_count,
                            live = live,
                            "Instance drift"
                        );
                        warnings.push(warning.clone());
                        run.succeed(warning)
                    }
                    Some(_) => run.succeed(format!("{live} instances consistent with snapshot")),
                    None => run.succeed(format!("{live} live instances, no snapshot to compare")),
                }
            }
            ActionType::EmergencyShutdown => {
                match self.runtime.emergency_shutdown(unit_id, &failure.message).await {
                    Ok(()) => run.succeed(format!("Unit {unit_id} shut down")),
                    Err(e) => run.fail("Emergency shutdown failed", e.to_string()),
                }
            }
            ActionType::FallbackActivation => {
                match self.runtime.activate_fallback(unit_id, &failure.message).await {
                    Ok(()) => run.succeed("Fallback mode activated"),
                    Err(e) => run.fail("Fallback activation failed", e.to_string()),
                }
            }
            ActionType::RestartUnit => match self.runtime.restart_unit(unit_id).await {
                Ok(()) => run.succeed(format!("Unit {unit_id} restarted")),
                Err(e) => run.fail("Restart failed", e.to_string()),
            },
            ActionType::ApplyHotfix => match failure.candidate_implementation.as_deref() {
                Some(hotfix) => match self.runtime.apply_hotfix(unit_id, hotfix).await {
                    Ok(()) => run.succeed("Hotfix applied"),
                    Err(e) => run.fail("Hotfix failed", e.to_string()),
                },
                None => run.fail("Hotfix failed", "no hotfix implementation supplied"),
            },
            ActionType::CleanupResources => match self.runtime.cleanup_resources(unit_id).await {
                Ok(()) => run.succeed("Resources released"),
                Err(e) => run.fail("Resource cleanup failed", e.to_string()),
            },
            ActionType::NotifyOperators => {
                let message = format!("{}: {}", failure.kind, failure.message);
                match self.runtime.notify_operators(unit_id, &message).await {
                    Ok(()) => run.succeed("Operators notified"),
                    Err(e) => run.fail("Operator notification failed", e.to_string()),
                }
            }
        };

        vec![action]
    }

    async fn target_snapshot(&self, failure: &FailureReport) -> Result<Arc<Snapshot>, String> {
        match failure.snapshot_id.as_deref() {
            Some(snapshot_id) => self.store.get(snapshot_id).await.map_err(|e| e.to_string()),
            None => self
                .store
                .latest_for_unit(&failure.unit_id)
                .await
                .ok_or_else(|| format!("No snapshot available for unit {}", failure.unit_id)),
        }
    }

    async fn rollback(
        &self,
        failure: &FailureReport,
        escalation: &mut Escalation,
    ) -> Vec<RecoveryAction> {
        let run = ActionRun::start(ActionType::RollbackSnapshot);

        let snapshot = match self.target_snapshot(failure).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let action = run.fail("Rollback not possible", e);
                return self.fall_back(failure, action, escalation).await;
            }
        };

        let outcome = self
            .coordinator
            .rollback_with_timeout(&snapshot, self.config.rollback_timeout())
            .await;

        match outcome.status {
            RollbackStatus::TimedOut => {
                // The restore keeps running, so the unit state is unknown.
                escalation.timed_out = true;
                escalation.unresolved_rollback = true;
                vec![run.fail("Rollback timed out", outcome.message)]
            }
            _ if outcome.success => vec![run.succeed(outcome.message)],
            _ => {
                let action = run.fail("Rollback failed", outcome.message);
                self.fall_back(failure, action, escalation).await
            }
        }
    }

    /// Try fallback mode after a rollback could not restore the unit.
    async fn fall_back(
        &self,
        failure: &FailureReport,
        failed_rollback: RecoveryAction,
        escalation: &mut Escalation,
    ) -> Vec<RecoveryAction> {
        if !self.config.fallback_on_rollback_failure {
            escalation.unresolved_rollback = true;
            return vec![failed_rollback];
        }

        let run = ActionRun::start(ActionType::FallbackActivation);
        let reason = format!("rollback failed: {}", failure.message);
        let fallback = match self.runtime.activate_fallback(&failure.unit_id, &reason).await {
            Ok(()) => run.succeed("Fallback mode activated after failed rollback"),
            Err(e) => {
                escalation.unresolved_rollback = true;
                run.fail("Fallback activation failed", e.to_string())
            }
        };
        vec![failed_rollback, fallback]
    }

    async fn retry(&self, failure: &FailureReport, policy: &RetryPolicy) -> RecoveryAction {
        let run = ActionRun::start(ActionType::RetryOperation);
        let Some(candidate) = failure.candidate_implementation.as_deref() else {
            return run.fail("Retry not possible", "no candidate implementation to re-apply");
        };

        let max_attempts = policy.attempts();
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.applier.apply_update(&failure.unit_id, candidate).await {
                Ok(()) => {
                    info!(unit_id = %failure.unit_id, attempt = attempt, "Retry succeeded");
                    return run
                        .attempts(attempt)
                        .succeed(format!("Operation succeeded on attempt {attempt}"));
                }
                Err(e) => {
                    warn!(
                        unit_id = %failure.unit_id,
                        attempt = attempt,
                        error = %e,
                        "Retry attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(policy.backoff_after(attempt)).await;
                    }
                }
            }
        }

        run.attempts(max_attempts)
            .fail(format!("Retry exhausted after {max_attempts} attempts"), last_error)
    }
}
