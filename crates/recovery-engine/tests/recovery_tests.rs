//! Integration tests for failure recovery and guarded updates.

mod common;

use common::{init_tracing, ListValidator, RecordingRuntime, ScriptedApplier};
use recovery_engine::{
    ActionType, EngineConfig, ErrorKind, FailureReport, FinalState, RecoveryContext,
    RecoveryEngine, RecoveryStrategy, RetryPolicy, StaticInstanceCounts,
};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            multiplier: 2.0,
            max_backoff_ms: 2,
        },
        ..EngineConfig::default()
    }
}

fn engine(applier: Arc<ScriptedApplier>, runtime: Arc<RecordingRuntime>) -> RecoveryEngine {
    let counts = Arc::new(StaticInstanceCounts::new());
    counts.set("U1", 2);
    RecoveryEngine::builder(applier)
        .registry(counts)
        .runtime(runtime)
        .config(fast_config())
        .build()
}

// =============================================================================
// Batch recovery
// =============================================================================

#[tokio::test]
async fn batch_preserves_order_and_flags_critical_failures() {
    init_tracing();
    let runtime = Arc::new(RecordingRuntime::default());
    let engine = engine(ScriptedApplier::new(), runtime.clone());
    let ctx = RecoveryContext::new("orchestrator").with_correlation_id("batch-1");

    let failures = vec![
        FailureReport::new("U1", ErrorKind::ValidationError, "schema mismatch"),
        FailureReport::new("U2", ErrorKind::CriticalSystemError, "out of memory"),
        FailureReport::new("U3", ErrorKind::NetworkError, "connection reset"),
    ];

    let outcomes = engine.recover_batch(&failures, &ctx).await;
    assert_eq!(outcomes.len(), 3);
    for (failure, outcome) in failures.iter().zip(&outcomes) {
        assert_eq!(outcome.original_error_id, failure.error_id);
        assert_eq!(outcome.unit_id, failure.unit_id);
    }

    assert_eq!(outcomes[0].strategy, RecoveryStrategy::RejectAndNotify);
    assert!(outcomes[0].success);

    assert_eq!(outcomes[1].strategy, RecoveryStrategy::EmergencyShutdown);
    assert!(outcomes[1].manual_intervention_required);

    assert!(matches!(outcomes[2].strategy, RecoveryStrategy::Retry { .. }));
    assert!(!outcomes[2].success);

    assert_eq!(runtime.calls(), vec!["notify:U1", "shutdown:U2", "notify:U2"]);

    let stats = engine.statistics();
    assert_eq!(stats.total_operations, 3);
    assert_eq!(stats.successful_operations, 2);
    assert_eq!(outcomes[2].statistics.total_operations, 3);
}

#[tokio::test]
async fn empty_batch_returns_nothing() {
    let engine = engine(ScriptedApplier::new(), Arc::new(RecordingRuntime::default()));
    let outcomes = engine.recover_batch(&[], &RecoveryContext::system()).await;
    assert!(outcomes.is_empty());
    assert_eq!(engine.statistics().total_operations, 0);
    assert!(engine.is_healthy());
}

// =============================================================================
// Rollback-class recovery
// =============================================================================

#[tokio::test]
async fn redefinition_failure_rolls_back_latest_snapshot() {
    let applier = ScriptedApplier::new();
    let engine = engine(applier.clone(), Arc::new(RecordingRuntime::default()));
    engine
        .create_snapshot_with_implementation("U1", b"v1".to_vec())
        .await
        .unwrap();

    let failure = FailureReport::new("U1", ErrorKind::RedefinitionFailure, "verifier error");
    let outcome = engine
        .recover_from_failure(&failure, &RecoveryContext::system())
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.final_state, FinalState::Succeeded);
    assert_eq!(outcome.actions_taken[0].action_type, ActionType::RollbackSnapshot);
    assert_eq!(applier.restores(), 2);
    assert_eq!(engine.rollback_statistics().successful_operations, 1);
    // Counted once, as the recovery.
    assert_eq!(engine.statistics().total_operations, 1);
}

#[tokio::test]
async fn slow_rollback_ends_in_timed_out_state() {
    let applier = ScriptedApplier::new();
    applier.set_delay(Duration::from_millis(60));
    let counts = Arc::new(StaticInstanceCounts::new());
    let engine = RecoveryEngine::builder(applier)
        .registry(counts)
        .config(EngineConfig {
            rollback_timeout_ms: 10,
            ..fast_config()
        })
        .build();
    engine.create_snapshot("U1").await.unwrap();

    let failure = FailureReport::new("U1", ErrorKind::RedefinitionFailure, "hung");
    let outcome = engine
        .recover_from_failure(&failure, &RecoveryContext::system())
        .await;

    assert_eq!(outcome.final_state, FinalState::TimedOut);
    assert!(!outcome.success);
    assert!(outcome.manual_intervention_required);
}

#[tokio::test]
async fn rollback_failure_with_working_fallback_is_not_escalated() {
    let applier = ScriptedApplier::new();
    applier.fail_for("U1");
    let runtime = Arc::new(RecordingRuntime::default());
    let engine = engine(applier, runtime.clone());
    engine.create_snapshot("U1").await.unwrap();

    let failure = FailureReport::new("U1", ErrorKind::RedefinitionFailure, "rejected");
    let outcome = engine
        .recover_from_failure(&failure, &RecoveryContext::system())
        .await;

    assert!(!outcome.success);
    assert!(!outcome.manual_intervention_required);
    assert_eq!(outcome.actions_taken[1].action_type, ActionType::FallbackActivation);
    assert!(outcome.actions_taken[1].successful);
    assert_eq!(runtime.calls(), vec!["fallback:U1"]);
}

#[tokio::test]
async fn rollback_failure_without_fallback_requires_manual_intervention() {
    let applier = ScriptedApplier::new();
    applier.fail_for("U1");
    let runtime = Arc::new(RecordingRuntime {
        fail_fallback: true,
        ..RecordingRuntime::default()
    });
    let engine = engine(applier, runtime.clone());
    engine.create_snapshot("U1").await.unwrap();

    let failure = FailureReport::new("U1", ErrorKind::RedefinitionFailure, "rejected");
    let outcome = engine
        .recover_from_failure(&failure, &RecoveryContext::system())
        .await;

    assert!(!outcome.success);
    assert!(outcome.manual_intervention_required);
    assert_eq!(outcome.actions_taken.len(), 2);
    assert_eq!(runtime.calls(), vec!["fallback:U1"]);
}

// =============================================================================
// Strategy overrides
// =============================================================================

#[tokio::test]
async fn registered_restart_strategy_replaces_default() {
    let runtime = Arc::new(RecordingRuntime::default());
    let engine = RecoveryEngine::builder(ScriptedApplier::new())
        .runtime(runtime.clone())
        .strategy(ErrorKind::InstanceUpdateError, RecoveryStrategy::Restart)
        .build();

    let failure = FailureReport::new("svc", ErrorKind::InstanceUpdateError, "stuck");
    let outcome = engine
        .recover_from_failure(&failure, &RecoveryContext::system())
        .await;

    assert!(outcome.success);
    let actions: Vec<ActionType> = outcome
        .actions_taken
        .iter()
        .map(|a| a.action_type)
        .collect();
    assert_eq!(actions, vec![ActionType::RestartUnit, ActionType::ValidateState]);
    assert_eq!(runtime.calls(), vec!["restart:svc"]);
}

// =============================================================================
// Guarded updates
// =============================================================================

#[tokio::test]
async fn successful_update_needs_no_recovery() {
    let applier = ScriptedApplier::new();
    let engine = RecoveryEngine::builder(applier.clone())
        .validator(Arc::new(ListValidator::default()))
        .build();

    let attempt = engine
        .attempt_update(
            "U1",
            b"v2".to_vec(),
            Some(b"v1".to_vec()),
            &RecoveryContext::system(),
        )
        .await
        .unwrap();

    assert!(attempt.applied);
    assert!(attempt.recovery.is_none());
    assert!(attempt.validation.unwrap().compatible);
    assert_eq!(applier.applies(), 1);
    let snapshot = engine.snapshot(&attempt.snapshot_id).await.unwrap();
    assert_eq!(snapshot.prior_implementation.as_deref(), Some(b"v1".as_slice()));
}

#[tokio::test]
async fn incompatible_update_is_rejected_before_applying() {
    let applier = ScriptedApplier::new();
    let runtime = Arc::new(RecordingRuntime::default());
    let engine = RecoveryEngine::builder(applier.clone())
        .runtime(runtime.clone())
        .validator(Arc::new(ListValidator {
            incompatible: vec![b"bad".to_vec()],
        }))
        .build();

    let attempt = engine
        .attempt_update("U1", b"bad".to_vec(), None, &RecoveryContext::system())
        .await
        .unwrap();

    assert!(!attempt.applied);
    assert_eq!(applier.applies(), 0);
    let recovery = attempt.recovery.unwrap();
    assert_eq!(recovery.error_kind, ErrorKind::ValidationError);
    assert_eq!(runtime.calls(), vec!["notify:U1"]);
}

#[tokio::test]
async fn failed_update_is_rolled_back() {
    let applier = ScriptedApplier::new();
    applier.fail_for("U1");
    let engine = RecoveryEngine::builder(applier.clone()).build();

    let attempt = engine
        .attempt_update(
            "U1",
            b"v2".to_vec(),
            Some(b"v1".to_vec()),
            &RecoveryContext::system(),
        )
        .await
        .unwrap();

    assert!(!attempt.applied);
    let recovery = attempt.recovery.unwrap();
    assert_eq!(recovery.error_kind, ErrorKind::RedefinitionFailure);
    assert_eq!(recovery.strategy, RecoveryStrategy::Rollback);
    assert_eq!(applier.restores(), 1);
}

#[tokio::test]
async fn empty_unit_id_is_a_contract_error() {
    let engine = RecoveryEngine::builder(ScriptedApplier::new()).build();
    let result = engine
        .attempt_update("", b"v2".to_vec(), None, &RecoveryContext::system())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn engine_accepts_json_configuration() -> anyhow::Result<()> {
    let config = EngineConfig::from_json(
        r#"{"rollback_timeout_ms": 250, "cascade_conflict_strategy": "prefer_current"}"#,
    )?;
    let engine = RecoveryEngine::builder(ScriptedApplier::new())
        .config(config)
        .build();

    assert_eq!(engine.config().rollback_timeout(), Duration::from_millis(250));
    assert_eq!(engine.config().retry.max_attempts, 3);
    Ok(())
}
