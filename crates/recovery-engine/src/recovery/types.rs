use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::ErrorKind;
use crate::stats::RecoveryStatistics;

/// A discrete remediation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    RollbackSnapshot,
    PreserveState,
    RetryOperation,
    EmergencyShutdown,
    FallbackActivation,
    RestartUnit,
    ApplyHotfix,
    ValidateState,
    CleanupResources,
    NotifyOperators,
}

impl ActionType {
    /// Default priority; higher runs first when actions compete.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::EmergencyShutdown => 100,
            Self::RollbackSnapshot => 90,
            Self::NotifyOperators => 80,
            Self::PreserveState => 70,
            Self::CleanupResources => 60,
            Self::FallbackActivation => 50,
            Self::RestartUnit | Self::ApplyHotfix => 40,
            Self::RetryOperation => 30,
            Self::ValidateState => 20,
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::RollbackSnapshot => "Roll back to the last snapshot",
            Self::PreserveState => "Preserve current state for investigation",
            Self::RetryOperation => "Retry the failed operation",
            Self::EmergencyShutdown => "Shut the unit down",
            Self::FallbackActivation => "Activate fallback mode",
            Self::RestartUnit => "Restart the unit",
            Self::ApplyHotfix => "Apply a hotfix",
            Self::ValidateState => "Validate unit state",
            Self::CleanupResources => "Release unit resources",
            Self::NotifyOperators => "Notify operators",
        }
    }

    #[must_use]
    pub const fn requires_immediate_attention(self) -> bool {
        matches!(self, Self::EmergencyShutdown | Self::NotifyOperators)
    }

    /// Whether the action changes the unit or its runtime.
    #[must_use]
    pub const fn modifies_state(self) -> bool {
        !matches!(
            self,
            Self::PreserveState | Self::ValidateState | Self::NotifyOperators
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Record of one executed recovery step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub action_type: ActionType,
    pub description: String,
    pub successful: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
    pub error: Option<String>,
    /// Always at least 1
    pub attempts: u32,
    pub priority: u8,
}

/// Timer for an action in progress.
pub(crate) struct ActionRun {
    action_type: ActionType,
    start_time: DateTime<Utc>,
    started: Instant,
    attempts: u32,
}

impl ActionRun {
    pub(crate) fn start(action_type: ActionType) -> Self {
        Self {
            action_type,
            start_time: Utc::now(),
            started: Instant::now(),
            attempts: 1,
        }
    }

    pub(crate) fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub(crate) fn succeed(self, description: impl Into<String>) -> RecoveryAction {
        self.finish(description.into(), None)
    }

    pub(crate) fn fail(
        self,
        description: impl Into<String>,
        error: impl Into<String>,
    ) -> RecoveryAction {
        self.finish(description.into(), Some(error.into()))
    }

    fn finish(self, description: String, error: Option<String>) -> RecoveryAction {
        let duration = self.started.elapsed();
        let end_time = self.start_time
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        RecoveryAction {
            action_type: self.action_type,
            description,
            successful: error.is_none(),
            start_time: self.start_time,
            end_time,
            duration,
            error,
            attempts: self.attempts,
            priority: self.action_type.priority(),
        }
    }
}

/// A failure reported to the recovery manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub error_id: String,
    pub unit_id: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Operation that was running when the failure happened
    pub operation: Option<String>,
    /// Snapshot to roll back to; the unit's latest is used when absent
    pub snapshot_id: Option<String>,
    /// Implementation to re-apply on retry or to use as a hotfix
    pub candidate_implementation: Option<Vec<u8>>,
    pub occurred_at: DateTime<Utc>,
}

impl FailureReport {
    #[must_use]
    pub fn new(unit_id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_id: Uuid::new_v4().to_string(),
            unit_id: unit_id.into(),
            kind,
            message: message.into(),
            operation: None,
            snapshot_id: None,
            candidate_implementation: None,
            occurred_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    #[must_use]
    pub fn with_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    #[must_use]
    pub fn with_candidate(mut self, implementation: Vec<u8>) -> Self {
        self.candidate_implementation = Some(implementation);
        self
    }
}

/// Remediation chosen for an error kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RejectAndNotify,
    Rollback,
    PreserveAndInvestigate,
    Retry { policy: RetryPolicy },
    EmergencyShutdown,
    Fallback,
    Restart,
    Hotfix,
    NoActionRequired,
}

impl RecoveryStrategy {
    /// Actions the strategy runs, in order.
    #[must_use]
    pub const fn actions(&self) -> &'static [ActionType] {
        match self {
            Self::RejectAndNotify => &[ActionType::NotifyOperators],
            Self::Rollback => &[ActionType::RollbackSnapshot],
            Self::PreserveAndInvestigate => &[ActionType::PreserveState, ActionType::ValidateState],
            Self::Retry { .. } => &[ActionType::RetryOperation],
            Self::EmergencyShutdown => &[ActionType::EmergencyShutdown],
            Self::Fallback => &[ActionType::FallbackActivation],
            Self::Restart => &[ActionType::RestartUnit, ActionType::ValidateState],
            Self::Hotfix => &[ActionType::ApplyHotfix, ActionType::ValidateState],
            Self::NoActionRequired => &[],
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RejectAndNotify => "reject_and_notify",
            Self::Rollback => "rollback",
            Self::PreserveAndInvestigate => "preserve_and_investigate",
            Self::Retry { .. } => "retry",
            Self::EmergencyShutdown => "emergency_shutdown",
            Self::Fallback => "fallback",
            Self::Restart => "restart",
            Self::Hotfix => "hotfix",
            Self::NoActionRequired => "no_action_required",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A strategy together with the concrete actions selected for one failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySelection {
    pub strategy: RecoveryStrategy,
    pub actions: Vec<ActionType>,
    pub warnings: Vec<String>,
}

/// Steps of a single recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    Received,
    Classified,
    ActionSelected,
    Executing,
    Succeeded,
    Failed,
    TimedOut,
    Recorded,
}

/// Terminal state of a recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalState {
    Succeeded,
    Failed,
    TimedOut,
}

impl FinalState {
    #[must_use]
    pub const fn phase(self) -> RecoveryPhase {
        match self {
            Self::Succeeded => RecoveryPhase::Succeeded,
            Self::Failed => RecoveryPhase::Failed,
            Self::TimedOut => RecoveryPhase::TimedOut,
        }
    }
}

/// Everything done in response to one failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub strategy: RecoveryStrategy,
    pub original_error_id: String,
    pub unit_id: String,
    pub error_kind: ErrorKind,
    pub retry_attempts: u32,
    pub operation_duration: Duration,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub recovery_error: Option<String>,
    pub actions_taken: Vec<RecoveryAction>,
    pub warnings: Vec<String>,
    pub manual_intervention_required: bool,
    /// Manager statistics after this recovery was counted
    pub statistics: RecoveryStatistics,
    pub final_state: FinalState,
    pub phase_history: Vec<RecoveryPhase>,
}

impl RecoveryOutcome {
    #[must_use]
    pub fn failed_actions(&self) -> impl Iterator<Item = &RecoveryAction> {
        self.actions_taken.iter().filter(|a| !a.successful)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_run_records_attempts() {
        let action = ActionRun::start(ActionType::RetryOperation)
            .attempts(0)
            .fail("retry exhausted", "io");
        assert_eq!(action.attempts, 1);
        assert!(!action.successful);
        assert_eq!(action.error.as_deref(), Some("io"));
        assert!(action.end_time >= action.start_time);
        assert_eq!(action.priority, ActionType::RetryOperation.priority());
    }

    #[test]
    fn test_strategy_actions() {
        assert!(RecoveryStrategy::NoActionRequired.actions().is_empty());
        assert_eq!(
            RecoveryStrategy::Hotfix.actions(),
            &[ActionType::ApplyHotfix, ActionType::ValidateState]
        );
    }

    #[test]
    fn test_action_predicates() {
        assert!(ActionType::EmergencyShutdown.requires_immediate_attention());
        assert!(ActionType::RollbackSnapshot.modifies_state());
        assert!(!ActionType::ValidateState.modifies_state());
        assert!(ActionType::EmergencyShutdown.priority() > ActionType::ValidateState.priority());
    }
}
