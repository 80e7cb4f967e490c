use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::snapshot::Snapshot;

/// What a rollback puts back in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOperationKind {
    /// Implementation (when captured) and instance state
    FullRestore,
    InstanceStateRestore,
    ImplementationRestore,
}

impl RollbackOperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FullRestore => "full_restore",
            Self::InstanceStateRestore => "instance_state_restore",
            Self::ImplementationRestore => "implementation_restore",
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::FullRestore => "full restore of implementation and instance state",
            Self::InstanceStateRestore => "instance state restore",
            Self::ImplementationRestore => "implementation restore",
        }
    }
}

impl fmt::Display for RollbackOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single rollback attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Succeeded,
    /// The applier reported an error or panicked
    Failed,
    /// The deadline passed first; the restore keeps running
    TimedOut,
    /// Another rollback of the unit was active, or a conflict blocked it
    Rejected,
    /// The same snapshot and operation already succeeded
    AlreadyRestored,
    /// Conflict resolution chose to keep the current state
    Skipped,
}

impl RollbackStatus {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::AlreadyRestored | Self::Skipped)
    }

    /// Whether the attempt reached the applier and counts as an operation.
    #[must_use]
    pub const fn is_operation(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

/// Result of one rollback attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub operation_kind: RollbackOperationKind,
    pub status: RollbackStatus,
    pub success: bool,
    pub message: String,
    pub unit_id: String,
    pub snapshot_id: String,
    pub timestamp: DateTime<Utc>,
}

impl RollbackOutcome {
    pub(crate) fn new(
        snapshot: &Snapshot,
        operation_kind: RollbackOperationKind,
        status: RollbackStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation_kind,
            status,
            success: status.is_success(),
            message: message.into(),
            unit_id: snapshot.unit_id.clone(),
            snapshot_id: snapshot.snapshot_id.clone(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.status == RollbackStatus::TimedOut
    }
}

/// How to proceed when a rollback collides with concurrent work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionStrategy {
    /// Restore the implementation, keep concurrently mutated instance state
    MergeChanges,
    /// Roll back unless an update is still being applied
    PreferRollback,
    /// Keep the current state and skip the rollback
    PreferCurrent,
    /// Give up on any conflict
    AbortOnConflict,
    /// Roll back regardless of soft conflicts
    ForceRollback,
    /// Escalate to an operator
    ManualResolution,
}

impl ConflictResolutionStrategy {
    pub const ALL: [Self; 6] = [
        Self::MergeChanges,
        Self::PreferRollback,
        Self::PreferCurrent,
        Self::AbortOnConflict,
        Self::ForceRollback,
        Self::ManualResolution,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MergeChanges => "merge_changes",
            Self::PreferRollback => "prefer_rollback",
            Self::PreferCurrent => "prefer_current",
            Self::AbortOnConflict => "abort_on_conflict",
            Self::ForceRollback => "force_rollback",
            Self::ManualResolution => "manual_resolution",
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::MergeChanges => "Merge rollback with current changes",
            Self::PreferRollback => "Prefer rollback state over current changes",
            Self::PreferCurrent => "Prefer current state over rollback",
            Self::AbortOnConflict => "Abort rollback when conflicts are detected",
            Self::ForceRollback => "Force rollback ignoring conflicts",
            Self::ManualResolution => "Require manual conflict resolution",
        }
    }

    #[must_use]
    pub const fn requires_manual_intervention(self) -> bool {
        matches!(self, Self::ManualResolution)
    }

    /// Discards concurrent changes.
    #[must_use]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::ForceRollback | Self::PreferRollback)
    }

    #[must_use]
    pub const fn is_conservative(self) -> bool {
        matches!(self, Self::AbortOnConflict | Self::PreferCurrent)
    }
}

impl fmt::Display for ConflictResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| format!("unknown conflict resolution strategy: {s}"))
    }
}

/// A hazard found for a unit about to be rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    RollbackInFlight,
    UpdateInFlight,
    /// A newer snapshot of the unit exists
    StaleSnapshot,
    /// The live instance count no longer matches the snapshot
    InstanceDrift,
}

impl ConflictKind {
    /// Blocking conflicts must clear before anything is restored.
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::RollbackInFlight | Self::UpdateInFlight)
    }
}

/// Result of resolving conflicts for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolutionOutcome {
    pub resolved: bool,
    pub strategy_used: Option<ConflictResolutionStrategy>,
    /// Conflicts detected before resolution
    pub conflicts: Vec<ConflictKind>,
    pub description: String,
    pub unit_id: String,
    pub timestamp: DateTime<Utc>,
    pub requires_manual_intervention: bool,
    /// Rollback performed as part of the resolution, if any
    pub rollback: Option<RollbackOutcome>,
}

impl ConflictResolutionOutcome {
    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Aggregate result of rolling back several units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadingRollbackOutcome {
    pub overall_success: bool,
    pub primary_unit_id: String,
    pub individual_outcomes: Vec<RollbackOutcome>,
    /// Every unit touched, in the order touched
    pub execution_order: Vec<String>,
    pub total_duration: Duration,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub succeeded_count: usize,
    pub failed_count: usize,
    pub conflict_resolutions: Vec<ConflictResolutionOutcome>,
    pub discovered_dependencies: HashMap<String, Vec<String>>,
    pub warnings: Vec<String>,
    pub details: String,
}

impl CascadingRollbackOutcome {
    /// Derive counts and overall success from the individual outcomes.
    pub(crate) fn from_parts(
        primary_unit_id: String,
        individual_outcomes: Vec<RollbackOutcome>,
        execution_order: Vec<String>,
        conflict_resolutions: Vec<ConflictResolutionOutcome>,
        started: (DateTime<Utc>, std::time::Instant),
    ) -> Self {
        let succeeded_count = individual_outcomes.iter().filter(|o| o.success).count();
        let failed_count = individual_outcomes.len() - succeeded_count;
        let overall_success = failed_count == 0;
        let details = format!(
            "Cascading rollback of {} units: {succeeded_count} succeeded, {failed_count} failed",
            individual_outcomes.len()
        );

        Self {
            overall_success,
            primary_unit_id,
            individual_outcomes,
            execution_order,
            total_duration: started.1.elapsed(),
            start_time: started.0,
            end_time: Utc::now(),
            succeeded_count,
            failed_count,
            conflict_resolutions,
            discovered_dependencies: HashMap::new(),
            warnings: Vec::new(),
            details,
        }
    }

    #[must_use]
    pub fn resolved_conflict_count(&self) -> usize {
        self.conflict_resolutions.iter().filter(|c| c.resolved).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "abort_on_conflict".parse::<ConflictResolutionStrategy>(),
            Ok(ConflictResolutionStrategy::AbortOnConflict)
        );
        assert_eq!(
            "Force-Rollback".parse::<ConflictResolutionStrategy>(),
            Ok(ConflictResolutionStrategy::ForceRollback)
        );
        assert!("ignore".parse::<ConflictResolutionStrategy>().is_err());
    }

    #[test]
    fn test_strategy_predicates() {
        use ConflictResolutionStrategy as S;
        assert!(S::ManualResolution.requires_manual_intervention());
        assert!(S::ForceRollback.is_destructive());
        assert!(S::PreferRollback.is_destructive());
        assert!(S::AbortOnConflict.is_conservative());
        assert!(S::PreferCurrent.is_conservative());
        assert!(!S::MergeChanges.is_destructive() && !S::MergeChanges.is_conservative());
    }

    #[test]
    fn test_status_success() {
        assert!(RollbackStatus::Succeeded.is_success());
        assert!(RollbackStatus::AlreadyRestored.is_success());
        assert!(!RollbackStatus::TimedOut.is_success());
        assert!(!RollbackStatus::Rejected.is_success());
        assert!(!RollbackStatus::Failed.is_success());
        assert!(RollbackStatus::TimedOut.is_operation());
        assert!(!RollbackStatus::AlreadyRestored.is_operation());
        assert!(!RollbackStatus::Rejected.is_operation());
    }

    #[test]
    fn test_cascade_counts_are_consistent() {
        let snapshot = Snapshot {
            snapshot_id: "s".to_string(),
            unit_id: "U1".to_string(),
            instance_count: 0,
            prior_implementation: None,
            created_at: Utc::now(),
        };
        let kind = RollbackOperationKind::FullRestore;
        let outcomes = vec![
            RollbackOutcome::new(&snapshot, kind, RollbackStatus::Succeeded, "ok"),
            RollbackOutcome::new(&snapshot, kind, RollbackStatus::Failed, "boom"),
        ];
        let cascade = CascadingRollbackOutcome::from_parts(
            "U1".to_string(),
            outcomes,
            vec!["U1".to_string()],
            Vec::new(),
            (Utc::now(), std::time::Instant::now()),
        );

        assert_eq!(
            cascade.succeeded_count + cascade.failed_count,
            cascade.individual_outcomes.len()
        );
        assert!(!cascade.overall_success);
    }
}
