//! Multi-unit rollbacks.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::coordinator::RollbackCoordinator;
use super::types::{
    CascadingRollbackOutcome, RollbackOperationKind, RollbackOutcome, RollbackStatus,
};
use crate::snapshot::Snapshot;

/// Which units depend on which.
///
/// An edge `dependent -> dependency` means `dependent` must be rolled back
/// before `dependency`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    dependents: HashMap<String, Vec<String>>,
}

/// Rollback order computed from a [`DependencyGraph`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadePlan {
    /// Dependents first, the primary unit last
    pub order: Vec<String>,
    /// unit -> direct dependents found while walking the graph
    pub discovered: HashMap<String, Vec<String>>,
    pub warnings: Vec<String>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `dependent` depends on `dependency`.
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) {
        let entry = self.dependents.entry(dependency.to_string()).or_default();
        if !entry.iter().any(|d| d == dependent) {
            entry.push(dependent.to_string());
        }
    }

    #[must_use]
    pub fn dependents_of(&self, unit_id: &str) -> &[String] {
        self.dependents
            .get(unit_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Post-order walk from `primary` over its transitive dependents.
    #[must_use]
    pub fn plan(&self, primary: &str) -> CascadePlan {
        let mut plan = CascadePlan::default();
        let mut visited = HashSet::new();
        let mut on_path = Vec::new();
        self.visit(primary, &mut visited, &mut on_path, &mut plan);
        plan
    }

    fn visit(
        &self,
        unit: &str,
        visited: &mut HashSet<String>,
        on_path: &mut Vec<String>,
        plan: &mut CascadePlan,
    ) {
        if on_path.iter().any(|u| u == unit) {
            let warning = format!("Dependency cycle through unit {unit}, edge ignored");
            warn!(unit_id = %unit, "Dependency cycle detected");
            plan.warnings.push(warning);
            return;
        }
        if !visited.insert(unit.to_string()) {
            return;
        }

        let dependents = self.dependents_of(unit);
        if !dependents.is_empty() {
            plan.discovered.insert(unit.to_string(), dependents.to_vec());
        }

        on_path.push(unit.to_string());
        for dependent in dependents {
            self.visit(dependent, visited, on_path, plan);
        }
        on_path.pop();
        plan.order.push(unit.to_string());
    }
}

impl RollbackCoordinator {
    /// Roll back each snapshot in the order given.
    ///
    /// Failures do not stop the cascade. Conflicts found on a unit are
    /// resolved with the configured cascade strategy and reported alongside
    /// the individual outcomes.
    pub async fn rollback_cascading(
        &self,
        snapshots: &[Arc<Snapshot>],
    ) -> CascadingRollbackOutcome {
        let started = (Utc::now(), Instant::now());
        let primary_unit_id = snapshots
            .first()
            .map(|s| s.unit_id.clone())
            .unwrap_or_default();

        info!(
            primary_unit_id = %primary_unit_id,
            units = snapshots.len(),
            "Starting cascading rollback"
        );

        let mut outcomes = Vec::with_capacity(snapshots.len());
        let mut execution_order = Vec::with_capacity(snapshots.len());
        let mut resolutions = Vec::new();

        for snapshot in snapshots {
            execution_order.push(snapshot.unit_id.clone());

            let conflicts = self.resolver.detect(snapshot).await;
            let outcome = if conflicts.is_empty() {
                self.rollback_to_snapshot(snapshot, None).await
            } else {
                let resolution = self
                    .resolver
                    .resolve_detected(snapshot, self.cascade_strategy, conflicts)
                    .await;
                let outcome = match &resolution.rollback {
                    Some(rollback) => rollback.clone(),
                    None => {
                        let status = if resolution.resolved {
                            RollbackStatus::Skipped
                        } else {
                            RollbackStatus::Rejected
                        };
                        RollbackOutcome::new(
                            snapshot,
                            RollbackOperationKind::FullRestore,
                            status,
                            resolution.description.clone(),
                        )
                    }
                };
                resolutions.push(resolution);
                outcome
            };

            if !outcome.success {
                warn!(
                    unit_id = %snapshot.unit_id,
                    status = ?outcome.status,
                    "Cascade step failed, continuing with remaining units"
                );
            }
            outcomes.push(outcome);
        }

        let result = CascadingRollbackOutcome::from_parts(
            primary_unit_id,
            outcomes,
            execution_order,
            resolutions,
            started,
        );
        info!(
            primary_unit_id = %result.primary_unit_id,
            succeeded = result.succeeded_count,
            failed = result.failed_count,
            duration_ms = result.total_duration.as_millis(),
            "Cascading rollback finished"
        );
        result
    }

    /// Roll back `primary_unit` and everything that depends on it.
    ///
    /// Each unit is restored from its latest snapshot; units without one are
    /// skipped with a warning.
    pub async fn rollback_dependency_cascade(
        &self,
        primary_unit: &str,
        graph: &DependencyGraph,
    ) -> CascadingRollbackOutcome {
        let plan = graph.plan(primary_unit);
        let mut warnings = plan.warnings;
        let mut snapshots = Vec::with_capacity(plan.order.len());

        for unit_id in &plan.order {
            match self.store.latest_for_unit(unit_id).await {
                Some(snapshot) => snapshots.push(snapshot),
                None => {
                    warn!(unit_id = %unit_id, "No snapshot available, unit skipped");
                    warnings.push(format!("No snapshot available for unit {unit_id}"));
                }
            }
        }

        let mut result = self.rollback_cascading(&snapshots).await;
        result.primary_unit_id = primary_unit.to_string();
        result.discovered_dependencies = plan.discovered;
        result.warnings.extend(warnings);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_orders_dependents_first() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("api", "db");
        graph.add_dependency("web", "api");
        graph.add_dependency("worker", "db");

        let plan = graph.plan("db");
        assert_eq!(plan.order, vec!["web", "api", "worker", "db"]);
        assert_eq!(plan.discovered["db"], vec!["api", "worker"]);
        assert_eq!(plan.discovered["api"], vec!["web"]);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_plan_survives_cycles() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("a", "b");
        graph.add_dependency("b", "a");

        let plan = graph.plan("a");
        assert_eq!(plan.order, vec!["b", "a"]);
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn test_unknown_unit_plans_itself() {
        let graph = DependencyGraph::new();
        let plan = graph.plan("solo");
        assert_eq!(plan.order, vec!["solo"]);
        assert!(plan.discovered.is_empty());
    }
}
