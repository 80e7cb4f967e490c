//! Snapshot-based rollback and recovery for live unit redefinition.
//!
//! The engine sits next to whatever applies new implementations to running
//! units. Before a risky redefinition it captures a snapshot; when the
//! redefinition fails it classifies the failure, picks a recovery strategy
//! and, for rollback-class strategies, restores the unit from its snapshot.
//! Every snapshot and rollback is recorded in a hash-chained audit trail.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use recovery_engine::{ErrorKind, FailureReport, RecoveryContext, RecoveryEngine};
//! use recovery_engine::{EngineError, UpdateApplier};
//! # async fn run(applier: Arc<dyn UpdateApplier>) -> Result<(), EngineError> {
//! let engine = RecoveryEngine::builder(applier).build();
//!
//! let snapshot = engine.create_snapshot("billing-service").await?;
//! let failure = FailureReport::new(
//!     "billing-service",
//!     ErrorKind::RedefinitionFailure,
//!     "verifier rejected class",
//! )
//! .with_snapshot(snapshot.snapshot_id.clone());
//!
//! let outcome = engine
//!     .recover_from_failure(&failure, &RecoveryContext::new("hot-reload"))
//!     .await;
//! if outcome.manual_intervention_required {
//!     eprintln!("billing-service needs an operator: {:?}", outcome.recovery_error);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`SnapshotStore`] owns snapshot lifetime and retention sweeps
//! - [`AuditTrail`] records snapshot and rollback events
//! - [`RollbackCoordinator`] restores single units and cascades
//! - [`ConflictResolver`] handles rollbacks racing other work on a unit
//! - [`RecoveryStrategyMapper`] maps an [`ErrorKind`] to a [`RecoveryStrategy`]
//! - [`RecoveryManager`] executes strategies and keeps statistics
//! - [`RecoveryEngine`] wires them together behind one facade
//!
//! The runtime itself is reached only through the traits in [`ports`].

pub mod audit;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod instances;
pub mod ports;
pub mod recovery;
pub mod rollback;
pub mod snapshot;
pub mod stats;

pub use audit::{AuditEntry, AuditEntryKind, AuditExport, AuditTrail};
pub use config::{EngineConfig, RetryPolicy};
pub use context::RecoveryContext;
pub use engine::{CleanupOutcome, RecoveryEngine, RecoveryEngineBuilder, UpdateAttempt};
pub use error::{
    ApplierError, ControlError, EngineError, EngineResult, ErrorKind, ValidationError,
};
pub use instances::{InstanceHandle, InstanceTracker, StaticInstanceCounts};
pub use ports::{
    CompatibilityValidator, InstanceRegistry, LoggingRuntimeControl, RuntimeControl,
    UpdateApplier, ValidationReport,
};
pub use recovery::{
    ActionType, FailureReport, FinalState, RecoveryAction, RecoveryManager, RecoveryOutcome,
    RecoveryPhase, RecoveryStrategy, RecoveryStrategyMapper,
};
pub use rollback::{
    CascadingRollbackOutcome, ConflictKind, ConflictResolutionOutcome, ConflictResolutionStrategy,
    ConflictResolver, DependencyGraph, InFlightRegistry, RollbackCoordinator, RollbackOperationKind,
    RollbackOutcome, RollbackStatus, UpdateLease,
};
pub use snapshot::{Snapshot, SnapshotPin, SnapshotStore, SweepReport};
pub use stats::RecoveryStatistics;
