//! Rollback of units to previously captured snapshots.
//!
//! - [`RollbackCoordinator`] runs single-unit and cascading rollbacks
//! - [`ConflictResolver`] detects collisions with concurrent work and applies
//!   a [`ConflictResolutionStrategy`]
//! - [`InFlightRegistry`] enforces one active rollback per unit
//! - [`DependencyGraph`] derives cascade order from unit dependencies

mod cascade;
mod conflict;
mod coordinator;
mod inflight;
mod types;

pub use cascade::{CascadePlan, DependencyGraph};
pub use conflict::ConflictResolver;
pub use coordinator::RollbackCoordinator;
pub use inflight::{InFlightRegistry, RollbackLease, UpdateLease};
pub use types::{
    CascadingRollbackOutcome, ConflictKind, ConflictResolutionOutcome, ConflictResolutionStrategy,
    RollbackOperationKind, RollbackOutcome, RollbackStatus,
};
