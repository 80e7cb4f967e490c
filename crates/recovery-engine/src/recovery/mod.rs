//! Failure classification and recovery execution.

mod manager;
mod mapper;
mod types;

pub use manager::RecoveryManager;
pub use mapper::RecoveryStrategyMapper;
pub use types::{
    ActionType, FailureReport, FinalState, RecoveryAction, RecoveryOutcome, RecoveryPhase,
    RecoveryStrategy, StrategySelection,
};
