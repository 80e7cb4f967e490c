//! Maps classified failures to recovery strategies.

use std::collections::HashMap;
use tracing::{debug, warn};

use super::types::{ActionType, RecoveryStrategy, StrategySelection};
use crate::config::RetryPolicy;
use crate::error::{ApplierError, ErrorKind, ValidationError};

/// Total mapping from [`ErrorKind`] to a [`StrategySelection`].
///
/// Every kind has a default; [`register`](Self::register) replaces the
/// strategy for one kind, which is how restart and hotfix strategies are
/// wired in.
#[derive(Debug, Clone)]
pub struct RecoveryStrategyMapper {
    retry: RetryPolicy,
    overrides: HashMap<ErrorKind, RecoveryStrategy>,
}

impl RecoveryStrategyMapper {
    #[must_use]
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            overrides: HashMap::new(),
        }
    }

    /// Use `strategy` for `kind` instead of the default.
    pub fn register(&mut self, kind: ErrorKind, strategy: RecoveryStrategy) {
        debug!(kind = kind.as_str(), strategy = %strategy, "Registered recovery strategy override");
        self.overrides.insert(kind, strategy);
    }

    #[must_use]
    pub fn select(&self, kind: ErrorKind) -> StrategySelection {
        if let Some(strategy) = self.overrides.get(&kind) {
            return StrategySelection {
                strategy: strategy.clone(),
                actions: strategy.actions().to_vec(),
                warnings: Vec::new(),
            };
        }
        self.default_selection(kind)
    }

    fn default_selection(&self, kind: ErrorKind) -> StrategySelection {
        let (strategy, actions) = match kind {
            ErrorKind::ValidationError => (
                RecoveryStrategy::RejectAndNotify,
                vec![ActionType::NotifyOperators],
            ),
            ErrorKind::RedefinitionFailure => {
                (RecoveryStrategy::Rollback, vec![ActionType::RollbackSnapshot])
            }
            ErrorKind::InstanceUpdateError => (
                RecoveryStrategy::PreserveAndInvestigate,
                vec![ActionType::PreserveState, ActionType::ValidateState],
            ),
            ErrorKind::FileSystemError | ErrorKind::NetworkError => (
                RecoveryStrategy::Retry {
                    policy: self.retry.clone(),
                },
                vec![ActionType::RetryOperation],
            ),
            ErrorKind::ResourceError => (
                RecoveryStrategy::EmergencyShutdown,
                vec![ActionType::CleanupResources, ActionType::EmergencyShutdown],
            ),
            ErrorKind::SecurityError | ErrorKind::CriticalSystemError => (
                RecoveryStrategy::EmergencyShutdown,
                vec![ActionType::EmergencyShutdown, ActionType::NotifyOperators],
            ),
            ErrorKind::ConfigurationError => (
                RecoveryStrategy::Fallback,
                vec![ActionType::FallbackActivation],
            ),
            ErrorKind::UnknownError => {
                warn!("Unrecognised failure kind, no recovery action taken");
                return StrategySelection {
                    strategy: RecoveryStrategy::NoActionRequired,
                    actions: Vec::new(),
                    warnings: vec!["Unknown error kind; no recovery action taken".to_string()],
                };
            }
        };

        StrategySelection {
            strategy,
            actions,
            warnings: Vec::new(),
        }
    }

    /// Classify an applier failure.
    #[must_use]
    pub fn classify_applier_error(error: &ApplierError) -> ErrorKind {
        ErrorKind::from(error)
    }

    #[must_use]
    pub fn classify_validation_error(error: &ValidationError) -> ErrorKind {
        ErrorKind::from(error)
    }
}

impl Default for RecoveryStrategyMapper {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
