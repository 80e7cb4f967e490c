//! Operation counters and the statistics derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Point-in-time view of operation counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub total_operations: u64,
    pub successful_operations: u64,
    /// Percentage in `[0, 100]`; zero when nothing has run yet
    pub success_rate: f64,
    pub last_operation_time: Option<DateTime<Utc>>,
}

impl RecoveryStatistics {
    #[must_use]
    pub fn new(
        total_operations: u64,
        successful_operations: u64,
        last_operation_time: Option<DateTime<Utc>>,
    ) -> Self {
        let successful_operations = successful_operations.min(total_operations);
        let success_rate = if total_operations == 0 {
            0.0
        } else {
            (successful_operations as f64 / total_operations as f64 * 100.0).clamp(0.0, 100.0)
        };

        Self {
            total_operations,
            successful_operations,
            success_rate,
            last_operation_time,
        }
    }

    #[must_use]
    pub fn failed_operations(&self) -> u64 {
        self.total_operations - self.successful_operations
    }

    #[must_use]
    pub fn has_operations(&self) -> bool {
        self.total_operations > 0
    }

    /// Whether the success rate meets `threshold` (a percentage).
    ///
    /// An engine that has not run anything yet is healthy.
    #[must_use]
    pub fn is_healthy(&self, threshold: f64) -> bool {
        !self.has_operations() || self.success_rate >= threshold
    }
}

impl Default for RecoveryStatistics {
    fn default() -> Self {
        Self::new(0, 0, None)
    }
}

/// Lock-free totals shared between concurrent callers.
#[derive(Debug, Default)]
pub(crate) struct OperationCounters {
    total: AtomicU64,
    successful: AtomicU64,
    last_operation: Mutex<Option<DateTime<Utc>>>,
}

impl OperationCounters {
    pub(crate) fn record(&self, success: bool, at: DateTime<Utc>) {
        self.total.fetch_add(1, Ordering::SeqCst);
        if success {
            self.successful.fetch_add(1, Ordering::SeqCst);
        }

        let mut last = self
            .last_operation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.is_none_or(|prev| prev < at) {
            *last = Some(at);
        }
    }

    pub(crate) fn statistics(&self) -> RecoveryStatistics {
        let last = *self
            .last_operation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Read successful first so a concurrent record never yields successful > total.
        let successful = self.successful.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        RecoveryStatistics::new(total, successful, last)
    }
}
