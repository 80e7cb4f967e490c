//! Engine configuration.
//!
//! Values come from [`EngineConfig::default`], from JSON, or from `RECOVERY_*`
//! environment variables:
//!
//! - `RECOVERY_SNAPSHOT_MAX_AGE_SECS`: retention for
//!   [`cleanup_expired`](crate::RecoveryEngine::cleanup_expired)
//! - `RECOVERY_ROLLBACK_TIMEOUT_MS`: deadline for rollbacks run during recovery
//! - `RECOVERY_CONFLICT_WAIT_MS`: how long conflict resolution waits for an in-flight rollback
//! - `RECOVERY_CASCADE_STRATEGY`: conflict strategy used inside cascades
//! - `RECOVERY_MAX_RETRIES`: retry budget for transient failures
//! - `RECOVERY_HEALTHY_SUCCESS_RATE`: success-rate percentage considered healthy
//! - `RECOVERY_FALLBACK_ON_ROLLBACK_FAILURE`: activate fallback mode when a rollback fails

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::rollback::ConflictResolutionStrategy;

const ENV_SNAPSHOT_MAX_AGE_SECS: &str = "RECOVERY_SNAPSHOT_MAX_AGE_SECS";
const ENV_ROLLBACK_TIMEOUT_MS: &str = "RECOVERY_ROLLBACK_TIMEOUT_MS";
const ENV_CONFLICT_WAIT_MS: &str = "RECOVERY_CONFLICT_WAIT_MS";
const ENV_CASCADE_STRATEGY: &str = "RECOVERY_CASCADE_STRATEGY";
const ENV_MAX_RETRIES: &str = "RECOVERY_MAX_RETRIES";
const ENV_HEALTHY_SUCCESS_RATE: &str = "RECOVERY_HEALTHY_SUCCESS_RATE";
const ENV_FALLBACK_ON_ROLLBACK_FAILURE: &str = "RECOVERY_FALLBACK_ON_ROLLBACK_FAILURE";

/// Configuration shared by every engine component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Snapshots older than this are removed by scheduled cleanup
    pub snapshot_max_age_secs: u64,
    /// Deadline for rollbacks executed as recovery actions
    pub rollback_timeout_ms: u64,
    /// Upper bound on waiting for a conflicting rollback to finish
    pub conflict_wait_timeout_ms: u64,
    /// Poll interval while waiting on a conflicting rollback
    pub conflict_poll_interval_ms: u64,
    /// Strategy applied when a cascade step detects a conflict
    pub cascade_conflict_strategy: ConflictResolutionStrategy,
    /// Retry policy for transient failures
    pub retry: RetryPolicy,
    /// Success-rate percentage at or above which the engine is healthy
    pub healthy_success_rate: f64,
    /// Try fallback mode before escalating a failed rollback
    pub fallback_on_rollback_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_max_age_secs: 3600,
            rollback_timeout_ms: 5_000,
            conflict_wait_timeout_ms: 250,
            conflict_poll_interval_ms: 10,
            cascade_conflict_strategy: ConflictResolutionStrategy::ForceRollback,
            retry: RetryPolicy::default(),
            healthy_success_rate: 80.0,
            fallback_on_rollback_failure: true,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `RECOVERY_*` environment variables.
    ///
    /// Unset or unparsable variables keep their default value.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, ENV_SNAPSHOT_MAX_AGE_SECS) {
            config.snapshot_max_age_secs = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_ROLLBACK_TIMEOUT_MS) {
            config.rollback_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_CONFLICT_WAIT_MS) {
            config.conflict_wait_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_CASCADE_STRATEGY) {
            config.cascade_conflict_strategy = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_RETRIES) {
            config.retry.max_attempts = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, ENV_HEALTHY_SUCCESS_RATE) {
            config.healthy_success_rate = v.clamp(0.0, 100.0);
        }
        if let Some(v) = lookup(ENV_FALLBACK_ON_ROLLBACK_FAILURE) {
            config.fallback_on_rollback_failure = v.eq_ignore_ascii_case("true") || v == "1";
        }

        config
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn snapshot_max_age(&self) -> Duration {
        Duration::from_secs(self.snapshot_max_age_secs)
    }

    #[must_use]
    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_millis(self.rollback_timeout_ms)
    }

    #[must_use]
    pub fn conflict_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.conflict_wait_timeout_ms)
    }

    #[must_use]
    pub fn conflict_poll_interval(&self) -> Duration {
        Duration::from_millis(self.conflict_poll_interval_ms.max(1))
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Wait before the second attempt
    pub initial_backoff_ms: u64,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Cap on any single wait
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Wait after the given failed attempt (1-indexed).
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// At least one attempt is always made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            (ENV_ROLLBACK_TIMEOUT_MS, "1500"),
            (ENV_CASCADE_STRATEGY, "abort_on_conflict"),
            (ENV_MAX_RETRIES, "5"),
            (ENV_FALLBACK_ON_ROLLBACK_FAILURE, "false"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(|key| vars.get(key).map(ToString::to_string));

        assert_eq!(config.rollback_timeout(), Duration::from_millis(1500));
        assert_eq!(
            config.cascade_conflict_strategy,
            ConflictResolutionStrategy::AbortOnConflict
        );
        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.fallback_on_rollback_failure);
        assert_eq!(config.snapshot_max_age_secs, 3600);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = EngineConfig::from_lookup(|key| match key {
            ENV_ROLLBACK_TIMEOUT_MS => Some("soon".to_string()),
            ENV_HEALTHY_SUCCESS_RATE => Some("250".to_string()),
            _ => None,
        });

        assert_eq!(config.rollback_timeout_ms, 5_000);
        assert!((config.healthy_success_rate - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            EngineConfig::from_json(r#"{"rollback_timeout_ms": 20, "retry": {"max_attempts": 1}}"#)
                .unwrap();
        assert_eq!(config.rollback_timeout_ms, 20);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert_eq!(config.conflict_wait_timeout_ms, 250);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 1_000,
        };
        assert_eq!(policy.backoff_after(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_after(8), Duration::from_millis(1_000));
    }
}
