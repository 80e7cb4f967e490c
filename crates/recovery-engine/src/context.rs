//! Explicit recovery session context.
//!
//! Every recovery call receives a [`RecoveryContext`] instead of reading a
//! global "current session". The context owns a tracing span; work scoped
//! with [`RecoveryContext::scope`] runs inside it and the previous span is
//! restored on every exit path.

use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::Instrument;
use uuid::Uuid;

/// Who started a recovery session and how it correlates with other work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryContext {
    /// Unique id of this session
    pub session_id: Uuid,
    /// Operator, service or subsystem that initiated the session
    pub initiated_by: String,
    /// Correlates this session with an external request or a parent session
    pub correlation_id: Option<String>,
}

impl RecoveryContext {
    #[must_use]
    pub fn new(initiated_by: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            initiated_by: initiated_by.into(),
            correlation_id: None,
        }
    }

    /// Context for work the engine starts on its own.
    #[must_use]
    pub fn system() -> Self {
        Self::new("system")
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// A nested session correlated with this one.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            initiated_by: self.initiated_by.clone(),
            correlation_id: Some(self.session_id.to_string()),
        }
    }

    #[must_use]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "recovery_session",
            session_id = %self.session_id,
            initiated_by = %self.initiated_by,
            correlation_id = self.correlation_id.as_deref().unwrap_or(""),
        )
    }

    /// Run `fut` inside this context's span.
    pub async fn scope<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        fut.instrument(self.span()).await
    }
}

impl Default for RecoveryContext {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_correlates_with_parent() {
        let parent = RecoveryContext::new("operator").with_correlation_id("req-1");
        let child = parent.child();

        assert_ne!(parent.session_id, child.session_id);
        assert_eq!(child.initiated_by, "operator");
        assert_eq!(
            child.correlation_id.as_deref(),
            Some(parent.session_id.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_scope_returns_inner_output() {
        let ctx = RecoveryContext::system();
        let value = ctx.scope(async { 42 }).await;
        assert_eq!(value, 42);
    }
}
