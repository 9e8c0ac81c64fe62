use async_trait::async_trait;
use serde_json::Value;
use steward_core::ActionSpec;

use crate::error::BackendError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    /// What changed (or would change, for a dry-run).
    pub diff: Option<Value>,
    pub output: Value,
}

/// The system that actually performs actions.
#[async_trait]
pub trait ActionBackend: Send + Sync {
    /// Execute (or dry-run) one action against `target`.
    ///
    /// Must tell transient failures apart from terminal ones; the executor
    /// only retries [`BackendError::Retryable`].
    async fn execute(
        &self,
        spec: &ActionSpec,
        target: &str,
        params: &Value,
        dry_run: bool,
    ) -> Result<ActionOutcome, BackendError>;
}
