use steward_ledger::LedgerError;
use steward_planner::PlanError;
use steward_policy::{GateError, RegistryError};
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by an action backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Transient; the executor retries with backoff.
    #[error("retryable backend error: {0}")]
    Retryable(String),

    #[error("terminal backend error: {0}")]
    Terminal(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Retryable(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal '{signal}' unavailable: {message}")]
    Unavailable { signal: String, message: String },
}

/// Errors that abort a phase of the control loop.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("analysis unavailable for '{repository}': {message}")]
    AnalysisUnavailable { repository: String, message: String },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("unknown plan {0}")]
    UnknownPlan(Uuid),

    #[error("plan {plan_id} stalled: {detail}")]
    Stalled { plan_id: Uuid, detail: String },

    #[error("step task failed: {0}")]
    Task(String),
}
