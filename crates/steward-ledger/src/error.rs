//! Error types for the ledger crate.

use steward_core::StepStatus;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while appending to or replaying the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A line in the middle of the ledger could not be decoded.
    #[error("corrupt ledger entry at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("entry sequence {seq} does not follow {last}")]
    OutOfOrder { seq: u64, last: u64 },

    #[error("plan {0} is already recorded")]
    DuplicatePlan(Uuid),

    #[error("unknown plan {0}")]
    UnknownPlan(Uuid),

    #[error("step '{step}' already exists in plan {plan}")]
    DuplicateStep { plan: Uuid, step: String },

    #[error("unknown step '{step}' in plan {plan}")]
    UnknownStep { plan: Uuid, step: String },

    #[error("step '{step}' cannot move from {from} to {to}")]
    InvalidTransition {
        step: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("step '{step}' cannot run: dependency '{dependency}' is {status}")]
    DependencyNotSatisfied {
        step: String,
        dependency: String,
        status: StepStatus,
    },

    #[error("irreversible step '{step}' cannot run without an approve decision")]
    ApprovalRequired { step: String },

    #[error("target '{target}' is held by running step '{holder}'")]
    ResourceBusy { target: String, holder: String },

    #[error("step '{step}' is not compensated: {reason}")]
    CompensationMissing { step: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
