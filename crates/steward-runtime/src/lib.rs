//! # steward-runtime
//!
//! The moving parts of the control loop:
//!
//! - [`Executor`]: schedules a plan's steps over the ledger, with
//!   per-target locks, timeouts, retries and compensation.
//! - [`Observer`]: polls monitoring signals after a plan finishes and
//!   classifies the result.
//! - [`Adapter`]: closes, re-observes, demotes or rolls back based on the
//!   outcome.
//! - [`Agent`]: wires them to an [`Analyzer`](steward_planner::Analyzer)
//!   and the plan builder, and drives a plan from findings to closed.
//!
//! External systems are reached only through [`ActionBackend`],
//! [`SignalSource`] and [`FeedbackSink`].

pub mod adapter;
pub mod agent;
pub mod backend;
pub mod cancel;
pub mod error;
pub mod executor;
pub mod feedback;
pub mod locks;
pub mod observer;
pub mod report;
pub mod retry;

pub use adapter::{Adaptation, Adapter};
pub use agent::{Agent, Collaborators, RunMode};
pub use backend::{ActionBackend, ActionOutcome};
pub use cancel::Cancellation;
pub use error::{BackendError, RunError, SignalError};
pub use executor::{Compensation, Executor, RollbackReport};
pub use feedback::{
    ChannelFeedbackSink, FeedbackEvent, FeedbackKind, FeedbackSeverity, FeedbackSink,
    FeedbackWriter, JsonlFeedbackWriter, TracingFeedbackSink,
};
pub use observer::{Observer, Sample, SignalSource, SignalWindow, classify};
pub use report::{PlanSummary, RunReport, StepSummary};
