//! Step and plan state machines.
//!
//! ```text
//! step:  pending -> running -> succeeded | failed
//!        pending -> skipped
//!        failed -> compensated            (compensation succeeded)
//!        succeeded -> compensated         (rollback)
//!
//! plan:  pending -> running -> succeeded | degraded | failed
//! ```

use crate::Step;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensated,
    Skipped,
}

impl StepStatus {
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Failed, Compensated)
                | (Succeeded, Compensated)
        )
    }

    /// No further work is scheduled for a step in this status.
    ///
    /// `failed` and `succeeded` still admit a move to `compensated`, but the
    /// scheduler never dispatches them again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Compensated => "compensated",
            StepStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Running,
    Succeeded,
    Degraded,
    Failed,
}

impl PlanStatus {
    /// Aggregate status of a plan, computed purely from its steps.
    ///
    /// Compensation steps keep the plan `running` while they are in flight
    /// but never count towards the final classification.
    pub fn aggregate(steps: &[Step]) -> PlanStatus {
        if steps.iter().any(|s| !s.status.is_terminal()) {
            let started = steps.iter().any(|s| s.status != StepStatus::Pending);
            return if started {
                PlanStatus::Running
            } else {
                PlanStatus::Pending
            };
        }

        let primary = || steps.iter().filter(|s| !s.is_compensation());

        if primary().any(|s| !s.optional && s.status == StepStatus::Failed) {
            return PlanStatus::Failed;
        }

        let degraded = primary().any(|s| match s.status {
            StepStatus::Compensated => true,
            StepStatus::Skipped => !s.optional,
            StepStatus::Failed => s.optional,
            _ => false,
        });
        if degraded {
            PlanStatus::Degraded
        } else {
            PlanStatus::Succeeded
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Succeeded | PlanStatus::Degraded | PlanStatus::Failed
        )
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Running => "running",
            PlanStatus::Succeeded => "succeeded",
            PlanStatus::Degraded => "degraded",
            PlanStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Final status of one pass of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Degraded,
    Failed,
    /// Every step was blocked by policy; nothing ran.
    Blocked,
    /// Stopped by a cancellation signal; the plan can be resumed.
    Cancelled,
    /// Plan-only mode: decisions were computed but nothing was recorded.
    Planned,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Degraded => "degraded",
            RunStatus::Failed => "failed",
            RunStatus::Blocked => "blocked",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Planned => "planned",
        };
        write!(f, "{s}")
    }
}
