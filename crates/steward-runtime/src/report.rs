use chrono::{DateTime, Utc};
use serde::Serialize;
use steward_core::{
    Decision, DuplicateFinding, OutcomeClass, Outcome, PlanStatus, RejectedFinding, RunStatus,
    StepStatus,
};
use steward_ledger::PlanState;
use uuid::Uuid;

/// Final report of one pass of the control loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub plan_id: Option<Uuid>,
    pub repository: String,
    pub status: RunStatus,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_status: Option<PlanStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// Steps whose effects were neither applied cleanly nor undone.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub uncompensated: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedFinding>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub duplicates: Vec<DuplicateFinding>,
}

impl RunReport {
    /// Non-zero only when the run failed and left something uncompensated.
    pub fn exit_code(&self) -> i32 {
        if self.status == RunStatus::Failed && !self.uncompensated.is_empty() {
            1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    pub id: String,
    pub action: String,
    pub target: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensation_of: Option<String>,
}

/// What the ledger says about one plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    pub plan_id: Uuid,
    pub repository: String,
    pub created_at: DateTime<Utc>,
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeClass>,
    pub steps: Vec<StepSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub uncompensated: Vec<String>,
}

impl PlanSummary {
    pub fn from_state(ps: &PlanState) -> Self {
        Self {
            plan_id: ps.plan.id,
            repository: ps.plan.repository.clone(),
            created_at: ps.plan.created_at,
            status: ps.plan.status,
            closed: ps.closed.as_ref().map(|c| c.status),
            reason: ps.closed.as_ref().map(|c| c.reason.clone()),
            outcome: ps.latest_outcome().map(|o| o.class),
            steps: ps
                .plan
                .steps
                .iter()
                .map(|s| StepSummary {
                    id: s.id.clone(),
                    action: s.action.clone(),
                    target: s.target.clone(),
                    status: s.status,
                    attempts: s.attempts,
                    reason: s.reason.clone(),
                    compensation_of: s.compensation_of.clone(),
                })
                .collect(),
            uncompensated: ps
                .uncompensated_steps()
                .into_iter()
                .map(|s| s.id.clone())
                .collect(),
        }
    }
}
