//! In-memory state reconstructed from ledger entries.
//!
//! [`LedgerState::apply`] is the only way state changes, both for the live
//! run and for replay, so replaying a ledger from empty yields exactly the
//! statuses the live run observed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use steward_core::{
    Decision, DecisionSubject, Demotion, Outcome, Plan, PlanStatus, Reversibility, RunStatus,
    Step, StepStatus, Verdict,
};
use uuid::Uuid;

use crate::entry::{LedgerEntry, LedgerRecord};
use crate::error::LedgerError;

/// Everything the ledger knows about one plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanState {
    pub plan: Plan,
    /// Decisions in the order they were recorded.
    pub decisions: Vec<Decision>,
    pub outcomes: Vec<Outcome>,
    /// Demotions this plan's outcomes caused.
    pub demotions: Vec<Demotion>,
    pub rollback: Option<RollbackSummary>,
    pub closed: Option<ClosedSummary>,
    /// Sequence number of the last entry touching this plan.
    pub last_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackSummary {
    pub reason: String,
    pub compensated: Vec<String>,
    pub uncompensated: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedSummary {
    pub status: RunStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl PlanState {
    /// The most recent decision about `step_id`.
    pub fn latest_step_decision(&self, step_id: &str) -> Option<&Decision> {
        self.decisions
            .iter()
            .rev()
            .find(|d| d.step_id() == Some(step_id))
    }

    pub fn plan_decision(&self) -> Option<&Decision> {
        self.decisions
            .iter()
            .rev()
            .find(|d| d.subject == DecisionSubject::Plan)
    }

    pub fn latest_outcome(&self) -> Option<&Outcome> {
        self.outcomes.last()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// The compensation step synthesized for `step_id`, if any.
    pub fn compensation_for(&self, step_id: &str) -> Option<&Step> {
        self.plan
            .steps
            .iter()
            .find(|s| s.compensation_of.as_deref() == Some(step_id))
    }

    /// Steps whose side effects were not undone: failed primary steps plus
    /// succeeded ones a rollback could not compensate.
    pub fn uncompensated_steps(&self) -> Vec<&Step> {
        let rolled_back: BTreeSet<&str> = self
            .rollback
            .iter()
            .flat_map(|r| r.uncompensated.iter().map(String::as_str))
            .collect();
        self.plan
            .steps
            .iter()
            .filter(|s| !s.is_compensation())
            .filter(|s| {
                s.status == StepStatus::Failed
                    || (s.status == StepStatus::Succeeded && rolled_back.contains(s.id.as_str()))
            })
            .collect()
    }
}

/// Identity of a step for deduplication: action, target and parameters.
pub type StepKey = (String, String, String);

pub fn step_key(action: &str, target: &str, params: &Value) -> StepKey {
    (action.to_string(), target.to_string(), params.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerState {
    plans: BTreeMap<Uuid, PlanState>,
    /// Plan ids in creation order.
    order: Vec<Uuid>,
    demotions: Vec<Demotion>,
    last_seq: u64,
}

impl LedgerState {
    /// Rebuild state from entries in sequence order.
    pub fn replay<'a>(
        entries: impl IntoIterator<Item = &'a LedgerEntry>,
    ) -> Result<Self, LedgerError> {
        let mut state = Self::default();
        for entry in entries {
            state.apply(entry)?;
        }
        Ok(state)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn plan(&self, id: &Uuid) -> Option<&PlanState> {
        self.plans.get(id)
    }

    /// Plans in creation order.
    pub fn plans(&self) -> impl Iterator<Item = &PlanState> {
        self.order.iter().filter_map(|id| self.plans.get(id))
    }

    pub fn demotions(&self) -> &[Demotion] {
        &self.demotions
    }

    pub fn active_demotions(&self, now: DateTime<Utc>) -> Vec<Demotion> {
        self.demotions
            .iter()
            .filter(|d| d.is_active(now))
            .cloned()
            .collect()
    }

    /// Primary steps that succeeded or are still pending/running, keyed by
    /// (action, target, params), with their "<plan>/<step>" location.
    pub fn live_step_keys(&self) -> BTreeMap<StepKey, String> {
        let mut keys = BTreeMap::new();
        for ps in self.plans() {
            for step in ps.plan.steps.iter().filter(|s| !s.is_compensation()) {
                if matches!(
                    step.status,
                    StepStatus::Pending | StepStatus::Running | StepStatus::Succeeded
                ) {
                    keys.entry(step_key(&step.action, &step.target, &step.params))
                        .or_insert_with(|| Step::location(&ps.plan.id, &step.id));
                }
            }
        }
        keys
    }

    /// Steps left `running` with no terminal entry, as (plan, step) pairs.
    pub fn interrupted_steps(&self) -> Vec<(Uuid, String)> {
        self.plans()
            .flat_map(|ps| {
                ps.plan
                    .steps
                    .iter()
                    .filter(|s| s.status == StepStatus::Running)
                    .map(|s| (ps.plan.id, s.id.clone()))
            })
            .collect()
    }

    /// Resolve a `<plan>/<step>` location.
    pub fn step_at(&self, location: &str) -> Option<&Step> {
        let (plan_id, step_id) = location.split_once('/')?;
        let plan_id = Uuid::parse_str(plan_id).ok()?;
        self.plans.get(&plan_id)?.plan.step(step_id)
    }

    /// Running step holding `target`, across all plans.
    pub fn running_on(&self, target: &str) -> Option<(Uuid, &Step)> {
        self.plans().find_map(|ps| {
            ps.plan
                .steps
                .iter()
                .find(|s| s.status == StepStatus::Running && s.target == target)
                .map(|s| (ps.plan.id, s))
        })
    }

    /// Check that `entry` may be appended. Does not modify state.
    pub fn validate(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        if entry.seq <= self.last_seq {
            return Err(LedgerError::OutOfOrder {
                seq: entry.seq,
                last: self.last_seq,
            });
        }

        let plan_id = entry.plan_id;
        if let LedgerRecord::PlanCreated { plan } = &entry.record {
            if self.plans.contains_key(&plan.id) || plan.id != plan_id {
                return Err(LedgerError::DuplicatePlan(plan.id));
            }
            return Ok(());
        }

        let ps = self
            .plans
            .get(&plan_id)
            .ok_or(LedgerError::UnknownPlan(plan_id))?;
        let find_step = |id: &str| {
            ps.plan.step(id).ok_or_else(|| LedgerError::UnknownStep {
                plan: plan_id,
                step: id.to_string(),
            })
        };

        match &entry.record {
            LedgerRecord::PlanCreated { .. } => Ok(()),
            LedgerRecord::StepAdded { step } => {
                if ps.plan.step(&step.id).is_some() {
                    return Err(LedgerError::DuplicateStep {
                        plan: plan_id,
                        step: step.id.clone(),
                    });
                }
                for dep in step.depends_on.iter().chain(step.compensation_of.iter()) {
                    find_step(dep)?;
                }
                Ok(())
            }
            LedgerRecord::Decision { decision } => {
                if let Some(step_id) = decision.step_id() {
                    find_step(step_id)?;
                }
                Ok(())
            }
            LedgerRecord::StepTransition {
                step_id, status, ..
            } => {
                let step = find_step(step_id)?;
                if !step.status.can_transition_to(*status) {
                    return Err(LedgerError::InvalidTransition {
                        step: step_id.clone(),
                        from: step.status,
                        to: *status,
                    });
                }
                match status {
                    StepStatus::Running => self.validate_start(ps, step),
                    StepStatus::Compensated => validate_compensated(ps, step),
                    _ => Ok(()),
                }
            }
            LedgerRecord::AttemptFailed { step_id, .. } => {
                let step = find_step(step_id)?;
                if step.status != StepStatus::Running {
                    return Err(LedgerError::InvalidTransition {
                        step: step_id.clone(),
                        from: step.status,
                        to: StepStatus::Running,
                    });
                }
                Ok(())
            }
            LedgerRecord::Rollback {
                compensated,
                uncompensated,
                ..
            } => {
                for id in compensated.iter().chain(uncompensated) {
                    find_step(id)?;
                }
                Ok(())
            }
            LedgerRecord::Outcome { .. }
            | LedgerRecord::Demotion { .. }
            | LedgerRecord::PlanClosed { .. } => Ok(()),
        }
    }

    fn validate_start(&self, ps: &PlanState, step: &Step) -> Result<(), LedgerError> {
        for dep_id in &step.depends_on {
            let Some(dep) = ps.plan.step(dep_id) else {
                return Err(LedgerError::UnknownStep {
                    plan: ps.plan.id,
                    step: dep_id.clone(),
                });
            };
            if !dependency_satisfied(dep) {
                return Err(LedgerError::DependencyNotSatisfied {
                    step: step.id.clone(),
                    dependency: dep_id.clone(),
                    status: dep.status,
                });
            }
        }
        for location in &step.awaits {
            let Some(dep) = self.step_at(location) else {
                return Err(LedgerError::UnknownStep {
                    plan: ps.plan.id,
                    step: location.clone(),
                });
            };
            if !dependency_satisfied(dep) {
                return Err(LedgerError::DependencyNotSatisfied {
                    step: step.id.clone(),
                    dependency: location.clone(),
                    status: dep.status,
                });
            }
        }

        if step.reversibility == Reversibility::Irreversible {
            let approved = ps
                .latest_step_decision(&step.id)
                .is_some_and(|d| d.verdict == Verdict::Approve);
            if !approved {
                return Err(LedgerError::ApprovalRequired {
                    step: step.id.clone(),
                });
            }
        }

        if let Some((_, holder)) = self.running_on(&step.target) {
            return Err(LedgerError::ResourceBusy {
                target: step.target.clone(),
                holder: holder.id.clone(),
            });
        }
        Ok(())
    }

    /// Validate and apply one entry.
    pub fn apply(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        self.validate(entry)?;
        self.apply_unchecked(entry);
        Ok(())
    }

    /// Apply an entry that already passed [`LedgerState::validate`].
    pub(crate) fn apply_unchecked(&mut self, entry: &LedgerEntry) {
        self.last_seq = entry.seq;

        if let LedgerRecord::PlanCreated { plan } = &entry.record {
            self.order.push(plan.id);
            let mut plan = plan.clone();
            plan.refresh_status();
            self.plans.insert(
                plan.id,
                PlanState {
                    plan,
                    decisions: Vec::new(),
                    outcomes: Vec::new(),
                    demotions: Vec::new(),
                    rollback: None,
                    closed: None,
                    last_seq: entry.seq,
                },
            );
            return;
        }

        if let LedgerRecord::Demotion { demotion } = &entry.record {
            self.demotions.push(demotion.clone());
        }

        let Some(ps) = self.plans.get_mut(&entry.plan_id) else {
            return;
        };
        ps.last_seq = entry.seq;

        match &entry.record {
            LedgerRecord::StepAdded { step } => {
                ps.plan.steps.push(step.clone());
            }
            LedgerRecord::Decision { decision } => {
                ps.decisions.push(decision.clone());
            }
            LedgerRecord::StepTransition {
                step_id,
                status,
                attempt,
                reason,
                ..
            } => {
                if let Some(step) = ps.plan.step_mut(step_id) {
                    step.status = *status;
                    step.attempts = step.attempts.max(*attempt);
                    if reason.is_some() {
                        step.reason = reason.clone();
                    }
                }
            }
            LedgerRecord::AttemptFailed {
                step_id, attempt, ..
            } => {
                if let Some(step) = ps.plan.step_mut(step_id) {
                    step.attempts = step.attempts.max(*attempt);
                }
            }
            LedgerRecord::Outcome { outcome } => {
                ps.outcomes.push(outcome.clone());
            }
            LedgerRecord::Demotion { demotion } => {
                ps.demotions.push(demotion.clone());
            }
            LedgerRecord::Rollback {
                reason,
                compensated,
                uncompensated,
            } => {
                ps.rollback = Some(RollbackSummary {
                    reason: reason.clone(),
                    compensated: compensated.clone(),
                    uncompensated: uncompensated.clone(),
                });
            }
            LedgerRecord::PlanClosed { status, reason } => {
                ps.closed = Some(ClosedSummary {
                    status: *status,
                    reason: reason.clone(),
                    at: entry.at,
                });
            }
            LedgerRecord::PlanCreated { .. } => {}
        }

        ps.plan.refresh_status();
    }

    /// Aggregate status of a plan, if known.
    pub fn plan_status(&self, id: &Uuid) -> Option<PlanStatus> {
        self.plans.get(id).map(|ps| ps.plan.status)
    }
}

/// Succeeded, or an optional step that was skipped.
pub fn dependency_satisfied(dep: &Step) -> bool {
    dep.status == StepStatus::Succeeded || (dep.optional && dep.status == StepStatus::Skipped)
}

fn validate_compensated(ps: &PlanState, step: &Step) -> Result<(), LedgerError> {
    match ps.compensation_for(&step.id) {
        Some(comp) if comp.status == StepStatus::Succeeded => Ok(()),
        Some(comp) => Err(LedgerError::CompensationMissing {
            step: step.id.clone(),
            reason: format!("compensation '{}' is {}", comp.id, comp.status),
        }),
        None => Err(LedgerError::CompensationMissing {
            step: step.id.clone(),
            reason: "no compensation step".to_string(),
        }),
    }
}
