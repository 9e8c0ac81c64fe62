//! The risk gate.
//!
//! Verdicts are a pure function of the policy table, the step (its action,
//! target and the risk/reversibility snapshot taken from the catalog) and
//! the demotions active at `now`. Explicit rules are tried in order; the
//! first match wins. Without a match the default table applies:
//!
//! | risk / reversibility                 | verdict    |
//! |--------------------------------------|------------|
//! | `high` or `irreversible`             | `block`    |
//! | `medium` or `compensable`            | `simulate` |
//! | `low` and `reversible`               | `approve`  |
//!
//! A `block` is a normal outcome, never an error.

use crate::error::GateError;
use crate::rules::CompiledRule;
use chrono::{DateTime, Utc};
use serde_json::Value;
use steward_core::{
    Decision, DecisionSubject, Demotion, PolicyConfig, Reversibility, RiskClass, Step, Verdict,
};

/// Inputs besides the step that may influence a verdict.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub now: DateTime<Utc>,
    pub demotions: &'a [Demotion],
}

impl<'a> GateContext<'a> {
    pub fn new(now: DateTime<Utc>, demotions: &'a [Demotion]) -> Self {
        Self { now, demotions }
    }
}

/// Result of a dry-run, as seen by the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct DryRunReport {
    pub ok: bool,
    pub changes: usize,
    pub detail: String,
}

impl DryRunReport {
    pub fn succeeded(diff: Option<&Value>) -> Self {
        let changes = count_changes(diff);
        Self {
            ok: true,
            changes,
            detail: format!("{changes} change(s)"),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            changes: 0,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskGate {
    rules: Vec<CompiledRule>,
    max_simulated_changes: usize,
}

impl RiskGate {
    pub fn new(config: &PolicyConfig) -> Result<Self, GateError> {
        let rules = config
            .rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules,
            max_simulated_changes: config.max_simulated_changes,
        })
    }

    pub fn decide_step(&self, step: &Step, ctx: &GateContext<'_>) -> Decision {
        let (verdict, reason, rule) = match self.rules.iter().find(|r| r.matches(step)) {
            Some(rule) => (
                rule.verdict,
                format!("matched policy rule '{}'", rule.name),
                Some(rule.name.clone()),
            ),
            None => {
                let (verdict, reason) = default_verdict(step.risk, step.reversibility);
                (verdict, reason, None)
            }
        };

        let demotion = ctx
            .demotions
            .iter()
            .filter(|d| d.action == step.action && d.is_active(ctx.now))
            .max_by_key(|d| d.until);

        let decision = match (verdict, demotion) {
            (Verdict::Approve, Some(d)) => Decision {
                subject: step_subject(step),
                verdict: Verdict::Simulate,
                reason: format!(
                    "{reason}; demoted to simulate until {}: {}",
                    d.until.to_rfc3339(),
                    d.reason
                ),
                rule,
            },
            _ => Decision {
                subject: step_subject(step),
                verdict,
                reason,
                rule,
            },
        };

        tracing::debug!(
            step_id = %step.id,
            action = %step.action,
            verdict = %decision.verdict,
            reason = %decision.reason,
            "step decision"
        );
        decision
    }

    /// Second decision for a `simulate` step once its dry-run is known.
    pub fn redecide(&self, step: &Step, dry_run: &DryRunReport) -> Decision {
        let (verdict, reason) = if !dry_run.ok {
            (Verdict::Block, format!("dry-run failed: {}", dry_run.detail))
        } else if dry_run.changes > self.max_simulated_changes {
            (
                Verdict::Block,
                format!(
                    "dry-run would make {} change(s), limit is {}",
                    dry_run.changes, self.max_simulated_changes
                ),
            )
        } else {
            (Verdict::Approve, format!("dry-run ok: {}", dry_run.detail))
        };
        Decision {
            subject: step_subject(step),
            verdict,
            reason,
            rule: None,
        }
    }

    /// Plan-level verdict derived from the step verdicts.
    ///
    /// `block` only when every step is blocked, `simulate` when any step
    /// needs a dry-run, `approve` otherwise.
    pub fn decide_plan(&self, step_decisions: &[Decision]) -> Decision {
        let count = |v: Verdict| step_decisions.iter().filter(|d| d.verdict == v).count();
        let (approved, simulated, blocked) = (
            count(Verdict::Approve),
            count(Verdict::Simulate),
            count(Verdict::Block),
        );

        let verdict = if step_decisions.is_empty() {
            Verdict::Approve
        } else if blocked == step_decisions.len() {
            Verdict::Block
        } else if simulated > 0 {
            Verdict::Simulate
        } else {
            Verdict::Approve
        };

        Decision {
            subject: DecisionSubject::Plan,
            verdict,
            reason: format!(
                "{} step(s): {approved} approved, {simulated} simulated, {blocked} blocked",
                step_decisions.len()
            ),
            rule: None,
        }
    }
}

fn default_verdict(risk: RiskClass, reversibility: Reversibility) -> (Verdict, String) {
    if risk == RiskClass::High || reversibility == Reversibility::Irreversible {
        (
            Verdict::Block,
            format!("{risk} risk, {reversibility} action with no allow rule"),
        )
    } else if risk == RiskClass::Medium || reversibility == Reversibility::Compensable {
        (
            Verdict::Simulate,
            format!("{risk} risk, {reversibility} action requires a dry-run"),
        )
    } else {
        (
            Verdict::Approve,
            format!("{risk} risk, {reversibility} action"),
        )
    }
}

fn step_subject(step: &Step) -> DecisionSubject {
    DecisionSubject::Step {
        step_id: step.id.clone(),
    }
}

/// Number of changes described by a backend diff.
///
/// Arrays count their elements, objects with a `changes` array count that,
/// other objects count their keys, scalars count as one change.
pub fn count_changes(diff: Option<&Value>) -> usize {
    match diff {
        None | Some(Value::Null) => 0,
        Some(Value::Array(items)) => items.len(),
        Some(Value::Object(map)) => match map.get("changes") {
            Some(Value::Array(items)) => items.len(),
            _ => map.len(),
        },
        Some(_) => 1,
    }
}
