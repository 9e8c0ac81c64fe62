//! Reacting to outcomes.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use steward_core::{AdapterConfig, DegradedPolicy, Demotion, Outcome, OutcomeClass, StepStatus};
use steward_ledger::RunLedger;
use uuid::Uuid;

use crate::cancel::Cancellation;
use crate::error::RunError;
use crate::executor::{Executor, RollbackReport};
use crate::feedback::{FeedbackEvent, FeedbackKind, FeedbackSeverity, FeedbackSink};

/// What the adapter decided to do with an outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Adaptation {
    Closed,
    /// Watch one more window before deciding.
    Reobserve,
    Demoted(Vec<Demotion>),
    RolledBack(RollbackReport),
}

pub struct Adapter {
    ledger: Arc<RunLedger>,
    executor: Executor,
    feedback: Arc<dyn FeedbackSink>,
    config: AdapterConfig,
}

impl Adapter {
    pub fn new(
        ledger: Arc<RunLedger>,
        executor: Executor,
        feedback: Arc<dyn FeedbackSink>,
        config: AdapterConfig,
    ) -> Self {
        Self {
            ledger,
            executor,
            feedback,
            config,
        }
    }

    /// Act on an outcome. `round` counts observation windows for this plan,
    /// starting at 1.
    pub async fn adapt(
        &self,
        plan_id: Uuid,
        outcome: &Outcome,
        round: u32,
        cancel: &Cancellation,
    ) -> Result<Adaptation, RunError> {
        match outcome.class {
            OutcomeClass::Healthy => {
                self.feedback.emit(
                    FeedbackEvent::new(
                        plan_id,
                        FeedbackKind::PlanSucceeded,
                        FeedbackSeverity::Info,
                        outcome.reason.clone(),
                    )
                    .with_detail(json!({ "signals": outcome.signals })),
                );
                Ok(Adaptation::Closed)
            }
            OutcomeClass::Degraded => {
                if self.config.on_degraded == DegradedPolicy::Reobserve && round < 2 {
                    tracing::warn!(plan_id = %plan_id, reason = %outcome.reason, "Degraded; observing once more");
                    self.feedback.emit(FeedbackEvent::new(
                        plan_id,
                        FeedbackKind::Reobserve,
                        FeedbackSeverity::Warning,
                        outcome.reason.clone(),
                    ));
                    return Ok(Adaptation::Reobserve);
                }
                let demotions = self.demote(plan_id, &outcome.reason).await?;
                self.feedback.emit(
                    FeedbackEvent::new(
                        plan_id,
                        FeedbackKind::PlanDegraded,
                        FeedbackSeverity::Warning,
                        outcome.reason.clone(),
                    )
                    .with_detail(json!({ "demoted": demotions })),
                );
                Ok(Adaptation::Demoted(demotions))
            }
            OutcomeClass::Failed => {
                let report = self
                    .roll_back(plan_id, &format!("outcome failed: {}", outcome.reason), cancel)
                    .await?;
                Ok(Adaptation::RolledBack(report))
            }
        }
    }

    /// Downgrade every action the plan executed to simulate-only for the
    /// cool-down period. Actions this plan already demoted keep their
    /// existing demotion.
    async fn demote(&self, plan_id: Uuid, reason: &str) -> Result<Vec<Demotion>, RunError> {
        let (actions, mut demotions): (BTreeSet<String>, Vec<Demotion>) = self
            .ledger
            .read(|s| {
                s.plan(&plan_id)
                    .map(|ps| {
                        let actions = ps
                            .plan
                            .steps
                            .iter()
                            .filter(|st| !st.is_compensation() && st.status == StepStatus::Succeeded)
                            .map(|st| st.action.clone())
                            .filter(|action| !ps.demotions.iter().any(|d| &d.action == action))
                            .collect();
                        (actions, ps.demotions.clone())
                    })
                    .unwrap_or_default()
            })
            .await;

        let until = Utc::now() + ChronoDuration::seconds(self.config.cooldown_secs as i64);
        for action in actions {
            let demotion = Demotion {
                action,
                until,
                reason: format!("plan {plan_id} degraded: {reason}"),
            };
            self.ledger.record_demotion(plan_id, &demotion).await?;
            tracing::warn!(
                plan_id = %plan_id,
                action = %demotion.action,
                until = %demotion.until,
                "Action demoted to simulate"
            );
            demotions.push(demotion);
        }
        Ok(demotions)
    }

    /// Roll the plan back and surface whatever could not be undone.
    pub async fn roll_back(
        &self,
        plan_id: Uuid,
        reason: &str,
        cancel: &Cancellation,
    ) -> Result<RollbackReport, RunError> {
        let report = self.executor.rollback(plan_id, reason, cancel).await?;
        self.feedback.emit(
            FeedbackEvent::new(
                plan_id,
                FeedbackKind::RolledBack,
                FeedbackSeverity::Error,
                reason.to_string(),
            )
            .with_detail(json!({
                "compensated": report.compensated,
                "uncompensated": report.uncompensated,
            })),
        );

        let uncompensated: Vec<String> = self
            .ledger
            .read(|s| {
                s.plan(&plan_id)
                    .map(|ps| {
                        ps.uncompensated_steps()
                            .into_iter()
                            .map(|st| st.id.clone())
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .await;
        if !uncompensated.is_empty() {
            tracing::error!(
                plan_id = %plan_id,
                steps = ?uncompensated,
                "Uncompensated failure; manual follow-up required"
            );
            self.feedback.emit(
                FeedbackEvent::new(
                    plan_id,
                    FeedbackKind::UncompensatedFailure,
                    FeedbackSeverity::Critical,
                    format!("{} step(s) left uncompensated", uncompensated.len()),
                )
                .with_detail(json!({ "steps": uncompensated })),
            );
        }
        Ok(report)
    }
}
