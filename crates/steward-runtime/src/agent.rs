//! The plan, execute, observe, adapt loop.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use steward_core::{
    Decision, ObservationSpec, Outcome, OutcomeClass, PlanStatus, RunStatus, StepStatus,
    StewardConfig, Verdict,
};
use steward_ledger::{PlanState, RunLedger};
use steward_planner::{Analyzer, OrderingTable, PlanBuilder};
use steward_policy::{ActionRegistry, GateContext, RiskGate};
use uuid::Uuid;

use crate::adapter::{Adaptation, Adapter};
use crate::backend::ActionBackend;
use crate::cancel::Cancellation;
use crate::error::RunError;
use crate::executor::Executor;
use crate::feedback::{FeedbackEvent, FeedbackKind, FeedbackSeverity, FeedbackSink};
use crate::observer::{Observer, SignalSource};
use crate::report::{PlanSummary, RunReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Record, gate, execute, observe and adapt.
    #[default]
    Apply,
    /// Build and gate only; nothing is recorded or executed.
    Plan,
}

/// The external systems the loop talks to.
pub struct Collaborators {
    pub analyzer: Arc<dyn Analyzer>,
    pub backend: Arc<dyn ActionBackend>,
    pub signals: Arc<dyn SignalSource>,
    pub feedback: Arc<dyn FeedbackSink>,
}

pub struct Agent {
    analyzer: Arc<dyn Analyzer>,
    registry: Arc<ActionRegistry>,
    ordering: OrderingTable,
    gate: Arc<RiskGate>,
    ledger: Arc<RunLedger>,
    executor: Executor,
    observer: Observer,
    adapter: Adapter,
    feedback: Arc<dyn FeedbackSink>,
    observation: ObservationSpec,
}

impl Agent {
    pub fn new(
        config: &StewardConfig,
        registry: ActionRegistry,
        ledger: Arc<RunLedger>,
        collaborators: Collaborators,
    ) -> Result<Self, RunError> {
        let registry = Arc::new(registry);
        let gate = Arc::new(RiskGate::new(&config.policy)?);
        let executor = Executor::new(
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&gate),
            collaborators.backend,
            config.executor.clone(),
        );
        let adapter = Adapter::new(
            Arc::clone(&ledger),
            executor.clone(),
            Arc::clone(&collaborators.feedback),
            config.adapter.clone(),
        );

        Ok(Self {
            analyzer: collaborators.analyzer,
            registry,
            ordering: OrderingTable::from_config(&config.ordering),
            gate,
            ledger,
            executor,
            observer: Observer::new(collaborators.signals),
            adapter,
            feedback: collaborators.feedback,
            observation: config.observer.observation_spec(),
        })
    }

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    /// One pass of the loop for `repository`.
    pub async fn run(
        &self,
        repository: &str,
        mode: RunMode,
        cancel: &Cancellation,
    ) -> Result<RunReport, RunError> {
        tracing::info!(repository = %repository, mode = ?mode, "Starting run");

        let findings = self.analyzer.analyze(repository).await.map_err(|e| {
            RunError::AnalysisUnavailable {
                repository: repository.to_string(),
                message: format!("{e:#}"),
            }
        })?;

        if mode == RunMode::Apply {
            // A step some earlier process left `running` still holds its
            // target and would be deduplicated against.
            let interrupted = self.executor.recover(cancel).await?;
            if !interrupted.is_empty() {
                tracing::warn!(interrupted = interrupted.len(), "Recovered interrupted steps");
            }
        }

        let history = self.ledger.snapshot().await;
        let plan = PlanBuilder::new(&self.registry, &self.ordering, self.observation.clone())
            .build(repository, &findings, &history, Utc::now())?;

        if mode == RunMode::Plan {
            let now = Utc::now();
            let demotions = history.active_demotions(now);
            let ctx = GateContext::new(now, &demotions);
            let mut decisions: Vec<Decision> = plan
                .steps
                .iter()
                .map(|s| self.gate.decide_step(s, &ctx))
                .collect();
            let plan_decision = self.gate.decide_plan(&decisions);
            let reason = format!(
                "{} step(s) planned; plan verdict {}",
                plan.steps.len(),
                plan_decision.verdict
            );
            decisions.push(plan_decision);
            return Ok(RunReport {
                plan_id: Some(plan.id),
                repository: repository.to_string(),
                status: RunStatus::Planned,
                reason,
                plan_status: Some(plan.status),
                decisions,
                outcome: None,
                uncompensated: Vec::new(),
                rejected: plan.rejected,
                duplicates: plan.duplicates,
            });
        }

        self.ledger.record_plan(&plan).await?;
        tracing::info!(plan_id = %plan.id, steps = plan.steps.len(), "Plan recorded");
        self.drive(plan.id, cancel).await
    }

    /// Recover after a restart and finish every plan that was left open.
    pub async fn resume(&self, cancel: &Cancellation) -> Result<Vec<RunReport>, RunError> {
        let interrupted = self.executor.recover(cancel).await?;
        let open: Vec<Uuid> = self
            .ledger
            .read(|s| {
                s.plans()
                    .filter(|ps| !ps.is_closed())
                    .map(|ps| ps.plan.id)
                    .collect()
            })
            .await;
        tracing::info!(
            interrupted = interrupted.len(),
            open_plans = open.len(),
            "Resuming"
        );

        let mut reports = Vec::with_capacity(open.len());
        for plan_id in open {
            if cancel.is_cancelled() {
                break;
            }
            reports.push(self.drive(plan_id, cancel).await?);
        }
        Ok(reports)
    }

    pub async fn status(&self) -> Vec<PlanSummary> {
        self.ledger
            .read(|s| s.plans().map(PlanSummary::from_state).collect())
            .await
    }

    async fn plan_state(&self, plan_id: Uuid) -> Result<PlanState, RunError> {
        self.ledger
            .read(|s| s.plan(&plan_id).cloned())
            .await
            .ok_or(RunError::UnknownPlan(plan_id))
    }

    /// Take a recorded plan from wherever it stopped to closed.
    async fn drive(&self, plan_id: Uuid, cancel: &Cancellation) -> Result<RunReport, RunError> {
        let decision = self.executor.gate_pending(plan_id).await?;
        if decision.verdict == Verdict::Block {
            self.feedback.emit(FeedbackEvent::new(
                plan_id,
                FeedbackKind::PlanBlocked,
                FeedbackSeverity::Warning,
                decision.reason.clone(),
            ));
            return self
                .close(
                    plan_id,
                    RunStatus::Blocked,
                    format!("blocked by policy: {}", decision.reason),
                )
                .await;
        }

        let status = self.executor.execute_plan(plan_id, cancel).await?;
        if cancel.is_cancelled() {
            return self.cancelled(plan_id).await;
        }
        let ps = self.plan_state(plan_id).await?;
        if !status.is_terminal() {
            return Err(RunError::Stalled {
                plan_id,
                detail: stall_detail(&ps),
            });
        }

        if status == PlanStatus::Failed {
            if ps.rollback.is_none() {
                self.adapter
                    .roll_back(plan_id, "plan failed", cancel)
                    .await?;
            }
            return self
                .close(plan_id, RunStatus::Failed, "one or more steps failed".to_string())
                .await;
        }
        if ps.plan.steps.is_empty() {
            return self
                .close(plan_id, RunStatus::Succeeded, "nothing to do".to_string())
                .await;
        }

        let mut recorded = ps.latest_outcome().cloned();
        let mut round = if recorded.is_some() { 2 } else { 1 };
        let outcome: Outcome = loop {
            let outcome = match recorded.take() {
                Some(outcome) => outcome,
                None => match self.observer.observe(&ps.plan.observation, cancel).await {
                    Some(outcome) => {
                        self.ledger.record_outcome(plan_id, &outcome).await?;
                        outcome
                    }
                    None => return self.cancelled(plan_id).await,
                },
            };
            tracing::info!(
                plan_id = %plan_id,
                class = %outcome.class,
                reason = %outcome.reason,
                round,
                "Plan observed"
            );

            let rolled_back = self.plan_state(plan_id).await?.rollback.is_some();
            if outcome.class == OutcomeClass::Failed && rolled_back {
                break outcome;
            }
            match self.adapter.adapt(plan_id, &outcome, round, cancel).await? {
                Adaptation::Reobserve => round += 1,
                _ => break outcome,
            }
        };

        let final_status = match outcome.class {
            OutcomeClass::Failed => RunStatus::Failed,
            OutcomeClass::Degraded => RunStatus::Degraded,
            OutcomeClass::Healthy if status == PlanStatus::Degraded => RunStatus::Degraded,
            OutcomeClass::Healthy => RunStatus::Succeeded,
        };
        let reason = if status == PlanStatus::Degraded && outcome.class == OutcomeClass::Healthy {
            format!("some steps were compensated or skipped; {}", outcome.reason)
        } else {
            outcome.reason.clone()
        };
        self.close(plan_id, final_status, reason).await
    }

    async fn close(
        &self,
        plan_id: Uuid,
        status: RunStatus,
        reason: String,
    ) -> Result<RunReport, RunError> {
        self.ledger.close_plan(plan_id, status, &reason).await?;
        let ps = self.plan_state(plan_id).await?;
        let report = report_for(&ps, status, reason);
        if report.uncompensated.is_empty() {
            tracing::info!(plan_id = %plan_id, status = %status, reason = %report.reason, "Run finished");
        } else {
            tracing::error!(
                plan_id = %plan_id,
                status = %status,
                uncompensated = ?report.uncompensated,
                "Run finished with uncompensated steps"
            );
        }
        Ok(report)
    }

    /// The plan stays open so a later `resume` can finish it.
    async fn cancelled(&self, plan_id: Uuid) -> Result<RunReport, RunError> {
        let ps = self.plan_state(plan_id).await?;
        tracing::warn!(plan_id = %plan_id, "Run cancelled; plan left open");
        Ok(report_for(
            &ps,
            RunStatus::Cancelled,
            "cancelled by operator".to_string(),
        ))
    }
}

fn stall_detail(ps: &PlanState) -> String {
    let awaited: BTreeSet<&str> = ps
        .plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .flat_map(|s| s.awaits.iter().map(String::as_str))
        .collect();
    if awaited.is_empty() {
        "steps still pending".to_string()
    } else {
        format!(
            "waiting on {}; resume once they have run",
            awaited.into_iter().collect::<Vec<_>>().join(", ")
        )
    }
}

fn report_for(ps: &PlanState, status: RunStatus, reason: String) -> RunReport {
    RunReport {
        plan_id: Some(ps.plan.id),
        repository: ps.plan.repository.clone(),
        status,
        reason,
        plan_status: Some(ps.plan.status),
        decisions: ps.decisions.clone(),
        outcome: ps.latest_outcome().cloned(),
        uncompensated: ps
            .uncompensated_steps()
            .into_iter()
            .map(|s| s.id.clone())
            .collect(),
        rejected: ps.plan.rejected.clone(),
        duplicates: ps.plan.duplicates.clone(),
    }
}
