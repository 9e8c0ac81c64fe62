//! Step execution.
//!
//! The executor owns no state of its own: every scheduling decision is made
//! from a fresh read of the ledger, and every effect is a ledger append.
//! The only shared mutable state between concurrent steps is
//! [`ResourceLocks`].

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use steward_core::{
    ActionSpec, Decision, ExecutorConfig, PlanStatus, Step, StepStatus, Verdict,
};
use steward_ledger::{PlanState, RunLedger, dependency_satisfied};
use steward_policy::{ActionRegistry, DryRunReport, GateContext, RiskGate};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::backend::ActionBackend;
use crate::cancel::Cancellation;
use crate::error::{BackendError, RunError};
use crate::locks::{ResourceGuard, ResourceLocks};
use crate::retry::backoff_delay;

pub const CANCELLED: &str = "cancelled";
pub const INTERRUPTED: &str = "interrupted";

/// How the attempts of one step ended.
#[derive(Debug, Clone, PartialEq)]
enum Attempts {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// Result of trying to undo one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Compensation {
    Compensated { by: String },
    /// The action declares no compensation.
    NotDeclared,
    Blocked(String),
    Failed(String),
}

/// What a rollback did, step by step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollbackReport {
    pub compensated: Vec<String>,
    pub uncompensated: Vec<String>,
}

#[derive(Clone)]
pub struct Executor {
    ledger: Arc<RunLedger>,
    registry: Arc<ActionRegistry>,
    gate: Arc<RiskGate>,
    backend: Arc<dyn ActionBackend>,
    config: ExecutorConfig,
    locks: Arc<ResourceLocks>,
}

impl Executor {
    pub fn new(
        ledger: Arc<RunLedger>,
        registry: Arc<ActionRegistry>,
        gate: Arc<RiskGate>,
        backend: Arc<dyn ActionBackend>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            ledger,
            registry,
            gate,
            backend,
            config,
            locks: ResourceLocks::new(),
        }
    }

    async fn plan_state(&self, plan_id: Uuid) -> Result<PlanState, RunError> {
        self.ledger
            .read(|s| s.plan(&plan_id).cloned())
            .await
            .ok_or(RunError::UnknownPlan(plan_id))
    }

    /// The plan plus the steps of earlier plans it awaits, by location.
    async fn schedule_view(&self, plan_id: Uuid) -> Result<(PlanState, Awaited), RunError> {
        let (ps, awaited) = self
            .ledger
            .read(|s| {
                let ps = s.plan(&plan_id).cloned();
                let awaited: Awaited = ps
                    .iter()
                    .flat_map(|ps| ps.plan.steps.iter())
                    .flat_map(|st| st.awaits.iter())
                    .filter_map(|loc| s.step_at(loc).map(|st| (loc.clone(), st.clone())))
                    .collect();
                (ps, awaited)
            })
            .await;
        Ok((ps.ok_or(RunError::UnknownPlan(plan_id))?, awaited))
    }

    // =========================================================================
    // Gating
    // =========================================================================

    /// Record a decision for every pending step that has none yet, skip the
    /// blocked ones, then record the plan-level decision if missing.
    pub async fn gate_pending(&self, plan_id: Uuid) -> Result<Decision, RunError> {
        let ps = self.plan_state(plan_id).await?;
        let now = Utc::now();
        let demotions = self.ledger.read(|s| s.active_demotions(now)).await;
        let ctx = GateContext::new(now, &demotions);

        for step in ps.plan.steps.iter().filter(|s| !s.is_compensation()) {
            if step.status != StepStatus::Pending {
                continue;
            }
            let decision = match ps.latest_step_decision(&step.id) {
                Some(existing) => existing.clone(),
                None => {
                    let decision = self.gate.decide_step(step, &ctx);
                    self.ledger.record_decision(plan_id, &decision).await?;
                    decision
                }
            };
            if decision.verdict == Verdict::Block {
                self.skip(plan_id, &step.id, format!("blocked: {}", decision.reason))
                    .await?;
            }
        }

        let ps = self.plan_state(plan_id).await?;
        if let Some(existing) = ps.plan_decision() {
            return Ok(existing.clone());
        }
        let step_decisions: Vec<Decision> = ps
            .plan
            .steps
            .iter()
            .filter(|s| !s.is_compensation())
            .filter_map(|s| ps.latest_step_decision(&s.id).cloned())
            .collect();
        let decision = self.gate.decide_plan(&step_decisions);
        self.ledger.record_decision(plan_id, &decision).await?;
        tracing::info!(
            plan_id = %plan_id,
            verdict = %decision.verdict,
            reason = %decision.reason,
            "Plan gated"
        );
        Ok(decision)
    }

    async fn skip(&self, plan_id: Uuid, step_id: &str, reason: String) -> Result<(), RunError> {
        tracing::info!(plan_id = %plan_id, step_id = %step_id, reason = %reason, "Step skipped");
        self.ledger
            .transition(plan_id, step_id, StepStatus::Skipped, 0, Some(reason), None)
            .await?;
        Ok(())
    }

    /// Dry-run a `simulate` step and record the gate's second decision.
    async fn resolve_simulation(
        &self,
        plan_id: Uuid,
        step: &Step,
        spec: &ActionSpec,
    ) -> Result<Verdict, RunError> {
        let timeout = self.step_timeout(spec);
        let report = match tokio::time::timeout(
            timeout,
            self.backend.execute(spec, &step.target, &step.params, true),
        )
        .await
        {
            Ok(Ok(outcome)) => DryRunReport::succeeded(outcome.diff.as_ref()),
            Ok(Err(e)) => DryRunReport::failed(e.to_string()),
            Err(_) => DryRunReport::failed(format!("dry-run timed out after {timeout:?}")),
        };

        let decision = self.gate.redecide(step, &report);
        self.ledger.record_decision(plan_id, &decision).await?;
        tracing::info!(
            plan_id = %plan_id,
            step_id = %step.id,
            action = %step.action,
            verdict = %decision.verdict,
            reason = %decision.reason,
            "Simulated step re-decided"
        );

        if decision.verdict == Verdict::Block {
            self.skip(plan_id, &step.id, format!("blocked: {}", decision.reason))
                .await?;
        }
        Ok(decision.verdict)
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Run every reachable pending step of the plan.
    ///
    /// Returns when nothing is running and nothing more can be dispatched.
    pub async fn execute_plan(
        &self,
        plan_id: Uuid,
        cancel: &Cancellation,
    ) -> Result<PlanStatus, RunError> {
        let mut tasks: JoinSet<Result<String, RunError>> = JoinSet::new();
        let mut in_flight: BTreeSet<String> = BTreeSet::new();
        // After a step task errors, nothing new is dispatched; the others
        // run to a terminal ledger entry before the error is returned.
        let mut first_error: Option<RunError> = None;

        loop {
            if first_error.is_none() && !cancel.is_cancelled() {
                let (ps, awaited) = self.schedule_view(plan_id).await?;
                if self.skip_unreachable(&ps, &awaited, &in_flight).await? {
                    continue;
                }

                let mut capacity = self.config.concurrency.saturating_sub(in_flight.len());
                for step in ready_steps(&ps, &awaited, &in_flight) {
                    if capacity == 0 {
                        break;
                    }
                    let Some(guard) = self.locks.try_acquire(&step.target) else {
                        continue;
                    };
                    capacity -= 1;
                    tracing::debug!(
                        plan_id = %plan_id,
                        step_id = %step.id,
                        target = %step.target,
                        "Dispatching step"
                    );
                    in_flight.insert(step.id.clone());
                    let this = self.clone();
                    let cancel = cancel.clone();
                    tasks.spawn(async move { this.run_step(plan_id, step, guard, cancel).await });
                }
            }

            let error = match tasks.join_next().await {
                None => break,
                Some(Ok(Ok(step_id))) => {
                    in_flight.remove(&step_id);
                    continue;
                }
                Some(Ok(Err(e))) => e,
                Some(Err(e)) => RunError::Task(e.to_string()),
            };
            tracing::error!(
                plan_id = %plan_id,
                error = %error,
                in_flight = tasks.len(),
                "Step task failed; waiting for the remaining steps"
            );
            first_error.get_or_insert(error);
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        let status = self.plan_state(plan_id).await?.plan.status;
        tracing::info!(plan_id = %plan_id, status = %status, "Plan execution finished");
        Ok(status)
    }

    /// Skip pending steps whose dependencies can no longer be satisfied.
    /// Returns true if anything was skipped.
    async fn skip_unreachable(
        &self,
        ps: &PlanState,
        awaited: &Awaited,
        in_flight: &BTreeSet<String>,
    ) -> Result<bool, RunError> {
        let mut skipped = false;
        for step in ps.plan.steps.iter().filter(|s| !s.is_compensation()) {
            if step.status != StepStatus::Pending || in_flight.contains(&step.id) {
                continue;
            }
            let unreachable = |dep: &Step| dep.status.is_terminal() && !dependency_satisfied(dep);
            let blocker = step
                .depends_on
                .iter()
                .find_map(|dep_id| {
                    let dep = ps.plan.step(dep_id)?;
                    unreachable(dep).then(|| format!("dependency {} is {}", dep.id, dep.status))
                })
                .or_else(|| {
                    step.awaits.iter().find_map(|loc| match awaited.get(loc) {
                        None => Some(format!("awaited step {loc} is not in the ledger")),
                        Some(dep) if unreachable(dep) => {
                            Some(format!("awaited step {loc} is {}", dep.status))
                        }
                        Some(_) => None,
                    })
                });
            if let Some(reason) = blocker {
                self.skip(ps.plan.id, &step.id, reason).await?;
                skipped = true;
            }
        }
        Ok(skipped)
    }

    async fn run_step(
        self,
        plan_id: Uuid,
        step: Step,
        _guard: ResourceGuard,
        cancel: Cancellation,
    ) -> Result<String, RunError> {
        let spec = self.registry.lookup(&step.action)?.clone();

        let verdict = self
            .ledger
            .read(|s| {
                s.plan(&plan_id)
                    .and_then(|ps| ps.latest_step_decision(&step.id))
                    .map(|d| d.verdict)
            })
            .await;
        let verdict = match verdict {
            Some(Verdict::Simulate) => self.resolve_simulation(plan_id, &step, &spec).await?,
            Some(v) => v,
            None => {
                self.skip(plan_id, &step.id, "no risk decision recorded".to_string())
                    .await?;
                Verdict::Block
            }
        };
        if verdict != Verdict::Approve {
            return Ok(step.id);
        }

        match self.run_attempts(plan_id, &step, &spec, &cancel).await? {
            Attempts::Succeeded | Attempts::Cancelled => {}
            Attempts::Failed(_) => {
                // The lock is still held, so nothing else touches the target
                // between the failure and its compensation.
                self.compensate(plan_id, &step.id, &cancel).await?;
            }
        }
        Ok(step.id)
    }

    fn step_timeout(&self, spec: &ActionSpec) -> Duration {
        Duration::from_millis(spec.timeout_ms.unwrap_or(self.config.step_timeout_ms))
    }

    /// Move the step to `running` and invoke the backend until it succeeds,
    /// fails terminally, runs out of attempts or is cancelled.
    async fn run_attempts(
        &self,
        plan_id: Uuid,
        step: &Step,
        spec: &ActionSpec,
        cancel: &Cancellation,
    ) -> Result<Attempts, RunError> {
        let max_attempts = spec
            .max_attempts
            .unwrap_or(self.config.retry.max_attempts)
            .max(1);
        let timeout = self.step_timeout(spec);

        self.ledger
            .transition(plan_id, &step.id, StepStatus::Running, 1, None, None)
            .await?;
        tracing::info!(
            plan_id = %plan_id,
            step_id = %step.id,
            action = %step.action,
            target = %step.target,
            "Step running"
        );

        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = tokio::time::timeout(
                    timeout,
                    self.backend.execute(spec, &step.target, &step.params, false),
                ) => Some(r),
            };

            let error = match result {
                None => return self.fail_cancelled(plan_id, step, attempt).await,
                Some(Ok(Ok(outcome))) => {
                    self.ledger
                        .transition(
                            plan_id,
                            &step.id,
                            StepStatus::Succeeded,
                            attempt,
                            None,
                            outcome.diff,
                        )
                        .await?;
                    tracing::info!(
                        plan_id = %plan_id,
                        step_id = %step.id,
                        attempt,
                        "Step succeeded"
                    );
                    return Ok(Attempts::Succeeded);
                }
                Some(Ok(Err(e))) => e,
                Some(Err(_)) => BackendError::Retryable(format!("timed out after {timeout:?}")),
            };

            self.ledger
                .record_attempt_failure(
                    plan_id,
                    &step.id,
                    attempt,
                    error.is_retryable(),
                    &error.to_string(),
                )
                .await?;

            if !error.is_retryable() || attempt >= max_attempts {
                let reason = if error.is_retryable() {
                    format!("{error} (after {attempt} attempt(s))")
                } else {
                    error.to_string()
                };
                self.ledger
                    .transition(
                        plan_id,
                        &step.id,
                        StepStatus::Failed,
                        attempt,
                        Some(reason.clone()),
                        None,
                    )
                    .await?;
                tracing::warn!(
                    plan_id = %plan_id,
                    step_id = %step.id,
                    action = %step.action,
                    attempt,
                    reason = %reason,
                    "Step failed"
                );
                return Ok(Attempts::Failed(reason));
            }

            let delay = backoff_delay(&self.config.retry, attempt);
            tracing::warn!(
                plan_id = %plan_id,
                step_id = %step.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying step"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.fail_cancelled(plan_id, step, attempt).await,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn fail_cancelled(
        &self,
        plan_id: Uuid,
        step: &Step,
        attempt: u32,
    ) -> Result<Attempts, RunError> {
        self.ledger
            .transition(
                plan_id,
                &step.id,
                StepStatus::Failed,
                attempt,
                Some(CANCELLED.to_string()),
                None,
            )
            .await?;
        tracing::warn!(plan_id = %plan_id, step_id = %step.id, "Step cancelled");
        Ok(Attempts::Cancelled)
    }

    // =========================================================================
    // Compensation
    // =========================================================================

    /// Undo a failed or succeeded step by running its declared compensation
    /// through the gate. Success moves the original step to `compensated`.
    pub async fn compensate(
        &self,
        plan_id: Uuid,
        step_id: &str,
        cancel: &Cancellation,
    ) -> Result<Compensation, RunError> {
        let ps = self.plan_state(plan_id).await?;
        let step = ps
            .plan
            .step(step_id)
            .cloned()
            .ok_or_else(|| RunError::Task(format!("step {step_id} not in plan {plan_id}")))?;
        if step.is_compensation() {
            return Ok(Compensation::NotDeclared);
        }
        let spec = self.registry.lookup(&step.action)?;
        let Some(comp_ref) = spec.compensation.clone() else {
            return Ok(Compensation::NotDeclared);
        };
        let comp_spec = self.registry.lookup(&comp_ref.action)?.clone();

        let comp_step = match ps.compensation_for(step_id) {
            Some(existing) if existing.status == StepStatus::Succeeded => {
                let by = existing.id.clone();
                self.mark_compensated(plan_id, &step, &by).await?;
                return Ok(Compensation::Compensated { by });
            }
            Some(existing) if existing.status == StepStatus::Pending => existing.clone(),
            Some(existing) => {
                return Ok(Compensation::Failed(format!(
                    "compensation {} is {}",
                    existing.id, existing.status
                )));
            }
            None => {
                let comp_step = Step {
                    id: Step::compensation_id(step_id),
                    action: comp_spec.name.clone(),
                    target: step.target.clone(),
                    params: comp_ref.params_for(&step.params),
                    finding_id: step.finding_id.clone(),
                    depends_on: Vec::new(),
                    awaits: Vec::new(),
                    optional: false,
                    reversibility: comp_spec.reversibility,
                    risk: comp_spec.risk,
                    status: StepStatus::Pending,
                    attempts: 0,
                    reason: Some(format!("compensates {step_id}")),
                    compensation_of: Some(step_id.to_string()),
                };
                self.ledger.record_step(plan_id, &comp_step).await?;
                comp_step
            }
        };

        tracing::info!(
            plan_id = %plan_id,
            step_id = %step_id,
            compensation = %comp_step.id,
            action = %comp_step.action,
            "Compensating step"
        );

        let now = Utc::now();
        let demotions = self.ledger.read(|s| s.active_demotions(now)).await;
        let decision = self
            .gate
            .decide_step(&comp_step, &GateContext::new(now, &demotions));
        self.ledger.record_decision(plan_id, &decision).await?;

        let verdict = match decision.verdict {
            Verdict::Simulate => {
                self.resolve_simulation(plan_id, &comp_step, &comp_spec)
                    .await?
            }
            Verdict::Block => {
                self.skip(
                    plan_id,
                    &comp_step.id,
                    format!("blocked: {}", decision.reason),
                )
                .await?;
                Verdict::Block
            }
            Verdict::Approve => Verdict::Approve,
        };
        if verdict == Verdict::Block {
            tracing::error!(
                plan_id = %plan_id,
                step_id = %step_id,
                "Compensation blocked by policy"
            );
            return Ok(Compensation::Blocked(decision.reason));
        }

        match self.run_attempts(plan_id, &comp_step, &comp_spec, cancel).await? {
            Attempts::Succeeded => {
                self.mark_compensated(plan_id, &step, &comp_step.id).await?;
                Ok(Compensation::Compensated { by: comp_step.id })
            }
            Attempts::Failed(reason) => {
                tracing::error!(
                    plan_id = %plan_id,
                    step_id = %step_id,
                    reason = %reason,
                    "Compensation failed"
                );
                Ok(Compensation::Failed(reason))
            }
            Attempts::Cancelled => Ok(Compensation::Failed(CANCELLED.to_string())),
        }
    }

    async fn mark_compensated(&self, plan_id: Uuid, step: &Step, by: &str) -> Result<(), RunError> {
        self.ledger
            .transition(
                plan_id,
                &step.id,
                StepStatus::Compensated,
                step.attempts,
                Some(format!("compensated by {by}")),
                None,
            )
            .await?;
        tracing::info!(plan_id = %plan_id, step_id = %step.id, "Step compensated");
        Ok(())
    }

    /// Compensate every succeeded step in reverse dependency order and record
    /// the result. Steps without a working compensation are listed as
    /// uncompensated.
    pub async fn rollback(
        &self,
        plan_id: Uuid,
        reason: &str,
        cancel: &Cancellation,
    ) -> Result<RollbackReport, RunError> {
        let ps = self.plan_state(plan_id).await?;
        let succeeded: Vec<String> = ps
            .plan
            .steps
            .iter()
            .rev()
            .filter(|s| !s.is_compensation() && s.status == StepStatus::Succeeded)
            .map(|s| s.id.clone())
            .collect();

        tracing::warn!(
            plan_id = %plan_id,
            steps = succeeded.len(),
            reason = %reason,
            "Rolling back plan"
        );

        let mut report = RollbackReport::default();
        for step_id in succeeded {
            match self.compensate(plan_id, &step_id, cancel).await? {
                Compensation::Compensated { .. } => report.compensated.push(step_id),
                other => {
                    tracing::error!(
                        plan_id = %plan_id,
                        step_id = %step_id,
                        result = ?other,
                        "Step left uncompensated; manual follow-up required"
                    );
                    report.uncompensated.push(step_id);
                }
            }
        }

        self.ledger
            .record_rollback(
                plan_id,
                reason,
                report.compensated.clone(),
                report.uncompensated.clone(),
            )
            .await?;
        Ok(report)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Bring the ledger back to a consistent state after a restart.
    ///
    /// Steps left `running` are marked `failed` (they may or may not have
    /// been applied) and are never re-run. Failed steps of open plans that
    /// declare a compensation and were not cancelled are then compensated.
    ///
    /// Steps whose target is locked in this process are still being handled
    /// here and are left alone.
    pub async fn recover(&self, cancel: &Cancellation) -> Result<Vec<(Uuid, String)>, RunError> {
        let running = self.ledger.read(|s| s.interrupted_steps()).await;
        let mut interrupted = Vec::with_capacity(running.len());
        for (plan_id, step_id) in running {
            let Some(step) = self.plan_state(plan_id).await?.plan.step(&step_id).cloned() else {
                continue;
            };
            let Some(_guard) = self.locks.try_acquire(&step.target) else {
                tracing::debug!(
                    plan_id = %plan_id,
                    step_id = %step_id,
                    "Step is running in this process; not recovering it"
                );
                continue;
            };
            let attempts = step.attempts.max(1);
            self.ledger
                .transition(
                    plan_id,
                    &step_id,
                    StepStatus::Failed,
                    attempts,
                    Some(INTERRUPTED.to_string()),
                    None,
                )
                .await?;
            tracing::warn!(
                plan_id = %plan_id,
                step_id = %step_id,
                "Step was running when the process stopped; assuming failed"
            );
            interrupted.push((plan_id, step_id));
        }

        let registry = Arc::clone(&self.registry);
        let candidates: Vec<(Uuid, String, String)> = self
            .ledger
            .read(|s| {
                s.plans()
                    .filter(|ps| !ps.is_closed())
                    .flat_map(|ps| {
                        ps.plan
                            .steps
                            .iter()
                            .filter(|st| {
                                !st.is_compensation()
                                    && st.status == StepStatus::Failed
                                    && st.reason.as_deref() != Some(CANCELLED)
                            })
                            .filter(|st| {
                                registry
                                    .lookup(&st.action)
                                    .is_ok_and(|spec| spec.compensation.is_some())
                            })
                            .filter(|st| {
                                ps.compensation_for(&st.id).is_none_or(|c| {
                                    matches!(c.status, StepStatus::Pending | StepStatus::Succeeded)
                                })
                            })
                            .map(|st| (ps.plan.id, st.id.clone(), st.target.clone()))
                            .collect::<Vec<_>>()
                    })
                    .collect()
            })
            .await;

        for (plan_id, step_id, target) in &candidates {
            if cancel.is_cancelled() {
                break;
            }
            let Some(_guard) = self.locks.try_acquire(target) else {
                continue;
            };
            self.compensate(*plan_id, step_id, cancel).await?;
        }
        Ok(interrupted)
    }
}

/// Steps of other plans awaited by this one, keyed by `<plan>/<step>`.
type Awaited = BTreeMap<String, Step>;

/// Pending primary steps whose dependencies are all satisfied, in plan order.
fn ready_steps(ps: &PlanState, awaited: &Awaited, in_flight: &BTreeSet<String>) -> Vec<Step> {
    ps.plan
        .steps
        .iter()
        .filter(|s| !s.is_compensation())
        .filter(|s| s.status == StepStatus::Pending && !in_flight.contains(&s.id))
        .filter(|s| {
            s.depends_on
                .iter()
                .all(|d| ps.plan.step(d).is_some_and(dependency_satisfied))
                && s.awaits
                    .iter()
                    .all(|loc| awaited.get(loc).is_some_and(dependency_satisfied))
        })
        .cloned()
        .collect()
}
