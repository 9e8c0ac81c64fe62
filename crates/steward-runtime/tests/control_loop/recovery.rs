use super::common::*;
use chrono::Utc;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use steward_core::{
    ActionSpec, Decision, DecisionSubject, Demotion, Finding, Outcome, OutcomeClass, Plan,
    PlanStatus, Reversibility, RiskClass, RunStatus, Step, StepStatus, Verdict,
};
use steward_ledger::{LedgerRecord, MemoryStorage, RunLedger};
use steward_planner::{OrderingTable, PlanBuilder, StaticAnalyzer};
use steward_policy::ActionRegistry;
use steward_runtime::{Cancellation, RunError, RunMode};

async fn empty_ledger() -> Arc<RunLedger> {
    Arc::new(RunLedger::open(Arc::new(MemoryStorage::new())).await.unwrap())
}

/// Record a plan the way an earlier process would have, without running it.
async fn record_earlier_plan(
    ledger: &RunLedger,
    catalog: Vec<ActionSpec>,
    findings: &[Finding],
) -> Plan {
    let registry = ActionRegistry::from_specs(catalog).unwrap();
    let ordering = OrderingTable::new(&[]);
    let plan = PlanBuilder::new(&registry, &ordering, config().observer.observation_spec())
        .build(REPO, findings, &ledger.snapshot().await, Utc::now())
        .unwrap();
    ledger.record_plan(&plan).await.unwrap();
    plan
}

/// Approve and start `step_id`, then leave it running.
async fn start_step(ledger: &RunLedger, plan_id: uuid::Uuid, step_id: &str) {
    ledger
        .record_decision(
            plan_id,
            &Decision {
                subject: DecisionSubject::Step {
                    step_id: step_id.to_string(),
                },
                verdict: Verdict::Approve,
                reason: "dry-run ok".to_string(),
                rule: None,
            },
        )
        .await
        .unwrap();
    ledger
        .transition(plan_id, step_id, StepStatus::Running, 1, None, None)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancellation_fails_in_flight_steps_and_leaves_the_plan_open() {
    let h = Harness::new(
        config(),
        vec![
            finding("f-net", "provision_network", "vpc/main"),
            depends(finding("f-vm", "provision_compute", "vm/app"), &["f-net"]),
        ],
        ScriptedSignals::new(),
    )
    .await;
    h.backend.delay("provision_network", Duration::from_secs(60));

    let cancel = Cancellation::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
    }

    let report = h.agent.run(REPO, RunMode::Apply, &cancel).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.exit_code(), 0);

    let state = h.ledger.snapshot().await;
    let ps = state.plan(&report.plan_id.unwrap()).unwrap();
    let s1 = ps.plan.step("s1").unwrap();
    assert_eq!(s1.status, StepStatus::Failed);
    assert_eq!(s1.reason.as_deref(), Some("cancelled"));
    assert_eq!(ps.plan.step("s2").unwrap().status, StepStatus::Pending);
    assert!(!ps.is_closed());
    assert!(ps.rollback.is_none());
    assert!(ps.outcomes.is_empty());

    // A later resume finishes the plan without retrying the cancelled step.
    let reports = h.agent.resume(&Cancellation::new()).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, RunStatus::Failed);

    let state = h.ledger.snapshot().await;
    let ps = state.plan(&report.plan_id.unwrap()).unwrap();
    assert!(ps.is_closed());
    assert_eq!(ps.plan.step("s2").unwrap().status, StepStatus::Skipped);
    assert_eq!(h.backend.executed().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_treats_running_steps_as_failed_and_compensates_them() {
    let ledger = empty_ledger().await;

    // A previous process recorded the plan, approved the deploy, started it
    // and died.
    let findings = vec![finding("f-api", "deploy_update", "svc/api")];
    let plan = record_earlier_plan(&ledger, catalog(), &findings).await;
    start_step(&ledger, plan.id, "s1").await;

    let h = Harness::with_ledger(
        Arc::clone(&ledger),
        config(),
        Arc::new(StaticAnalyzer::new(findings)),
        ScriptedSignals::new(),
    );
    let reports = h.agent.resume(&Cancellation::new()).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, RunStatus::Degraded);
    assert_eq!(reports[0].plan_status, Some(PlanStatus::Degraded));

    // Never re-applied; only the compensation ran.
    assert_eq!(
        h.backend.executed(),
        vec![("rollback".to_string(), "svc/api".to_string())]
    );

    let transitions = transitions(&h.entries().await);
    assert!(transitions.contains(&(
        "s1".to_string(),
        "failed".to_string(),
        Some("interrupted".to_string())
    )));
    let state = ledger.snapshot().await;
    let ps = state.plan(&plan.id).unwrap();
    assert_eq!(ps.plan.step("s1").unwrap().status, StepStatus::Compensated);
    assert!(ps.is_closed());
}

#[tokio::test(start_paused = true)]
async fn resume_with_nothing_open_does_nothing() {
    let h = Harness::new(
        config(),
        vec![finding("f-net", "provision_network", "vpc/main")],
        ScriptedSignals::new(),
    )
    .await;
    h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();

    let reports = h.agent.resume(&Cancellation::new()).await.unwrap();
    assert!(reports.is_empty());
    assert_eq!(h.backend.executed().len(), 1);

    let summaries = h.agent.status().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].closed, Some(RunStatus::Succeeded));
    assert_eq!(summaries[0].steps[0].status, StepStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn run_recovers_steps_a_dead_process_left_running() {
    let ledger = empty_ledger().await;
    let earlier = record_earlier_plan(
        &ledger,
        catalog(),
        &[finding("f-cache", "flush_cache", "svc/api")],
    )
    .await;
    start_step(&ledger, earlier.id, "s1").await;

    let h = Harness::with_ledger(
        Arc::clone(&ledger),
        config(),
        Arc::new(StaticAnalyzer::new(vec![
            finding("f-net", "provision_network", "vpc/main"),
            finding("f-vm", "provision_compute", "svc/api"),
        ])),
        ScriptedSignals::new(),
    );
    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(
        h.backend.executed(),
        vec![
            ("provision_network".to_string(), "vpc/main".to_string()),
            ("provision_compute".to_string(), "svc/api".to_string()),
        ]
    );

    let state = ledger.snapshot().await;
    let old = state.plan(&earlier.id).unwrap().plan.step("s1").unwrap().clone();
    assert_eq!(old.status, StepStatus::Failed);
    assert_eq!(old.reason.as_deref(), Some("interrupted"));
    assert!(state.interrupted_steps().is_empty());
}

#[tokio::test(start_paused = true)]
async fn interrupted_step_is_planned_again_on_the_next_run() {
    let ledger = empty_ledger().await;
    let findings = vec![finding("f-cache", "flush_cache", "svc/api")];
    let earlier = record_earlier_plan(&ledger, catalog(), &findings).await;
    start_step(&ledger, earlier.id, "s1").await;

    let h = Harness::with_ledger(
        Arc::clone(&ledger),
        config(),
        Arc::new(StaticAnalyzer::new(findings)),
        ScriptedSignals::new(),
    );
    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();

    // The interrupted flush is no longer live, so the finding is planned
    // afresh instead of being treated as in flight.
    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(report.duplicates.is_empty());
    assert_eq!(
        h.backend.executed(),
        vec![("flush_cache".to_string(), "svc/api".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn dependency_pending_in_an_earlier_plan_is_awaited() {
    let ledger = empty_ledger().await;
    let net = finding("f-net", "provision_network", "vpc/main");
    let earlier = record_earlier_plan(&ledger, catalog(), std::slice::from_ref(&net)).await;

    let h = Harness::with_ledger(
        Arc::clone(&ledger),
        config(),
        Arc::new(StaticAnalyzer::new(vec![
            net,
            depends(finding("f-vm", "provision_compute", "vm/app"), &["f-net"]),
        ])),
        ScriptedSignals::new(),
    );

    let err = h
        .agent
        .run(REPO, RunMode::Apply, &Cancellation::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Stalled { .. }));
    assert!(err.to_string().contains(&Step::location(&earlier.id, "s1")));
    assert!(h.backend.executed().is_empty());

    // Resuming drives plans in creation order: the network first.
    let reports = h.agent.resume(&Cancellation::new()).await.unwrap();
    let statuses: Vec<_> = reports.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![RunStatus::Succeeded, RunStatus::Succeeded]);
    assert_eq!(
        h.backend.executed(),
        vec![
            ("provision_network".to_string(), "vpc/main".to_string()),
            ("provision_compute".to_string(), "vm/app".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn awaited_step_failing_skips_the_dependent() {
    let ledger = empty_ledger().await;
    let net = finding("f-net", "provision_network", "vpc/main");
    let earlier = record_earlier_plan(&ledger, catalog(), std::slice::from_ref(&net)).await;
    let later = record_earlier_plan(
        &ledger,
        catalog(),
        &[
            net,
            depends(finding("f-vm", "provision_compute", "vm/app"), &["f-net"]),
        ],
    )
    .await;
    assert_eq!(later.steps[0].awaits, vec![Step::location(&earlier.id, "s1")]);

    // The earlier network step ran and failed before anything resumed.
    start_step(&ledger, earlier.id, "s1").await;
    ledger
        .transition(
            earlier.id,
            "s1",
            StepStatus::Failed,
            1,
            Some("quota exceeded".to_string()),
            None,
        )
        .await
        .unwrap();

    let h = Harness::with_ledger(
        Arc::clone(&ledger),
        config(),
        Arc::new(StaticAnalyzer::new(vec![])),
        ScriptedSignals::new(),
    );
    let reports = h.agent.resume(&Cancellation::new()).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert!(h.backend.executed().is_empty());

    let state = ledger.snapshot().await;
    let vm = state.plan(&later.id).unwrap().plan.step("s1").unwrap().clone();
    assert_eq!(vm.status, StepStatus::Skipped);
    assert!(vm.reason.unwrap().contains("is failed"));
}

#[tokio::test(start_paused = true)]
async fn failing_step_task_lets_its_siblings_finish() {
    let ledger = empty_ledger().await;

    // The plan was recorded by a build whose catalog still had an action
    // this one no longer registers.
    let mut older_catalog = catalog();
    older_catalog.push(action(
        "retired_action",
        "cache",
        Reversibility::Reversible,
        RiskClass::Low,
    ));
    let plan = record_earlier_plan(
        &ledger,
        older_catalog,
        &[
            finding("f-net", "provision_network", "vpc/main"),
            finding("f-old", "retired_action", "svc/legacy"),
        ],
    )
    .await;

    let h = Harness::with_ledger(
        Arc::clone(&ledger),
        config(),
        Arc::new(StaticAnalyzer::new(vec![])),
        ScriptedSignals::new(),
    );
    h.backend.delay("provision_network", Duration::from_secs(5));

    let err = h.agent.resume(&Cancellation::new()).await.unwrap_err();
    assert!(matches!(err, RunError::Registry(_)));

    let state = ledger.snapshot().await;
    let ps = state.plan(&plan.id).unwrap();
    assert_eq!(ps.plan.step("s1").unwrap().status, StepStatus::Succeeded);
    assert!(state.interrupted_steps().is_empty());
}

#[tokio::test(start_paused = true)]
async fn resumed_adaptation_does_not_demote_twice() {
    let ledger = empty_ledger().await;
    let plan = record_earlier_plan(
        &ledger,
        catalog(),
        &[finding("f-net", "provision_network", "vpc/main")],
    )
    .await;
    start_step(&ledger, plan.id, "s1").await;
    ledger
        .transition(plan.id, "s1", StepStatus::Succeeded, 1, None, None)
        .await
        .unwrap();

    // The earlier process observed a degraded outcome, demoted the action and
    // stopped before closing the plan.
    let now = Utc::now();
    ledger
        .record_outcome(
            plan.id,
            &Outcome {
                class: OutcomeClass::Degraded,
                reason: "latency_p99 breached then recovered".to_string(),
                signals: vec![],
                window_start: now,
                window_end: now,
            },
        )
        .await
        .unwrap();
    ledger
        .record_demotion(
            plan.id,
            &Demotion {
                action: "provision_network".to_string(),
                until: now + chrono::Duration::hours(1),
                reason: "degraded".to_string(),
            },
        )
        .await
        .unwrap();

    let h = Harness::with_ledger(
        Arc::clone(&ledger),
        config(),
        Arc::new(StaticAnalyzer::new(vec![])),
        ScriptedSignals::new(),
    );
    let reports = h.agent.resume(&Cancellation::new()).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, RunStatus::Degraded);

    let demotions = h
        .entries()
        .await
        .into_iter()
        .filter(|e| matches!(e.record, LedgerRecord::Demotion { .. }))
        .count();
    assert_eq!(demotions, 1);
    assert_eq!(ledger.snapshot().await.demotions().len(), 1);
}
