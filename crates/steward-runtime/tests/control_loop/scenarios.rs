use super::common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use steward_core::{DegradedPolicy, PlanStatus, RunStatus, StepStatus, Verdict};
use steward_ledger::LedgerRecord;
use steward_runtime::{BackendError, Cancellation, FeedbackKind, RunMode};

// =============================================================================
// HAPPY PATH
// =============================================================================

#[tokio::test(start_paused = true)]
async fn network_then_compute_succeeds_and_is_healthy() {
    let h = Harness::new(
        tracking_error_rate(config()),
        vec![
            finding("f-net", "provision_network", "vpc/main"),
            depends(finding("f-vm", "provision_compute", "vm/app"), &["f-net"]),
        ],
        ScriptedSignals::new().with("error_rate", &[0.5, 1.0, 0.8]),
    )
    .await;

    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.plan_status, Some(PlanStatus::Succeeded));
    assert_eq!(report.exit_code(), 0);

    let succeeded: Vec<String> = transitions(&h.entries().await)
        .into_iter()
        .filter(|(_, status, _)| status == "succeeded")
        .map(|(id, _, _)| id)
        .collect();
    assert_eq!(succeeded, vec!["s1".to_string(), "s2".to_string()]);

    assert_eq!(
        h.backend.executed(),
        vec![
            ("provision_network".to_string(), "vpc/main".to_string()),
            ("provision_compute".to_string(), "vm/app".to_string()),
        ]
    );
    assert_eq!(h.feedback.kinds(), vec![FeedbackKind::PlanSucceeded]);
}

#[tokio::test(start_paused = true)]
async fn busy_target_does_not_hold_a_concurrency_slot() {
    let mut config = config();
    config.executor.concurrency = 2;
    let mut first = finding("f-a1", "flush_cache", "svc/a");
    first.params = json!({ "pattern": "sessions:*" });
    let mut second = finding("f-a2", "flush_cache", "svc/a");
    second.params = json!({ "pattern": "carts:*" });
    let h = Harness::new(
        config,
        vec![first, second, finding("f-b", "flush_cache", "svc/b")],
        ScriptedSignals::new(),
    )
    .await;
    h.backend.delay("flush_cache", Duration::from_secs(10));

    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);

    // svc/b starts alongside the first svc/a flush rather than after it.
    let targets: Vec<String> = h.backend.executed().into_iter().map(|(_, t)| t).collect();
    assert_eq!(targets, vec!["svc/a", "svc/b", "svc/a"]);
}

// =============================================================================
// FAILURE AND COMPENSATION
// =============================================================================

#[tokio::test(start_paused = true)]
async fn compensable_deploy_exhausting_retries_is_compensated() {
    let h = Harness::new(
        config(),
        vec![finding("f-deploy", "deploy_update", "svc/api")],
        ScriptedSignals::new(),
    )
    .await;
    h.backend.fail(
        "deploy_update",
        vec![
            BackendError::Retryable("503 from deployer".to_string()),
            BackendError::Retryable("503 from deployer".to_string()),
            BackendError::Retryable("503 from deployer".to_string()),
        ],
    );

    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.plan_status, Some(PlanStatus::Degraded));
    assert_eq!(report.status, RunStatus::Degraded);
    assert!(report.uncompensated.is_empty());

    let state = h.ledger.snapshot().await;
    let ps = state.plan(&report.plan_id.unwrap()).unwrap();
    let deploy = ps.plan.step("s1").unwrap();
    assert_eq!(deploy.status, StepStatus::Compensated);
    assert_eq!(deploy.attempts, 3);
    assert_eq!(ps.plan.step("s1~undo").unwrap().status, StepStatus::Succeeded);

    assert_eq!(
        h.backend.executed(),
        vec![
            ("deploy_update".to_string(), "svc/api".to_string()),
            ("deploy_update".to_string(), "svc/api".to_string()),
            ("deploy_update".to_string(), "svc/api".to_string()),
            ("rollback".to_string(), "svc/api".to_string()),
        ]
    );

    let failed_attempts = h
        .entries()
        .await
        .iter()
        .filter(|e| matches!(e.record, LedgerRecord::AttemptFailed { .. }))
        .count();
    assert_eq!(failed_attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn terminal_failure_skips_dependents_but_not_independent_branches() {
    let h = Harness::new(
        config(),
        vec![
            finding("f-cache", "flush_cache", "cdn/edge"),
            finding("f-net", "provision_network", "vpc/main"),
            depends(finding("f-vm", "provision_compute", "vm/app"), &["f-cache"]),
        ],
        ScriptedSignals::new(),
    )
    .await;
    h.backend
        .fail("flush_cache", vec![BackendError::Terminal("permission denied".to_string())]);

    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.plan_status, Some(PlanStatus::Failed));

    let state = h.ledger.snapshot().await;
    let ps = state.plan(&report.plan_id.unwrap()).unwrap();
    let by_action = |action: &str| ps.plan.steps.iter().find(|s| s.action == action).unwrap();
    assert_eq!(by_action("flush_cache").status, StepStatus::Failed);
    assert_eq!(by_action("flush_cache").attempts, 1);
    assert_eq!(by_action("provision_network").status, StepStatus::Succeeded);
    assert_eq!(by_action("provision_compute").status, StepStatus::Skipped);

    // The network step has no compensation, so rollback cannot undo it.
    let network_id = by_action("provision_network").id.clone();
    let cache_id = by_action("flush_cache").id.clone();
    assert!(report.uncompensated.contains(&network_id));
    assert!(report.uncompensated.contains(&cache_id));
    assert_eq!(report.exit_code(), 1);
    assert!(h.feedback.kinds().contains(&FeedbackKind::UncompensatedFailure));
    assert!(
        !h.backend
            .executed()
            .iter()
            .any(|(action, _)| action == "provision_compute")
    );
}

#[tokio::test(start_paused = true)]
async fn failed_outcome_rolls_back_in_reverse_order() {
    let h = Harness::new(
        tracking_error_rate(config()),
        vec![
            finding("f-api", "deploy_update", "svc/api"),
            finding("f-web", "deploy_update", "svc/web"),
            depends(finding("f-cdn", "flush_cache", "cdn/edge"), &["f-web"]),
        ],
        ScriptedSignals::new().with("error_rate", &[1.0, 12.0, 14.0]),
    )
    .await;

    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.uncompensated, vec!["s3".to_string()]);
    assert_eq!(report.exit_code(), 1);

    let rollback = h
        .entries()
        .await
        .into_iter()
        .find_map(|e| match e.record {
            LedgerRecord::Rollback {
                compensated,
                uncompensated,
                ..
            } => Some((compensated, uncompensated)),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        rollback,
        (
            vec!["s2".to_string(), "s1".to_string()],
            vec!["s3".to_string()]
        )
    );

    let rollbacks: Vec<String> = h
        .backend
        .executed()
        .into_iter()
        .filter(|(action, _)| action == "rollback")
        .map(|(_, target)| target)
        .collect();
    assert_eq!(rollbacks, vec!["svc/web".to_string(), "svc/api".to_string()]);

    let state = h.ledger.snapshot().await;
    let ps = state.plan(&report.plan_id.unwrap()).unwrap();
    for step in ps.plan.steps.iter().filter(|s| !s.is_compensation()) {
        assert!(
            step.status == StepStatus::Compensated || report.uncompensated.contains(&step.id),
            "{} left unaddressed",
            step.id
        );
    }
}

#[tokio::test(start_paused = true)]
async fn unavailable_signals_fail_the_outcome() {
    let h = Harness::new(
        tracking_error_rate(config()),
        vec![finding("f-api", "deploy_update", "svc/api")],
        ScriptedSignals::new(),
    )
    .await;

    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.outcome.as_ref().unwrap().reason.contains("error_rate unavailable"));
    // The deploy was rolled back, so nothing is left uncompensated.
    assert!(report.uncompensated.is_empty());
    assert_eq!(report.exit_code(), 0);
}

// =============================================================================
// POLICY
// =============================================================================

#[tokio::test(start_paused = true)]
async fn unapproved_irreversible_step_is_blocked() {
    let h = Harness::new(
        config(),
        vec![finding("f-drop", "destroy_database", "db/legacy")],
        ScriptedSignals::new(),
    )
    .await;

    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Blocked);
    assert_eq!(report.exit_code(), 0);
    assert!(h.backend.calls().is_empty());

    let transitions = transitions(&h.entries().await);
    assert_eq!(transitions.len(), 1);
    let (id, status, reason) = &transitions[0];
    assert_eq!((id.as_str(), status.as_str()), ("s1", "skipped"));
    assert!(reason.as_deref().unwrap().starts_with("blocked:"));
    assert_eq!(h.feedback.kinds(), vec![FeedbackKind::PlanBlocked]);
}

#[tokio::test(start_paused = true)]
async fn oversized_dry_run_blocks_the_step() {
    let mut config = config();
    config.policy.max_simulated_changes = 0;
    let h = Harness::new(
        config,
        vec![
            finding("f-api", "deploy_update", "svc/api"),
            finding("f-cache", "flush_cache", "cdn/edge"),
        ],
        ScriptedSignals::new(),
    )
    .await;

    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Degraded);

    let state = h.ledger.snapshot().await;
    let ps = state.plan(&report.plan_id.unwrap()).unwrap();
    assert_eq!(ps.plan.step("s1").unwrap().status, StepStatus::Skipped);
    assert_eq!(ps.plan.step("s2").unwrap().status, StepStatus::Succeeded);
    assert_eq!(
        ps.latest_step_decision("s1").unwrap().verdict,
        Verdict::Block
    );
    assert_eq!(
        h.backend.executed(),
        vec![("flush_cache".to_string(), "cdn/edge".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn plan_mode_records_nothing() {
    let h = Harness::new(
        config(),
        vec![
            finding("f-net", "provision_network", "vpc/main"),
            finding("f-api", "deploy_update", "svc/api"),
        ],
        ScriptedSignals::new(),
    )
    .await;

    let report = h.agent.run(REPO, RunMode::Plan, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Planned);
    let verdicts: Vec<Verdict> = report.decisions.iter().map(|d| d.verdict).collect();
    assert_eq!(
        verdicts,
        vec![Verdict::Approve, Verdict::Simulate, Verdict::Simulate]
    );
    assert!(h.entries().await.is_empty());
    assert!(h.backend.calls().is_empty());
}

// =============================================================================
// ADAPTATION
// =============================================================================

#[tokio::test(start_paused = true)]
async fn degraded_outcome_demotes_executed_actions() {
    let mut config = tracking_error_rate(config());
    config.adapter.on_degraded = DegradedPolicy::Demote;
    let h = Harness::new(
        config,
        vec![finding("f-cache", "flush_cache", "cdn/edge")],
        ScriptedSignals::new().with("error_rate", &[1.0, 9.0, 2.0]),
    )
    .await;

    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Degraded);

    let state = h.ledger.snapshot().await;
    let demoted: Vec<&str> = state.demotions().iter().map(|d| d.action.as_str()).collect();
    assert_eq!(demoted, vec!["flush_cache"]);
    assert!(state.demotions()[0].is_active(chrono::Utc::now()));
    assert!(h.feedback.kinds().contains(&FeedbackKind::PlanDegraded));
}

#[tokio::test(start_paused = true)]
async fn degraded_twice_reobserves_once_then_demotes() {
    let h = Harness::new(
        tracking_error_rate(config()),
        vec![finding("f-cache", "flush_cache", "cdn/edge")],
        ScriptedSignals::new().with("error_rate", &[1.0, 9.0, 2.0]),
    )
    .await;

    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Degraded);

    let outcomes = h
        .entries()
        .await
        .iter()
        .filter(|e| matches!(e.record, LedgerRecord::Outcome { .. }))
        .count();
    assert_eq!(outcomes, 2);
    assert_eq!(
        h.feedback.kinds(),
        vec![FeedbackKind::Reobserve, FeedbackKind::PlanDegraded]
    );
    assert_eq!(h.ledger.snapshot().await.demotions().len(), 1);
}
