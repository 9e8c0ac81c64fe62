use super::common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use steward_core::{PolicyRule, Reversibility, RunStatus, StepStatus, Verdict};
use steward_ledger::{FileStorage, LedgerRecord, LedgerState, RunLedger};
use steward_planner::{PlanError, StaticAnalyzer};
use steward_runtime::{BackendError, Cancellation, RunError, RunMode};
use tempfile::TempDir;

#[tokio::test(start_paused = true)]
async fn irreversible_steps_run_only_after_an_approve_decision() {
    let mut config = config();
    config.policy.rules.push(PolicyRule {
        name: "allow-legacy-db-removal".to_string(),
        action: Some("^destroy_".to_string()),
        target: Some("^db/legacy".to_string()),
        risk: None,
        reversibility: Some(Reversibility::Irreversible),
        verdict: Verdict::Approve,
    });
    let h = Harness::new(
        config,
        vec![
            finding("f-drop", "destroy_database", "db/legacy"),
            finding("f-net", "provision_network", "vpc/main"),
        ],
        ScriptedSignals::new(),
    )
    .await;

    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);

    let entries = h.entries().await;
    let plan = match &entries[0].record {
        LedgerRecord::PlanCreated { plan } => plan.clone(),
        other => panic!("unexpected first entry: {other}"),
    };
    let irreversible: Vec<&str> = plan
        .steps
        .iter()
        .filter(|s| s.reversibility == Reversibility::Irreversible)
        .map(|s| s.id.as_str())
        .collect();
    assert_eq!(irreversible.len(), 1);

    for (idx, entry) in entries.iter().enumerate() {
        let LedgerRecord::StepTransition { step_id, status, .. } = &entry.record else {
            continue;
        };
        if *status != StepStatus::Running || !irreversible.contains(&step_id.as_str()) {
            continue;
        }
        let latest = entries[..idx].iter().rev().find_map(|e| match &e.record {
            LedgerRecord::Decision { decision } if decision.step_id() == Some(step_id) => {
                Some(decision.verdict)
            }
            _ => None,
        });
        assert_eq!(latest, Some(Verdict::Approve), "step {step_id}");
    }
}

#[tokio::test(start_paused = true)]
async fn cyclic_findings_execute_nothing() {
    let h = Harness::new(
        config(),
        vec![
            depends(finding("a", "flush_cache", "cdn/a"), &["b"]),
            depends(finding("b", "flush_cache", "cdn/b"), &["a"]),
        ],
        ScriptedSignals::new(),
    )
    .await;

    let err = h
        .agent
        .run(REPO, RunMode::Apply, &Cancellation::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::Plan(PlanError::Cyclic { ref findings }) if findings.len() == 2
    ));
    assert!(h.entries().await.is_empty());
    assert!(h.backend.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn analyzer_failure_aborts_before_planning() {
    let ledger = Arc::new(
        RunLedger::open(Arc::new(steward_ledger::MemoryStorage::new()))
            .await
            .unwrap(),
    );
    let h = Harness::with_ledger(
        ledger,
        config(),
        Arc::new(FailingAnalyzer),
        ScriptedSignals::new(),
    );

    let err = h
        .agent
        .run(REPO, RunMode::Apply, &Cancellation::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::AnalysisUnavailable { .. }));
    assert!(err.to_string().contains("model endpoint timed out"));
    assert!(h.entries().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn rerunning_skips_steps_that_already_succeeded() {
    let h = Harness::new(
        config(),
        vec![
            finding("f-net", "provision_network", "vpc/main"),
            depends(finding("f-vm", "provision_compute", "vm/app"), &["f-net"]),
        ],
        ScriptedSignals::new(),
    )
    .await;

    let first = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    let second = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();

    assert_ne!(first.plan_id, second.plan_id);
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(second.reason, "nothing to do");
    let duplicates: Vec<&str> = second
        .duplicates
        .iter()
        .map(|d| d.finding_id.as_str())
        .collect();
    assert_eq!(duplicates, vec!["f-net", "f-vm"]);
    assert_eq!(h.backend.executed().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn replaying_the_ledger_reproduces_live_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let ledger = Arc::new(
        RunLedger::open(Arc::new(FileStorage::new(&path, true)))
            .await
            .unwrap(),
    );
    let h = Harness::with_ledger(
        ledger,
        tracking_error_rate(config()),
        Arc::new(StaticAnalyzer::new(vec![
            finding("f-net", "provision_network", "vpc/main"),
            finding("f-api", "deploy_update", "svc/api"),
            depends(finding("f-cdn", "flush_cache", "cdn/edge"), &["f-api"]),
        ])),
        ScriptedSignals::new().with("error_rate", &[1.0, 2.0]),
    );
    h.backend.fail(
        "deploy_update",
        vec![
            BackendError::Retryable("timeout".to_string()),
            BackendError::Terminal("image not found".to_string()),
        ],
    );

    let report = h.agent.run(REPO, RunMode::Apply, &Cancellation::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Degraded);
    let live = h.ledger.snapshot().await;

    let reopened = RunLedger::open(Arc::new(FileStorage::new(&path, true)))
        .await
        .unwrap();
    assert_eq!(reopened.snapshot().await, live);

    let from_entries = LedgerState::replay(&h.entries().await).unwrap();
    assert_eq!(from_entries, live);

    let ps = live.plan(&report.plan_id.unwrap()).unwrap();
    let statuses: Vec<(&str, StepStatus)> = ps
        .plan
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("s1", StepStatus::Succeeded),
            ("s2", StepStatus::Compensated),
            ("s3", StepStatus::Skipped),
            ("s2~undo", StepStatus::Succeeded),
        ]
    );
}
