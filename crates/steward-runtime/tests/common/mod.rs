//! Shared fakes for the control loop tests.
//!
//! - `ScriptedBackend`: succeeds unless told otherwise, records every call
//! - `ScriptedSignals`: fixed series per signal, unknown signals unavailable
//! - `RecordingFeedback`: keeps every emitted event

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use steward_core::{
    ActionSpec, CompensationRef, Finding, Reversibility, RiskClass, SignalThreshold,
    StewardConfig,
};
use steward_ledger::{LedgerEntry, LedgerRecord, MemoryStorage, RunLedger};
use steward_planner::{Analyzer, StaticAnalyzer};
use steward_policy::ActionRegistry;
use steward_runtime::{
    ActionBackend, ActionOutcome, Agent, BackendError, Collaborators, FeedbackEvent,
    FeedbackKind, FeedbackSink, Sample, SignalError, SignalSource, SignalWindow,
};

// =============================================================================
// ACTION BACKEND
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub action: String,
    pub target: String,
    pub dry_run: bool,
}

#[derive(Default)]
pub struct ScriptedBackend {
    failures: Mutex<BTreeMap<String, VecDeque<BackendError>>>,
    delays: Mutex<BTreeMap<String, Duration>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue errors returned by the next real executions of `action`.
    pub fn fail(&self, action: &str, errors: Vec<BackendError>) {
        self.failures
            .lock()
            .unwrap()
            .entry(action.to_string())
            .or_default()
            .extend(errors);
    }

    /// Make real executions of `action` take `delay`.
    pub fn delay(&self, action: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(action.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Real (non dry-run) executions as (action, target).
    pub fn executed(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter(|c| !c.dry_run)
            .map(|c| (c.action, c.target))
            .collect()
    }
}

#[async_trait]
impl ActionBackend for ScriptedBackend {
    async fn execute(
        &self,
        spec: &ActionSpec,
        target: &str,
        _params: &Value,
        dry_run: bool,
    ) -> Result<ActionOutcome, BackendError> {
        self.calls.lock().unwrap().push(Call {
            action: spec.name.clone(),
            target: target.to_string(),
            dry_run,
        });
        if dry_run {
            return Ok(ActionOutcome {
                diff: Some(json!([format!("{} {}", spec.name, target)])),
                output: Value::Null,
            });
        }

        let delay = self.delays.lock().unwrap().get(&spec.name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&spec.name)
            .and_then(|q| q.pop_front());
        match failure {
            Some(error) => Err(error),
            None => Ok(ActionOutcome {
                diff: Some(json!({ "applied": spec.name, "target": target })),
                output: json!({ "ok": true }),
            }),
        }
    }
}

// =============================================================================
// SIGNALS AND FEEDBACK
// =============================================================================

#[derive(Default)]
pub struct ScriptedSignals {
    series: BTreeMap<String, Vec<Sample>>,
}

impl ScriptedSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, values: &[f64]) -> Self {
        let samples = values
            .iter()
            .enumerate()
            .map(|(i, &value)| Sample {
                at: at(i as i64 * 10),
                value,
            })
            .collect();
        self.series.insert(name.to_string(), samples);
        self
    }
}

#[async_trait]
impl SignalSource for ScriptedSignals {
    async fn query_signal(
        &self,
        name: &str,
        _window: SignalWindow,
    ) -> Result<Vec<Sample>, SignalError> {
        self.series
            .get(name)
            .cloned()
            .ok_or_else(|| SignalError::Unavailable {
                signal: name.to_string(),
                message: "no such series".to_string(),
            })
    }
}

#[derive(Default)]
pub struct RecordingFeedback {
    events: Mutex<Vec<FeedbackEvent>>,
}

impl RecordingFeedback {
    pub fn kinds(&self) -> Vec<FeedbackKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }
}

impl FeedbackSink for RecordingFeedback {
    fn emit(&self, event: FeedbackEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct FailingAnalyzer;

#[async_trait]
impl Analyzer for FailingAnalyzer {
    async fn analyze(&self, _repository: &str) -> anyhow::Result<Vec<Finding>> {
        anyhow::bail!("model endpoint timed out")
    }
}

// =============================================================================
// FIXTURES
// =============================================================================

pub const REPO: &str = "git@example.com:shop/infra.git";

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
}

pub fn action(
    name: &str,
    category: &str,
    reversibility: Reversibility,
    risk: RiskClass,
) -> ActionSpec {
    ActionSpec {
        name: name.to_string(),
        description: None,
        category: category.to_string(),
        reversibility,
        risk,
        params_schema: json!({ "type": "object" }),
        compensation: None,
        timeout_ms: None,
        max_attempts: None,
    }
}

/// The catalog used by most tests.
pub fn catalog() -> Vec<ActionSpec> {
    let mut deploy = action(
        "deploy_update",
        "deploy",
        Reversibility::Compensable,
        RiskClass::Medium,
    );
    deploy.compensation = Some(CompensationRef {
        action: "rollback".to_string(),
        params: Some(json!({ "version": "previous" })),
    });

    vec![
        action("provision_network", "network", Reversibility::Reversible, RiskClass::Low),
        action("provision_compute", "compute", Reversibility::Reversible, RiskClass::Low),
        deploy,
        action("rollback", "deploy", Reversibility::Reversible, RiskClass::Low),
        action("flush_cache", "cache", Reversibility::Reversible, RiskClass::Low),
        action("destroy_database", "database", Reversibility::Irreversible, RiskClass::High),
    ]
}

pub fn finding(id: &str, action: &str, target: &str) -> Finding {
    Finding {
        id: id.to_string(),
        category: "infrastructure".to_string(),
        target: target.to_string(),
        severity: Default::default(),
        action: action.to_string(),
        params: json!({}),
        depends_on: vec![],
        optional: false,
    }
}

pub fn depends(mut finding: Finding, on: &[&str]) -> Finding {
    finding.depends_on = on.iter().map(|s| s.to_string()).collect();
    finding
}

/// Fast retries, short observation windows, no tracked signals.
pub fn config() -> StewardConfig {
    let mut config = StewardConfig::default();
    config.executor.retry.base_delay_ms = 10;
    config.executor.retry.jitter = 0.0;
    config.observer.window_ms = 1_000;
    config.observer.poll_interval_ms = 500;
    config
}

pub fn tracking_error_rate(mut config: StewardConfig) -> StewardConfig {
    config.observer.signals = vec![SignalThreshold::at_most("error_rate", 5.0)];
    config
}

// =============================================================================
// HARNESS
// =============================================================================

pub struct Harness {
    pub agent: Agent,
    pub ledger: Arc<RunLedger>,
    pub backend: Arc<ScriptedBackend>,
    pub feedback: Arc<RecordingFeedback>,
}

impl Harness {
    pub async fn new(config: StewardConfig, findings: Vec<Finding>, signals: ScriptedSignals) -> Self {
        let ledger = Arc::new(RunLedger::open(Arc::new(MemoryStorage::new())).await.unwrap());
        Self::with_ledger(ledger, config, Arc::new(StaticAnalyzer::new(findings)), signals)
    }

    pub fn with_ledger(
        ledger: Arc<RunLedger>,
        config: StewardConfig,
        analyzer: Arc<dyn Analyzer>,
        signals: ScriptedSignals,
    ) -> Self {
        let backend = ScriptedBackend::new();
        let feedback = Arc::new(RecordingFeedback::default());
        let registry = ActionRegistry::from_specs(catalog()).unwrap();
        let agent = Agent::new(
            &config,
            registry,
            Arc::clone(&ledger),
            Collaborators {
                analyzer,
                backend: backend.clone(),
                signals: Arc::new(signals),
                feedback: feedback.clone(),
            },
        )
        .unwrap();
        Self {
            agent,
            ledger,
            backend,
            feedback,
        }
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.ledger.entries().await.unwrap()
    }
}

/// (step id, status, reason) of every step transition, in ledger order.
pub fn transitions(entries: &[LedgerEntry]) -> Vec<(String, String, Option<String>)> {
    entries
        .iter()
        .filter_map(|e| match &e.record {
            LedgerRecord::StepTransition {
                step_id,
                status,
                reason,
                ..
            } => Some((step_id.clone(), status.to_string(), reason.clone())),
            _ => None,
        })
        .collect()
}
