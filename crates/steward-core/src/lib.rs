use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

// Configuration types shared across all Steward crates
pub mod config;

// Step/plan state machines
pub mod status;

pub use config::{
    AdapterConfig, AnalyzerConfig, BackendConfig, CommandSpec, ConfigError, DegradedPolicy,
    ExecutorConfig, FeedbackConfig, LedgerConfig, ObserverConfig, OrderingRule, PolicyConfig,
    PolicyRule, RetryPolicy, StewardConfig,
};
pub use status::{PlanStatus, RunStatus, StepStatus};

/// An issue or opportunity reported by the external analyzer.
///
/// Findings are immutable once produced; the plan builder maps each one onto
/// at most one [`Step`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    #[serde(default)]
    pub category: String,
    /// Resource the suggested action operates on (e.g. "vpc/main").
    pub target: String,
    #[serde(default)]
    pub severity: Severity,
    /// Suggested action type; must name a registered [`ActionSpec`].
    pub action: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    /// Ids of other findings in the same batch that must run first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Optional findings do not degrade the plan when they are skipped.
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reversibility {
    Reversible,
    Irreversible,
    Compensable,
}

impl fmt::Display for Reversibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reversibility::Reversible => write!(f, "reversible"),
            Reversibility::Irreversible => write!(f, "irreversible"),
            Reversibility::Compensable => write!(f, "compensable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskClass::Low => write!(f, "low"),
            RiskClass::Medium => write!(f, "medium"),
            RiskClass::High => write!(f, "high"),
        }
    }
}

/// Catalog entry for an executable operation type.
/// Loaded once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Resource category used by the ordering table (e.g. "network", "compute").
    pub category: String,
    pub reversibility: Reversibility,
    pub risk: RiskClass,
    /// JSON Schema for the action parameters.
    #[serde(default = "empty_object_schema")]
    pub params_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationRef>,
    /// Overrides the executor's per-step timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Overrides the retry policy's attempt cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// Reference to the action that undoes another one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRef {
    pub action: String,
    /// Shallow overrides merged over the original step's parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl CompensationRef {
    /// Parameters for the compensating step derived from the original ones.
    pub fn params_for(&self, original: &Value) -> Value {
        let mut merged = match original {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        if let Some(Value::Object(overrides)) = &self.params {
            for (k, v) in overrides {
                merged.insert(k.clone(), v.clone());
            }
        }
        Value::Object(merged)
    }
}

/// One instance of an [`ActionSpec`] bound to concrete parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub action: String,
    pub target: String,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finding_id: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Steps of earlier plans, as `<plan>/<step>`, that must succeed first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub awaits: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    pub reversibility: Reversibility,
    pub risk: RiskClass,
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Set on synthesized compensation steps: id of the step being undone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_of: Option<String>,
}

impl Step {
    pub fn is_compensation(&self) -> bool {
        self.compensation_of.is_some()
    }

    /// Id given to the compensation step synthesized for `step_id`.
    pub fn compensation_id(step_id: &str) -> String {
        format!("{step_id}~undo")
    }

    /// Ledger-wide reference to a step, as used by [`Step::awaits`].
    pub fn location(plan_id: &Uuid, step_id: &str) -> String {
        format!("{plan_id}/{step_id}")
    }
}

/// Thresholds tracked while observing a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalThreshold {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl SignalThreshold {
    pub fn at_most(name: impl Into<String>, max: f64) -> Self {
        Self {
            name: name.into(),
            min: None,
            max: Some(max),
        }
    }

    pub fn within(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// Observation window and tracked signals, fixed when the plan is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSpec {
    pub window_ms: u64,
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub signals: Vec<SignalThreshold>,
}

/// A finding the plan builder refused to turn into a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedFinding {
    pub finding_id: String,
    pub reason: String,
}

/// A finding dropped because an equivalent step already exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateFinding {
    pub finding_id: String,
    /// Where the equivalent step lives ("<plan>/<step>" or the earlier finding id).
    pub existing: String,
}

/// An ordered DAG of steps plus run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub repository: String,
    pub created_at: DateTime<Utc>,
    pub status: PlanStatus,
    /// Steps in topological order.
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedFinding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duplicates: Vec<DuplicateFinding>,
    pub observation: ObservationSpec,
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Recompute the aggregate status from the step statuses.
    pub fn refresh_status(&mut self) {
        self.status = PlanStatus::aggregate(&self.steps);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approve,
    Simulate,
    Block,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Approve => write!(f, "approve"),
            Verdict::Simulate => write!(f, "simulate"),
            Verdict::Block => write!(f, "block"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum DecisionSubject {
    Plan,
    Step { step_id: String },
}

/// The risk gate's verdict on a plan or a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub subject: DecisionSubject,
    pub verdict: Verdict,
    pub reason: String,
    /// Policy rule that produced the verdict, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl Decision {
    pub fn step_id(&self) -> Option<&str> {
        match &self.subject {
            DecisionSubject::Step { step_id } => Some(step_id),
            DecisionSubject::Plan => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeClass {
    Healthy,
    Degraded,
    Failed,
}

impl fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeClass::Healthy => write!(f, "healthy"),
            OutcomeClass::Degraded => write!(f, "degraded"),
            OutcomeClass::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalState {
    WithinBounds,
    /// Breached during the window but back within bounds at its end.
    Recovered,
    Breached,
    Unavailable,
}

/// Per-signal evidence backing an [`Outcome`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReport {
    pub threshold: SignalThreshold,
    pub state: SignalState,
    #[serde(default)]
    pub samples: usize,
    #[serde(default)]
    pub breaches: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_value: Option<f64>,
}

/// The observer's classification of a completed plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub class: OutcomeClass,
    pub reason: String,
    #[serde(default)]
    pub signals: Vec<SignalReport>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Future approvals of `action` are downgraded to `simulate` until `until`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demotion {
    pub action: String,
    pub until: DateTime<Utc>,
    pub reason: String,
}

impl Demotion {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.until
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

fn is_false(b: &bool) -> bool {
    !*b
}
