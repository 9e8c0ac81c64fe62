//! Ledger entry format.
//!
//! One JSON object per line. Every entry carries its sequence number,
//! timestamp, plan id and a `kind` tag naming the record it wraps:
//!
//! ```json
//! {"seq":7,"at":"2026-01-05T10:00:00Z","plan_id":"…","kind":"step_transition","step_id":"s1","status":"running","attempt":1}
//! ```
//!
//! Unknown fields are ignored when reading. Entries of an unknown kind are
//! skipped so that older binaries can replay ledgers written by newer ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use steward_core::{Decision, Demotion, Outcome, Plan, RunStatus, Step, StepStatus};
use uuid::Uuid;

use crate::error::LedgerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub plan_id: Uuid,
    #[serde(flatten)]
    pub record: LedgerRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerRecord {
    /// A new plan with all its steps `pending`.
    PlanCreated { plan: Plan },

    /// A step synthesized after plan creation (compensations).
    StepAdded { step: Step },

    Decision { decision: Decision },

    StepTransition {
        step_id: String,
        status: StepStatus,
        #[serde(default)]
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff: Option<Value>,
    },

    /// A failed attempt that did not (yet) fail the step.
    AttemptFailed {
        step_id: String,
        attempt: u32,
        retryable: bool,
        error: String,
    },

    Outcome { outcome: Outcome },

    Demotion { demotion: Demotion },

    /// Result of rolling back a plan's succeeded steps.
    Rollback {
        reason: String,
        compensated: Vec<String>,
        uncompensated: Vec<String>,
    },

    /// The control loop is done with the plan.
    PlanClosed { status: RunStatus, reason: String },
}

impl LedgerRecord {
    pub const KINDS: &'static [&'static str] = &[
        "plan_created",
        "step_added",
        "decision",
        "step_transition",
        "attempt_failed",
        "outcome",
        "demotion",
        "rollback",
        "plan_closed",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            LedgerRecord::PlanCreated { .. } => "plan_created",
            LedgerRecord::StepAdded { .. } => "step_added",
            LedgerRecord::Decision { .. } => "decision",
            LedgerRecord::StepTransition { .. } => "step_transition",
            LedgerRecord::AttemptFailed { .. } => "attempt_failed",
            LedgerRecord::Outcome { .. } => "outcome",
            LedgerRecord::Demotion { .. } => "demotion",
            LedgerRecord::Rollback { .. } => "rollback",
            LedgerRecord::PlanClosed { .. } => "plan_closed",
        }
    }

    pub fn is_known_kind(kind: &str) -> bool {
        Self::KINDS.contains(&kind)
    }
}

impl fmt::Display for LedgerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerRecord::StepTransition {
                step_id, status, ..
            } => write!(f, "step_transition({step_id} -> {status})"),
            LedgerRecord::Decision { decision } => write!(
                f,
                "decision({} {})",
                decision.step_id().unwrap_or("plan"),
                decision.verdict
            ),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Result of decoding a whole ledger file.
#[derive(Debug, Default)]
pub struct DecodedLedger {
    pub entries: Vec<LedgerEntry>,
    /// Number of entries skipped because of an unknown kind.
    pub skipped: usize,
    /// Byte offset where an incomplete trailing line starts, if any.
    pub torn_tail: Option<usize>,
}

/// Decode JSON Lines ledger content.
///
/// A line that fails to decode is an error, except for the final line when
/// it is not newline-terminated: that is an append interrupted by a crash
/// and is reported through `torn_tail` instead.
pub fn decode(content: &str) -> Result<DecodedLedger, LedgerError> {
    let mut decoded = DecodedLedger::default();
    let mut offset = 0;

    for (idx, raw) in content.split_inclusive('\n').enumerate() {
        let line_start = offset;
        offset += raw.len();

        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let terminated = raw.ends_with('\n');

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) if !terminated => {
                tracing::warn!(
                    line = idx + 1,
                    error = %e,
                    "Ignoring incomplete trailing ledger entry"
                );
                decoded.torn_tail = Some(line_start);
                break;
            }
            Err(e) => {
                return Err(LedgerError::Corrupt {
                    line: idx + 1,
                    message: e.to_string(),
                });
            }
        };

        let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
        if !LedgerRecord::is_known_kind(kind) {
            tracing::warn!(line = idx + 1, kind = %kind, "Skipping ledger entry of unknown kind");
            decoded.skipped += 1;
            continue;
        }

        let entry: LedgerEntry =
            serde_json::from_value(value).map_err(|e| LedgerError::Corrupt {
                line: idx + 1,
                message: e.to_string(),
            })?;
        decoded.entries.push(entry);
    }

    Ok(decoded)
}

/// Encode one entry as a newline-terminated JSON line.
pub fn encode(entry: &LedgerEntry) -> Result<String, LedgerError> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    Ok(line)
}
