//! The run ledger: serialized appends over a storage backend.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use steward_core::{Decision, Demotion, Outcome, Plan, RunStatus, Step, StepStatus};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::entry::{LedgerEntry, LedgerRecord};
use crate::error::LedgerError;
use crate::state::LedgerState;
use crate::storage::LedgerStorage;

/// Single writer for the ledger.
///
/// Sequence assignment, validation, persistence and the in-memory state
/// update happen under one lock, so entries are totally ordered and the
/// in-memory state never runs ahead of what is on disk.
pub struct RunLedger {
    storage: Arc<dyn LedgerStorage>,
    state: Mutex<LedgerState>,
}

impl RunLedger {
    /// Open a ledger, replaying whatever the storage already holds.
    pub async fn open(storage: Arc<dyn LedgerStorage>) -> Result<Self, LedgerError> {
        let entries = storage.load().await?;
        let state = LedgerState::replay(&entries)?;
        tracing::info!(
            entries = entries.len(),
            plans = state.plans().count(),
            last_seq = state.last_seq(),
            "Ledger replayed"
        );
        Ok(Self {
            storage,
            state: Mutex::new(state),
        })
    }

    /// Append a record for `plan_id`, stamped with the current time.
    pub async fn append(
        &self,
        plan_id: Uuid,
        record: LedgerRecord,
    ) -> Result<LedgerEntry, LedgerError> {
        self.append_at(plan_id, record, Utc::now()).await
    }

    pub async fn append_at(
        &self,
        plan_id: Uuid,
        record: LedgerRecord,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut state = self.state.lock().await;
        let entry = LedgerEntry {
            seq: state.last_seq() + 1,
            at,
            plan_id,
            record,
        };

        if let Err(e) = state.validate(&entry) {
            tracing::error!(
                plan_id = %plan_id,
                entry = %entry.record,
                error = %e,
                "Rejected ledger entry"
            );
            return Err(e);
        }
        self.storage.append(&entry).await?;
        state.apply_unchecked(&entry);

        tracing::debug!(
            seq = entry.seq,
            plan_id = %plan_id,
            entry = %entry.record,
            "Ledger append"
        );
        Ok(entry)
    }

    /// A copy of the current state.
    pub async fn snapshot(&self) -> LedgerState {
        self.state.lock().await.clone()
    }

    /// Read the current state without copying it.
    pub async fn read<R>(&self, f: impl FnOnce(&LedgerState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    /// Every persisted entry, straight from storage.
    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.storage.load().await
    }

    // =========================================================================
    // Typed helpers
    // =========================================================================

    pub async fn record_plan(&self, plan: &Plan) -> Result<LedgerEntry, LedgerError> {
        self.append(plan.id, LedgerRecord::PlanCreated { plan: plan.clone() })
            .await
    }

    pub async fn record_step(&self, plan_id: Uuid, step: &Step) -> Result<LedgerEntry, LedgerError> {
        self.append(plan_id, LedgerRecord::StepAdded { step: step.clone() })
            .await
    }

    pub async fn record_decision(
        &self,
        plan_id: Uuid,
        decision: &Decision,
    ) -> Result<LedgerEntry, LedgerError> {
        self.append(
            plan_id,
            LedgerRecord::Decision {
                decision: decision.clone(),
            },
        )
        .await
    }

    pub async fn transition(
        &self,
        plan_id: Uuid,
        step_id: &str,
        status: StepStatus,
        attempt: u32,
        reason: Option<String>,
        diff: Option<Value>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.append(
            plan_id,
            LedgerRecord::StepTransition {
                step_id: step_id.to_string(),
                status,
                attempt,
                reason,
                diff,
            },
        )
        .await
    }

    pub async fn record_attempt_failure(
        &self,
        plan_id: Uuid,
        step_id: &str,
        attempt: u32,
        retryable: bool,
        error: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        self.append(
            plan_id,
            LedgerRecord::AttemptFailed {
                step_id: step_id.to_string(),
                attempt,
                retryable,
                error: error.to_string(),
            },
        )
        .await
    }

    pub async fn record_outcome(
        &self,
        plan_id: Uuid,
        outcome: &Outcome,
    ) -> Result<LedgerEntry, LedgerError> {
        self.append(
            plan_id,
            LedgerRecord::Outcome {
                outcome: outcome.clone(),
            },
        )
        .await
    }

    pub async fn record_demotion(
        &self,
        plan_id: Uuid,
        demotion: &Demotion,
    ) -> Result<LedgerEntry, LedgerError> {
        self.append(
            plan_id,
            LedgerRecord::Demotion {
                demotion: demotion.clone(),
            },
        )
        .await
    }

    pub async fn record_rollback(
        &self,
        plan_id: Uuid,
        reason: &str,
        compensated: Vec<String>,
        uncompensated: Vec<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.append(
            plan_id,
            LedgerRecord::Rollback {
                reason: reason.to_string(),
                compensated,
                uncompensated,
            },
        )
        .await
    }

    pub async fn close_plan(
        &self,
        plan_id: Uuid,
        status: RunStatus,
        reason: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        self.append(
            plan_id,
            LedgerRecord::PlanClosed {
                status,
                reason: reason.to_string(),
            },
        )
        .await
    }
}
