//! # steward-ledger
//!
//! Durable, append-only record of every plan, decision, step transition and
//! outcome. The ledger is the only persisted state: all in-memory
//! structures are rebuilt by replaying it.
//!
//! ## Guarantees
//!
//! - Entries are totally ordered by sequence number ([`RunLedger`] is the
//!   single writer).
//! - An entry is validated against the replayed state before it is
//!   written: illegal step transitions, a `running` irreversible step
//!   without a prior `approve` decision, unsatisfied dependencies (within
//!   the plan or awaited from an earlier one) and two running steps on one
//!   target are all rejected.
//! - The file format is JSON Lines, tagged by `kind`; unknown fields and
//!   kinds are ignored on replay.

pub mod entry;
pub mod error;
pub mod ledger;
pub mod state;
pub mod storage;

pub use entry::{LedgerEntry, LedgerRecord};
pub use error::LedgerError;
pub use ledger::RunLedger;
pub use state::{
    ClosedSummary, LedgerState, PlanState, RollbackSummary, StepKey, dependency_satisfied, step_key,
};
pub use storage::{FileStorage, LedgerStorage, MemoryStorage};
