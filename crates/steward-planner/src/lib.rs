//! Plan building for Steward.
//!
//! Findings from an [`Analyzer`] are mapped onto registered actions,
//! ordered by explicit dependencies and the category [`OrderingTable`], and
//! deduplicated against the ledger by [`PlanBuilder`].

pub mod analyzer;
pub mod builder;
pub mod error;
pub mod ordering;

pub use analyzer::{Analyzer, StaticAnalyzer};
pub use builder::PlanBuilder;
pub use error::PlanError;
pub use ordering::OrderingTable;
