//! Steward policy
//!
//! Two pieces decide what the control loop is allowed to do:
//!
//! - [`ActionRegistry`]: the catalog of operation types, each with declared
//!   reversibility, risk class and a JSON Schema for its parameters.
//! - [`RiskGate`]: maps a step (and then its plan) to `approve`, `simulate`
//!   or `block` using an ordered policy table plus the default table.

pub mod catalog;
pub mod error;
pub mod gate;
pub mod registry;
pub mod rules;

pub use catalog::standard_actions;
pub use error::{GateError, RegistryError, ValidationError, ValidationErrorKind};
pub use gate::{DryRunReport, GateContext, RiskGate, count_changes};
pub use registry::ActionRegistry;
pub use rules::CompiledRule;
