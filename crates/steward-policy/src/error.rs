//! Error types for the action registry and the risk gate.
//!
//! Parameter problems are reported as [`ValidationError`]s so the plan
//! builder can record them against the offending finding; catalog problems
//! are [`RegistryError`]s and abort startup.

use std::fmt;
use thiserror::Error;

/// Error type for parameter validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// The kind of validation error.
    pub kind: ValidationErrorKind,
    /// Action whose parameters were rejected.
    pub action: String,
    /// Human-readable error message.
    pub message: String,
}

impl ValidationError {
    /// Create a new validation error.
    pub fn new(
        kind: ValidationErrorKind,
        action: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            action: action.into(),
            message: message.into(),
        }
    }

    // =========================================================================
    // PARAMETER SHAPE ERRORS
    // =========================================================================

    /// Create a parameters-must-be-an-object error.
    pub fn not_an_object(action: &str) -> Self {
        Self::new(
            ValidationErrorKind::NotAnObject,
            action,
            format!("Parameters for '{}' must be a JSON object", action),
        )
    }

    // =========================================================================
    // SCHEMA ERRORS
    // =========================================================================

    /// Create a schema violation error from the individual violations.
    pub fn schema_violation(action: &str, violations: &[String]) -> Self {
        Self::new(
            ValidationErrorKind::SchemaViolation,
            action,
            format!(
                "Parameters for '{}' do not match its schema: {}",
                action,
                violations.join("; ")
            ),
        )
    }

    /// Create an error for an action whose schema was never compiled.
    pub fn schema_unavailable(action: &str) -> Self {
        Self::new(
            ValidationErrorKind::SchemaUnavailable,
            action,
            format!("No compiled parameter schema for '{}'", action),
        )
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Categories of validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    NotAnObject,
    SchemaViolation,
    SchemaUnavailable,
}

/// Errors raised while building or querying the action catalog.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate action: {0}")]
    DuplicateAction(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid parameter schema for '{action}': {message}")]
    InvalidSchema { action: String, message: String },

    #[error("compensable action '{0}' does not declare a compensation")]
    MissingCompensation(String),

    #[error("irreversible action '{0}' cannot declare a compensation")]
    IrreversibleCompensation(String),

    #[error("action '{action}' is compensated by unknown action '{compensation}'")]
    UnknownCompensation { action: String, compensation: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Errors raised while compiling the policy table.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("policy rule '{rule}' has an invalid pattern: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
}
