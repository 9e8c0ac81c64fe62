use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    /// The dependency edges between findings form a cycle. Fatal for the
    /// plan; nothing is recorded or executed.
    #[error("dependency cycle among findings: {}", findings.join(", "))]
    Cyclic { findings: Vec<String> },
}
