//! Risk gate policy and resource ordering configuration.

use crate::{Reversibility, RiskClass, Verdict};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Explicit rules, evaluated in order before the default policy.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,

    /// A simulated step is approved only if its dry-run diff has at most
    /// this many changes.
    #[serde(default = "default_max_simulated_changes")]
    pub max_simulated_changes: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            max_simulated_changes: default_max_simulated_changes(),
        }
    }
}

/// One row of the policy table. All present matchers must match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,

    /// Regular expression matched against the action name.
    #[serde(default)]
    pub action: Option<String>,

    /// Regular expression matched against the step target.
    #[serde(default)]
    pub target: Option<String>,

    #[serde(default)]
    pub risk: Option<RiskClass>,

    #[serde(default)]
    pub reversibility: Option<Reversibility>,

    pub verdict: Verdict,
}

/// `before` category steps run ahead of `after` category steps in the same plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingRule {
    pub before: String,
    pub after: String,
}

impl OrderingRule {
    pub fn new(before: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            before: before.into(),
            after: after.into(),
        }
    }
}

fn default_max_simulated_changes() -> usize {
    50
}
