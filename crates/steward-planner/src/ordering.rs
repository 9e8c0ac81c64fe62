//! Static resource-ordering table keyed by action category pairs.

use std::collections::BTreeSet;
use steward_core::OrderingRule;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingTable {
    pairs: BTreeSet<(String, String)>,
}

impl OrderingTable {
    pub fn new(rules: &[OrderingRule]) -> Self {
        Self {
            pairs: rules
                .iter()
                .map(|r| (r.before.clone(), r.after.clone()))
                .collect(),
        }
    }

    /// Build the table from configuration, falling back to [`Self::standard`]
    /// when no rules are configured.
    pub fn from_config(rules: &[OrderingRule]) -> Self {
        if rules.is_empty() {
            Self::standard()
        } else {
            Self::new(rules)
        }
    }

    /// Networking and security first, then data and compute, then
    /// deployments, then monitoring.
    pub fn standard() -> Self {
        Self::new(&[
            OrderingRule::new("network", "compute"),
            OrderingRule::new("network", "database"),
            OrderingRule::new("security", "compute"),
            OrderingRule::new("database", "deploy"),
            OrderingRule::new("compute", "deploy"),
            OrderingRule::new("deploy", "monitoring"),
        ])
    }

    /// True when steps of category `before` must precede steps of `after`.
    pub fn requires(&self, before: &str, after: &str) -> bool {
        before != after
            && self
                .pairs
                .contains(&(before.to_string(), after.to_string()))
    }

    pub fn rules(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(b, a)| (b.as_str(), a.as_str()))
    }
}
