//! Compiled policy table rows.

use crate::error::GateError;
use regex::Regex;
use steward_core::{PolicyRule, Reversibility, RiskClass, Step, Verdict};

/// A [`PolicyRule`] with its patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    action: Option<Regex>,
    target: Option<Regex>,
    risk: Option<RiskClass>,
    reversibility: Option<Reversibility>,
    pub verdict: Verdict,
}

impl CompiledRule {
    pub fn compile(rule: &PolicyRule) -> Result<Self, GateError> {
        let pattern = |p: &Option<String>| -> Result<Option<Regex>, GateError> {
            p.as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|source| GateError::InvalidPattern {
                    rule: rule.name.clone(),
                    source,
                })
        };
        Ok(Self {
            name: rule.name.clone(),
            action: pattern(&rule.action)?,
            target: pattern(&rule.target)?,
            risk: rule.risk,
            reversibility: rule.reversibility,
            verdict: rule.verdict,
        })
    }

    /// True when every matcher present on the rule accepts the step.
    pub fn matches(&self, step: &Step) -> bool {
        self.action.as_ref().is_none_or(|re| re.is_match(&step.action))
            && self.target.as_ref().is_none_or(|re| re.is_match(&step.target))
            && self.risk.is_none_or(|r| r == step.risk)
            && self.reversibility.is_none_or(|r| r == step.reversibility)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use steward_core::StepStatus;

    fn step(action: &str, target: &str) -> Step {
        Step {
            id: "s1".to_string(),
            action: action.to_string(),
            target: target.to_string(),
            params: json!({}),
            finding_id: None,
            depends_on: vec![],
            awaits: Vec::new(),
            optional: false,
            reversibility: Reversibility::Irreversible,
            risk: RiskClass::High,
            status: StepStatus::Pending,
            attempts: 0,
            reason: None,
            compensation_of: None,
        }
    }

    #[test]
    fn all_present_matchers_must_match() {
        let rule = CompiledRule::compile(&PolicyRule {
            name: "staging-destroy".to_string(),
            action: Some("^destroy_".to_string()),
            target: Some("^staging/".to_string()),
            risk: None,
            reversibility: Some(Reversibility::Irreversible),
            verdict: Verdict::Approve,
        })
        .unwrap();

        assert!(rule.matches(&step("destroy_infrastructure", "staging/db")));
        assert!(!rule.matches(&step("destroy_infrastructure", "prod/db")));
        assert!(!rule.matches(&step("scale_up", "staging/db")));
    }

    #[test]
    fn bad_pattern_names_the_rule() {
        let err = CompiledRule::compile(&PolicyRule {
            name: "broken".to_string(),
            action: Some("(".to_string()),
            target: None,
            risk: None,
            reversibility: None,
            verdict: Verdict::Block,
        })
        .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
