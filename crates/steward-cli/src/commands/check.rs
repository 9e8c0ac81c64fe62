//! `steward check` command implementation.
//!
//! Validates the configuration before anything runs:
//! - the configuration file itself and the action catalog
//! - policy rule patterns
//! - the ordering table (unknown categories, cycles)
//! - backend, signal and analyzer wiring

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use steward_core::{Reversibility, StewardConfig, Verdict};
use steward_planner::OrderingTable;
use steward_policy::{ActionRegistry, CompiledRule};

use super::{build_registry, load_config};

// ============================================================================
// Check Result Types
// ============================================================================

/// Severity level for check results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A single check finding.
#[derive(Debug, Clone)]
pub struct CheckFinding {
    pub severity: Severity,
    /// Category of the check that produced this finding.
    pub category: String,
    pub message: String,
    /// Optional location within the configuration (e.g., "policy.rules[2]").
    pub location: Option<String>,
}

impl CheckFinding {
    fn new(severity: Severity, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            category: category.into(),
            message: message.into(),
            location: None,
        }
    }

    fn error(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, category, message)
    }

    fn warning(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, category, message)
    }

    fn info(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, category, message)
    }

    fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Results from running all checks.
#[derive(Debug, Default)]
pub struct CheckResults {
    pub findings: Vec<CheckFinding>,
}

impl CheckResults {
    fn add(&mut self, finding: CheckFinding) {
        self.findings.push(finding);
    }

    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    fn with_severity(&self, severity: Severity) -> Vec<&CheckFinding> {
        let mut findings: Vec<_> = self
            .findings
            .iter()
            .filter(|f| f.severity == severity)
            .collect();
        findings.sort_by(|a, b| a.category.cmp(&b.category));
        findings
    }

    pub fn print_summary(&self) {
        let errors = self.with_severity(Severity::Error);
        let warnings = self.with_severity(Severity::Warning);
        let infos = self.with_severity(Severity::Info);

        if !errors.is_empty() {
            println!("\n❌ Errors ({}):", errors.len());
            println!("{}", "─".repeat(60));
            for finding in &errors {
                print_finding(finding);
            }
        }

        if !warnings.is_empty() {
            println!("\n⚠️  Warnings ({}):", warnings.len());
            println!("{}", "─".repeat(60));
            for finding in &warnings {
                print_finding(finding);
            }
        }

        if !infos.is_empty() {
            println!("\nℹ️  Info ({}):", infos.len());
            println!("{}", "─".repeat(60));
            for finding in &infos {
                print_finding(finding);
            }
        }

        println!();
        println!("{}", "═".repeat(60));
        if errors.is_empty() && warnings.is_empty() {
            println!("✅ All checks passed!");
        } else {
            println!(
                "Summary: {} error(s), {} warning(s)",
                errors.len(),
                warnings.len()
            );
        }
    }
}

fn print_finding(finding: &CheckFinding) {
    match &finding.location {
        Some(location) => println!("  [{}] {} ({})", finding.category, finding.message, location),
        None => println!("  [{}] {}", finding.category, finding.message),
    }
}

// ============================================================================
// Command entry point
// ============================================================================

pub fn run(config_path: &Path) -> Result<i32> {
    println!("🔍 Checking {}", config_path.display());

    let mut results = CheckResults::default();
    if !config_path.exists() {
        results.add(CheckFinding::warning(
            "config",
            "configuration file not found, defaults apply",
        ));
    }

    match load_config(config_path) {
        Ok(config) => check_config(&config, &mut results),
        Err(e) => results.add(CheckFinding::error("config", format!("{e:#}"))),
    }

    results.print_summary();
    Ok(if results.has_errors() { 1 } else { 0 })
}

/// Run every check against a loaded configuration.
pub fn check_config(config: &StewardConfig, results: &mut CheckResults) {
    check_policy(config, results);

    let registry = match build_registry(config) {
        Ok(registry) => registry,
        Err(e) => {
            results.add(CheckFinding::error("catalog", format!("{e:#}")));
            return;
        }
    };
    check_compensations(&registry, results);
    check_ordering(config, &registry, results);
    check_wiring(config, &registry, results);
}

fn check_policy(config: &StewardConfig, results: &mut CheckResults) {
    for (idx, rule) in config.policy.rules.iter().enumerate() {
        if let Err(e) = CompiledRule::compile(rule) {
            results.add(
                CheckFinding::error("policy", e.to_string())
                    .with_location(format!("policy.rules[{idx}]")),
            );
        }
        if rule.action.is_none()
            && rule.target.is_none()
            && rule.risk.is_none()
            && rule.reversibility.is_none()
        {
            results.add(
                CheckFinding::warning(
                    "policy",
                    format!("rule '{}' matches every step", rule.name),
                )
                .with_location(format!("policy.rules[{idx}]")),
            );
        }
    }
}

fn check_compensations(registry: &ActionRegistry, results: &mut CheckResults) {
    for spec in registry.iter() {
        let Some(compensation) = &spec.compensation else {
            continue;
        };
        let Ok(undo) = registry.lookup(&compensation.action) else {
            continue;
        };
        if undo.reversibility == Reversibility::Irreversible {
            results.add(CheckFinding::warning(
                "catalog",
                format!(
                    "'{}' is compensated by irreversible action '{}', which is blocked by default",
                    spec.name, undo.name
                ),
            ));
        }
    }
}

fn check_ordering(config: &StewardConfig, registry: &ActionRegistry, results: &mut CheckResults) {
    let table = OrderingTable::from_config(&config.ordering);
    let known: BTreeSet<&str> = registry.iter().map(|s| s.category.as_str()).collect();

    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (before, after) in table.rules() {
        for category in [before, after] {
            if !known.contains(category) {
                results.add(CheckFinding::info(
                    "ordering",
                    format!("category '{category}' is not used by any action"),
                ));
            }
        }
        edges.entry(before).or_default().push(after);
    }

    if let Some(category) = find_cycle(&edges) {
        results.add(CheckFinding::error(
            "ordering",
            format!("ordering rules form a cycle through '{category}'; every plan mixing those categories would be rejected"),
        ));
    }
}

/// A category on a cycle of `edges`, if any.
fn find_cycle<'a>(edges: &BTreeMap<&'a str, Vec<&'a str>>) -> Option<&'a str> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        edges: &BTreeMap<&'a str, Vec<&'a str>>,
        marks: &mut BTreeMap<&'a str, Mark>,
    ) -> Option<&'a str> {
        match marks.get(node) {
            Some(Mark::Visiting) => return Some(node),
            Some(Mark::Done) => return None,
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        for &next in edges.get(node).into_iter().flatten() {
            if let Some(found) = visit(next, edges, marks) {
                return Some(found);
            }
        }
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    edges.keys().find_map(|&node| visit(node, edges, &mut marks))
}

fn check_wiring(config: &StewardConfig, registry: &ActionRegistry, results: &mut CheckResults) {
    for spec in registry.iter() {
        if config.backend.command_for(&spec.name).is_none() {
            results.add(CheckFinding::warning(
                "backend",
                format!("no backend command for action '{}'", spec.name),
            ));
        }
    }
    for name in config.backend.actions.keys() {
        if registry.lookup(name).is_err() {
            results.add(
                CheckFinding::warning("backend", format!("command configured for unknown action '{name}'"))
                    .with_location(format!("backend.actions.{name}")),
            );
        }
    }

    let tracked = config.observer.tracked_signals();
    if !tracked.is_empty() && config.backend.signals.is_none() {
        results.add(CheckFinding::warning(
            "observer",
            format!(
                "{} tracked signal(s) but no signal source; every outcome will be failed",
                tracked.len()
            ),
        ));
    }

    if let Some(path) = &config.analyzer.findings_file {
        if config.analyzer.command.is_none() && !path.exists() {
            results.add(CheckFinding::warning(
                "analyzer",
                format!("findings file {} does not exist", path.display()),
            ));
        }
    }

    let approves_irreversible = config.policy.rules.iter().any(|r| {
        r.verdict == Verdict::Approve
            && r.reversibility.is_none_or(|x| x == Reversibility::Irreversible)
    });
    if !approves_irreversible {
        let irreversible: Vec<&str> = registry
            .iter()
            .filter(|s| s.reversibility == Reversibility::Irreversible)
            .map(|s| s.name.as_str())
            .collect();
        if !irreversible.is_empty() {
            results.add(CheckFinding::info(
                "policy",
                format!(
                    "no rule approves irreversible actions; {} will always be blocked",
                    irreversible.join(", ")
                ),
            ));
        }
    }
}
