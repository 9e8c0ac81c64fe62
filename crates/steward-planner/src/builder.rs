//! Turns findings into a plan.
//!
//! Building is pure: identical findings against an identical ledger state
//! always produce an identical plan (same id, same step ids, same order),
//! which is what makes re-running after a crash idempotent.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use steward_core::{
    DuplicateFinding, Finding, ObservationSpec, Plan, PlanStatus, RejectedFinding, Step,
    StepStatus,
};
use steward_ledger::{LedgerState, step_key};
use steward_policy::ActionRegistry;
use uuid::Uuid;

use crate::error::PlanError;
use crate::ordering::OrderingTable;

/// Namespace for name-based plan ids.
const PLAN_NAMESPACE: Uuid = Uuid::from_u128(0x5e1f_0c0a_7d1b_4c8e_9a3b_2f60_d4e5_a001);

pub struct PlanBuilder<'a> {
    registry: &'a ActionRegistry,
    ordering: &'a OrderingTable,
    observation: ObservationSpec,
}

/// What happened to one finding while building.
enum Disposition {
    Accepted,
    Rejected(String),
    /// Same (action, target, params) as a live step in the ledger, by its
    /// `<plan>/<step>` location.
    InHistory(String),
    /// Same tuple as an earlier finding of this batch (its index).
    Alias(usize),
}

impl<'a> PlanBuilder<'a> {
    pub fn new(
        registry: &'a ActionRegistry,
        ordering: &'a OrderingTable,
        observation: ObservationSpec,
    ) -> Self {
        Self {
            registry,
            ordering,
            observation,
        }
    }

    pub fn build(
        &self,
        repository: &str,
        findings: &[Finding],
        history: &LedgerState,
        created_at: DateTime<Utc>,
    ) -> Result<Plan, PlanError> {
        let live = history.live_step_keys();
        let mut dispositions = Vec::with_capacity(findings.len());
        let mut params = Vec::with_capacity(findings.len());
        let mut categories = Vec::with_capacity(findings.len());
        let mut first_by_key = BTreeMap::new();
        let mut index_by_id: BTreeMap<&str, usize> = BTreeMap::new();

        // Map each finding onto an action and validate it.
        for (idx, finding) in findings.iter().enumerate() {
            let normalized = match &finding.params {
                Value::Null => json!({}),
                other => other.clone(),
            };
            params.push(normalized);
            categories.push(String::new());

            if index_by_id.insert(&finding.id, idx).is_some() {
                dispositions.push(Disposition::Rejected(format!(
                    "duplicate finding id '{}'",
                    finding.id
                )));
                continue;
            }

            let spec = match self.registry.lookup(&finding.action) {
                Ok(spec) => spec,
                Err(e) => {
                    dispositions.push(Disposition::Rejected(e.to_string()));
                    continue;
                }
            };
            categories[idx] = spec.category.clone();

            if let Err(e) = self.registry.validate_parameters(spec, &params[idx]) {
                dispositions.push(Disposition::Rejected(e.to_string()));
                continue;
            }

            let key = step_key(&finding.action, &finding.target, &params[idx]);
            if let Some(existing) = live.get(&key) {
                dispositions.push(Disposition::InHistory(existing.clone()));
            } else if let Some(&first) = first_by_key.get(&key) {
                dispositions.push(Disposition::Alias(first));
            } else {
                first_by_key.insert(key, idx);
                dispositions.push(Disposition::Accepted);
            }
        }

        // Resolve explicit dependencies; rejection propagates to dependents.
        // A dependency on a history step that has not succeeded yet becomes
        // an `awaits` entry on the dependent.
        let mut edges: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        let mut awaits: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        loop {
            let mut changed = false;
            for (idx, finding) in findings.iter().enumerate() {
                if !matches!(dispositions[idx], Disposition::Accepted) {
                    continue;
                }
                let mut preds = BTreeSet::new();
                let mut waits = BTreeSet::new();
                let mut rejection = None;
                for dep in &finding.depends_on {
                    let Some(&dep_idx) = index_by_id.get(dep.as_str()) else {
                        rejection = Some(format!("depends on unknown finding '{dep}'"));
                        break;
                    };
                    match &dispositions[dep_idx] {
                        Disposition::Accepted => {
                            preds.insert(dep_idx);
                        }
                        Disposition::Alias(first) => {
                            preds.insert(*first);
                        }
                        Disposition::InHistory(location) => {
                            let done = history
                                .step_at(location)
                                .is_some_and(|s| s.status == StepStatus::Succeeded);
                            if !done {
                                waits.insert(location.clone());
                            }
                        }
                        Disposition::Rejected(_) => {
                            rejection = Some(format!("depends on rejected finding '{dep}'"));
                            break;
                        }
                    }
                }
                match rejection {
                    Some(reason) => {
                        dispositions[idx] = Disposition::Rejected(reason);
                        changed = true;
                    }
                    None => {
                        preds.remove(&idx);
                        edges.insert(idx, preds);
                        awaits.insert(idx, waits);
                    }
                }
            }
            if !changed {
                break;
            }
        }

        // An alias whose first occurrence got rejected is rejected as well.
        for idx in 0..findings.len() {
            if let Disposition::Alias(first) = dispositions[idx] {
                if let Disposition::Rejected(_) = dispositions[first] {
                    dispositions[idx] =
                        Disposition::Rejected(format!("duplicate of rejected finding '{}'", findings[first].id));
                }
            }
        }

        let accepted: Vec<usize> = (0..findings.len())
            .filter(|&i| matches!(dispositions[i], Disposition::Accepted))
            .collect();

        // Ordering-table edges between every pair of accepted findings.
        for &after in &accepted {
            for &before in &accepted {
                if self.ordering.requires(&categories[before], &categories[after]) {
                    edges.entry(after).or_default().insert(before);
                }
            }
        }

        let order = topological_order(&accepted, &edges).map_err(|stuck| PlanError::Cyclic {
            findings: stuck.iter().map(|&i| findings[i].id.clone()).collect(),
        })?;

        let step_ids: BTreeMap<usize, String> = order
            .iter()
            .enumerate()
            .map(|(pos, &idx)| (idx, format!("s{}", pos + 1)))
            .collect();
        let position: BTreeMap<usize, usize> =
            order.iter().enumerate().map(|(pos, &idx)| (idx, pos)).collect();

        let mut steps = Vec::with_capacity(order.len());
        for &idx in &order {
            let finding = &findings[idx];
            let spec = match self.registry.lookup(&finding.action) {
                Ok(spec) => spec,
                Err(_) => continue,
            };
            let mut preds: Vec<usize> = edges
                .get(&idx)
                .map(|p| p.iter().copied().collect())
                .unwrap_or_default();
            preds.sort_by_key(|p| position[p]);

            steps.push(Step {
                id: step_ids[&idx].clone(),
                action: spec.name.clone(),
                target: finding.target.clone(),
                params: params[idx].clone(),
                finding_id: Some(finding.id.clone()),
                depends_on: preds.iter().map(|p| step_ids[p].clone()).collect(),
                awaits: awaits
                    .get(&idx)
                    .map(|w| w.iter().cloned().collect())
                    .unwrap_or_default(),
                optional: finding.optional,
                reversibility: spec.reversibility,
                risk: spec.risk,
                status: StepStatus::Pending,
                attempts: 0,
                reason: None,
                compensation_of: None,
            });
        }

        let mut rejected = Vec::new();
        let mut duplicates = Vec::new();
        for (idx, disposition) in dispositions.iter().enumerate() {
            let finding_id = findings[idx].id.clone();
            match disposition {
                Disposition::Accepted => {}
                Disposition::Rejected(reason) => {
                    tracing::warn!(finding = %finding_id, reason = %reason, "Finding rejected");
                    rejected.push(RejectedFinding {
                        finding_id,
                        reason: reason.clone(),
                    });
                }
                Disposition::InHistory(existing) => duplicates.push(DuplicateFinding {
                    finding_id,
                    existing: existing.clone(),
                }),
                Disposition::Alias(first) => duplicates.push(DuplicateFinding {
                    finding_id,
                    existing: findings[*first].id.clone(),
                }),
            }
        }

        let id = plan_id(repository, findings, history.last_seq());
        let status = PlanStatus::aggregate(&steps);
        tracing::info!(
            plan_id = %id,
            repository = %repository,
            steps = steps.len(),
            rejected = rejected.len(),
            duplicates = duplicates.len(),
            "Built plan"
        );

        Ok(Plan {
            id,
            repository: repository.to_string(),
            created_at,
            status,
            steps,
            rejected,
            duplicates,
            observation: self.observation.clone(),
        })
    }
}

/// Kahn's algorithm; among ready nodes the one with the smallest finding
/// index goes first. Returns the nodes left on a cycle on failure.
fn topological_order(
    nodes: &[usize],
    edges: &BTreeMap<usize, BTreeSet<usize>>,
) -> Result<Vec<usize>, Vec<usize>> {
    let mut indegree: BTreeMap<usize, usize> = nodes.iter().map(|&n| (n, 0)).collect();
    let mut dependents: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &node in nodes {
        for &pred in edges.get(&node).into_iter().flatten() {
            if indegree.contains_key(&pred) {
                *indegree.entry(node).or_default() += 1;
                dependents.entry(pred).or_default().push(node);
            }
        }
    }

    let mut ready: BTreeSet<usize> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &next in dependents.get(&node).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(&next) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        let placed: BTreeSet<usize> = order.into_iter().collect();
        Err(nodes.iter().copied().filter(|n| !placed.contains(n)).collect())
    }
}

fn plan_id(repository: &str, findings: &[Finding], ledger_seq: u64) -> Uuid {
    let canonical = json!({
        "repository": repository,
        "findings": findings,
        "ledger_seq": ledger_seq,
    });
    Uuid::new_v5(&PLAN_NAMESPACE, canonical.to_string().as_bytes())
}
