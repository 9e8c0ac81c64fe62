//! `steward status`: per-plan summaries from the ledger.

use anyhow::{Result, bail};
use std::path::Path;
use steward_runtime::{PlanSummary, StepSummary};
use uuid::Uuid;

use super::{load_config, open_ledger};

pub async fn run(config_path: &Path, plan: Option<Uuid>, json: bool) -> Result<i32> {
    let config = load_config(config_path)?;
    let ledger = open_ledger(&config).await?;

    let summaries: Vec<PlanSummary> = ledger
        .read(|s| {
            s.plans()
                .filter(|ps| plan.is_none_or(|id| ps.plan.id == id))
                .map(PlanSummary::from_state)
                .collect()
        })
        .await;

    if let Some(id) = plan {
        if summaries.is_empty() {
            bail!("unknown plan: {id}");
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(0);
    }
    if summaries.is_empty() {
        println!("No plans recorded in {}", config.ledger.path.display());
        return Ok(0);
    }

    for summary in &summaries {
        print_summary(summary, plan.is_some());
    }
    Ok(0)
}

fn print_summary(summary: &PlanSummary, detailed: bool) {
    let closed = match summary.closed {
        Some(status) => status.to_string(),
        None => "open".to_string(),
    };
    println!(
        "{}  {}  {:<9} steps:{:<9} {}",
        summary.plan_id,
        summary.created_at.format("%Y-%m-%d %H:%M:%S"),
        closed,
        summary.status.to_string(),
        summary.repository
    );

    if !detailed {
        return;
    }
    if let Some(reason) = &summary.reason {
        println!("  reason:  {reason}");
    }
    if let Some(outcome) = summary.outcome {
        println!("  outcome: {outcome}");
    }
    for step in &summary.steps {
        print_step(step);
    }
    if !summary.uncompensated.is_empty() {
        println!("  uncompensated: {}", summary.uncompensated.join(", "));
    }
}

fn print_step(step: &StepSummary) {
    let mut line = format!(
        "  {:<10} {:<11} {} {} (attempts: {})",
        step.id, step.status.to_string(), step.action, step.target, step.attempts
    );
    if let Some(original) = &step.compensation_of {
        line.push_str(&format!(" undoes {original}"));
    }
    if let Some(reason) = &step.reason {
        line.push_str(&format!(" - {reason}"));
    }
    println!("{line}");
}
