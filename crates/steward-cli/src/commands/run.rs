//! `steward run` and `steward resume`.
//!
//! Both install a SIGINT/SIGTERM handler that cancels the run: in-flight
//! steps are marked failed and the plan is left open for `steward resume`.

use anyhow::Result;
use std::path::{Path, PathBuf};
use steward_core::DecisionSubject;
use steward_runtime::{Cancellation, RunMode, RunReport};
use tracing::warn;

use super::{Session, load_config};

pub async fn run(
    config_path: &Path,
    repository: &str,
    mode: RunMode,
    findings: Option<PathBuf>,
    json: bool,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let session = Session::open(&config, findings).await?;
    let cancel = cancel_on_shutdown();

    let result = session.agent.run(repository, mode, &cancel).await;
    session.close().await;
    let report = result?;

    print_report(&report, json)?;
    Ok(report.exit_code())
}

pub async fn resume(config_path: &Path, json: bool) -> Result<i32> {
    let config = load_config(config_path)?;
    let session = Session::open(&config, None).await?;
    let cancel = cancel_on_shutdown();

    let result = session.agent.resume(&cancel).await;
    session.close().await;
    let reports = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else if reports.is_empty() {
        println!("Nothing to resume.");
    } else {
        for report in &reports {
            print_report(report, false)?;
        }
    }
    Ok(reports.iter().map(RunReport::exit_code).max().unwrap_or(0))
}

/// A cancellation triggered by Ctrl-C or SIGTERM.
fn cancel_on_shutdown() -> Cancellation {
    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown requested, cancelling in-flight steps");
        trigger.cancel();
    });
    cancel
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!();
    println!("{}", "═".repeat(60));
    match report.plan_id {
        Some(id) => println!("Plan {id} ({})", report.repository),
        None => println!("Repository {}", report.repository),
    }
    println!("Status: {} ({})", report.status, report.reason);
    if let Some(plan_status) = report.plan_status {
        println!("Steps: {plan_status}");
    }

    if !report.decisions.is_empty() {
        println!("\nDecisions:");
        for decision in &report.decisions {
            let subject = match &decision.subject {
                DecisionSubject::Plan => "plan".to_string(),
                DecisionSubject::Step { step_id } => step_id.clone(),
            };
            println!("  {:<10} {:<9} {}", subject, decision.verdict.to_string(), decision.reason);
        }
    }

    if let Some(outcome) = &report.outcome {
        println!("\nOutcome: {} ({})", outcome.class, outcome.reason);
    }

    if !report.rejected.is_empty() {
        println!("\nRejected findings:");
        for rejected in &report.rejected {
            println!("  {}: {}", rejected.finding_id, rejected.reason);
        }
    }
    if !report.duplicates.is_empty() {
        println!("\nAlready handled:");
        for duplicate in &report.duplicates {
            println!("  {} (see {})", duplicate.finding_id, duplicate.existing);
        }
    }
    if !report.uncompensated.is_empty() {
        println!("\n❌ Uncompensated steps: {}", report.uncompensated.join(", "));
    }
    println!("{}", "═".repeat(60));
    Ok(())
}
