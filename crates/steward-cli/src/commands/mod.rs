//! CLI command implementations for Steward.

pub mod actions;
pub mod check;
pub mod run;
pub mod status;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use steward_core::StewardConfig;
use steward_ledger::{FileStorage, RunLedger};
use steward_policy::{ActionRegistry, standard_actions};
use steward_runtime::{
    Agent, ChannelFeedbackSink, Collaborators, FeedbackSink, JsonlFeedbackWriter,
    SignalSource, TracingFeedbackSink,
};
use tokio::task::JoinHandle;
use tracing::info;

use crate::collaborators::{
    CommandAnalyzer, CommandBackend, CommandSignalSource, FindingsFileAnalyzer,
    UnconfiguredSignals,
};

/// Load the configuration file, or the defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<StewardConfig> {
    if !path.exists() {
        info!(path = %path.display(), "No configuration file, using defaults");
        let config = StewardConfig::default();
        config.validate()?;
        return Ok(config);
    }
    StewardConfig::load_with_context(path)
        .with_context(|| format!("failed to load {}", path.display()))
}

/// The configured catalog, or the standard one when none is configured.
pub fn build_registry(config: &StewardConfig) -> Result<ActionRegistry> {
    let specs = if config.actions.is_empty() {
        standard_actions()
    } else {
        config.actions.clone()
    };
    ActionRegistry::from_specs(specs).context("invalid action catalog")
}

pub async fn open_ledger(config: &StewardConfig) -> Result<Arc<RunLedger>> {
    let path = &config.ledger.path;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let storage = FileStorage::new(path, config.ledger.fsync);
    let ledger = RunLedger::open(Arc::new(storage))
        .await
        .with_context(|| format!("failed to open ledger {}", path.display()))?;
    Ok(Arc::new(ledger))
}

/// An agent wired to the configured collaborators, plus the feedback
/// writer task that must drain before the process exits.
pub struct Session {
    pub agent: Agent,
    feedback_task: Option<JoinHandle<()>>,
}

impl Session {
    pub async fn open(config: &StewardConfig, findings: Option<PathBuf>) -> Result<Self> {
        let registry = build_registry(config)?;
        let ledger = open_ledger(config).await?;

        let analyzer: Arc<dyn steward_planner::Analyzer> = match (findings, &config.analyzer.command) {
            (Some(path), _) => Arc::new(FindingsFileAnalyzer::new(Some(path))),
            (None, Some(command)) => Arc::new(CommandAnalyzer::new(command.clone())),
            (None, None) => Arc::new(FindingsFileAnalyzer::new(
                config.analyzer.findings_file.clone(),
            )),
        };
        let signals: Arc<dyn SignalSource> = match &config.backend.signals {
            Some(command) => Arc::new(CommandSignalSource::new(command.clone())),
            None => Arc::new(UnconfiguredSignals),
        };
        let (feedback, feedback_task): (Arc<dyn FeedbackSink>, _) = match &config.feedback.path {
            Some(path) => {
                let (sink, handle) = ChannelFeedbackSink::spawn(
                    JsonlFeedbackWriter::new(path),
                    config.feedback.capacity,
                );
                (Arc::new(sink), Some(handle))
            }
            None => (Arc::new(TracingFeedbackSink), None),
        };

        let agent = Agent::new(
            config,
            registry,
            ledger,
            Collaborators {
                analyzer,
                backend: Arc::new(CommandBackend::new(config.backend.clone())),
                signals,
                feedback,
            },
        )?;
        Ok(Self {
            agent,
            feedback_task,
        })
    }

    /// Drop the agent and wait for queued feedback to be written.
    pub async fn close(self) {
        let Self {
            agent,
            feedback_task,
        } = self;
        drop(agent);
        if let Some(task) = feedback_task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Feedback writer stopped abnormally");
            }
        }
    }
}
