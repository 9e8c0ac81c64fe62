//! Configuration types for Steward.
//!
//! Everything is loaded from a single YAML file (`steward.yaml` by default).
//! Every section is optional and falls back to the defaults documented on
//! each field. Relative paths inside the file are resolved against the
//! directory containing it.

pub mod backend;
pub mod executor;
pub mod observer;
pub mod policy;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ActionSpec;

pub use backend::{AnalyzerConfig, BackendConfig, CommandSpec};
pub use executor::{ExecutorConfig, RetryPolicy};
pub use observer::{AdapterConfig, DegradedPolicy, ObserverConfig};
pub use policy::{OrderingRule, PolicyConfig, PolicyRule};

/// Complete Steward configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StewardConfig {
    /// Project name (informational).
    #[serde(default)]
    pub project: Option<String>,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub observer: ObserverConfig,

    #[serde(default)]
    pub adapter: AdapterConfig,

    /// Category pairs that must run in order. Empty means the standard table.
    #[serde(default)]
    pub ordering: Vec<OrderingRule>,

    /// Inline action catalog.
    #[serde(default)]
    pub actions: Vec<ActionSpec>,

    /// YAML file holding a list of action specs (merged after `actions`).
    #[serde(default)]
    pub actions_file: Option<PathBuf>,

    #[serde(default)]
    pub feedback: FeedbackConfig,

    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    #[serde(default)]
    pub backend: BackendConfig,
}

/// Run ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON Lines file the ledger appends to.
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,

    /// Flush every entry to disk before acknowledging it.
    #[serde(default = "default_true")]
    pub fsync: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            fsync: true,
        }
    }
}

/// Outbound feedback events for the learning subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// JSON Lines file receiving events. When unset events are only logged.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Events buffered before new ones are dropped.
    #[serde(default = "default_feedback_capacity")]
    pub capacity: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            path: None,
            capacity: default_feedback_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(".steward/ledger.jsonl")
}

fn default_feedback_capacity() -> usize {
    256
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StewardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Load configuration and resolve all external references.
    ///
    /// This loads:
    /// - Action specs from `actions_file` if specified
    /// - Relative ledger, feedback and findings paths against the config directory
    pub fn load_with_context(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = Self::from_file(path)?;

        let base_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        config.ledger.path = resolve(&base_dir, &config.ledger.path);
        if let Some(feedback) = &config.feedback.path {
            config.feedback.path = Some(resolve(&base_dir, feedback));
        }
        if let Some(findings) = &config.analyzer.findings_file {
            config.analyzer.findings_file = Some(resolve(&base_dir, findings));
        }

        if let Some(actions_file) = &config.actions_file {
            let actions_path = resolve(&base_dir, actions_file);
            if !actions_path.exists() {
                return Err(ConfigError::Config(format!(
                    "actions_file not found: {}",
                    actions_path.display()
                )));
            }
            let content = fs::read_to_string(&actions_path)?;
            let specs: Vec<ActionSpec> = serde_yaml::from_str(&content)?;
            config.actions.extend(specs);
            config.actions_file = Some(actions_path);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that make the control loop meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.concurrency == 0 {
            return Err(ConfigError::Config(
                "executor.concurrency must be at least 1".to_string(),
            ));
        }
        if self.executor.retry.max_attempts == 0 {
            return Err(ConfigError::Config(
                "executor.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.executor.retry.multiplier < 1.0 {
            return Err(ConfigError::Config(
                "executor.retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.executor.retry.jitter) {
            return Err(ConfigError::Config(
                "executor.retry.jitter must be within [0, 1]".to_string(),
            ));
        }
        if self.observer.poll_interval_ms == 0 {
            return Err(ConfigError::Config(
                "observer.poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
