//! Command-line collaborators used by the `steward` binary.
//!
//! Library users plug in their own analyzer, action backend and signal
//! source; these settings only matter to the CLI.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// An external program invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Where findings come from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalyzerConfig {
    /// YAML/JSON file with a list of findings. Defaults to
    /// `<repository>/.steward/findings.yaml`.
    #[serde(default)]
    pub findings_file: Option<PathBuf>,

    /// Program printing a JSON list of findings; receives the repository
    /// reference as its last argument. Takes precedence over `findings_file`.
    #[serde(default)]
    pub command: Option<CommandSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendConfig {
    /// Per-action programs, keyed by action name.
    #[serde(default)]
    pub actions: BTreeMap<String, CommandSpec>,

    /// Program used for actions without their own entry.
    #[serde(default)]
    pub default_action: Option<CommandSpec>,

    /// Program answering signal queries.
    #[serde(default)]
    pub signals: Option<CommandSpec>,
}

impl BackendConfig {
    pub fn command_for(&self, action: &str) -> Option<&CommandSpec> {
        self.actions.get(action).or(self.default_action.as_ref())
    }
}
