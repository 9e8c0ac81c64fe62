//! Process- and file-backed implementations of the loop's collaborators.
//!
//! # Action command protocol
//! - Parameters are written to stdin as a JSON object.
//! - `STEWARD_ACTION`, `STEWARD_TARGET` and `STEWARD_DRY_RUN` (`1` or `0`)
//!   are set in the environment.
//! - Exit 0: stdout is empty or `{"diff": ..., "output": ...}`.
//! - Exit 75 (`EX_TEMPFAIL`): retryable failure. Anything else is terminal.
//!
//! # Signal command protocol
//! Arguments `<signal> <start> <end>` (RFC 3339) are appended; stdout is a
//! JSON array of `[timestamp, value]` pairs.

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use steward_core::{ActionSpec, BackendConfig, CommandSpec, Finding};
use steward_planner::Analyzer;
use steward_runtime::{
    ActionBackend, ActionOutcome, BackendError, Sample, SignalError, SignalSource, SignalWindow,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit status asking for a retry (sysexits `EX_TEMPFAIL`).
pub const EX_TEMPFAIL: i32 = 75;

/// Relative location of the findings file inside a repository.
pub const DEFAULT_FINDINGS_FILE: &str = ".steward/findings.yaml";

async fn run_command(
    spec: &CommandSpec,
    extra_args: &[&str],
    env: &[(&str, &str)],
    stdin: Option<&[u8]>,
) -> std::io::Result<Output> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .args(extra_args)
        .envs(&spec.env)
        .envs(env.iter().copied())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // A program that ignores its input may exit before reading it.
        match pipe.write_all(input).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e),
        }
        drop(pipe);
    }
    child.wait_with_output().await
}

fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail = stderr.trim().lines().last().unwrap_or_default();
    tail.chars().take(500).collect()
}

fn describe_exit(program: &str, output: &Output) -> String {
    let status = match output.status.code() {
        Some(code) => format!("exited with status {code}"),
        None => "was terminated by a signal".to_string(),
    };
    let tail = stderr_tail(output);
    if tail.is_empty() {
        format!("{program} {status}")
    } else {
        format!("{program} {status}: {tail}")
    }
}

// =============================================================================
// Analyzers
// =============================================================================

/// Reads findings from a YAML or JSON file.
///
/// Without an explicit path the file is looked up inside the repository.
pub struct FindingsFileAnalyzer {
    path: Option<PathBuf>,
}

impl FindingsFileAnalyzer {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    fn path_for(&self, repository: &str) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| Path::new(repository).join(DEFAULT_FINDINGS_FILE))
    }
}

#[async_trait]
impl Analyzer for FindingsFileAnalyzer {
    async fn analyze(&self, repository: &str) -> anyhow::Result<Vec<Finding>> {
        let path = self.path_for(repository);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read findings from {}", path.display()))?;
        // JSON documents are valid YAML.
        let findings: Vec<Finding> = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse findings in {}", path.display()))?;
        Ok(findings)
    }
}

/// Runs a program that prints findings as JSON; the repository reference is
/// its last argument.
pub struct CommandAnalyzer {
    command: CommandSpec,
}

impl CommandAnalyzer {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn analyze(&self, repository: &str) -> anyhow::Result<Vec<Finding>> {
        let output = run_command(&self.command, &[repository], &[], None)
            .await
            .with_context(|| format!("failed to run analyzer {}", self.command.program))?;
        if !output.status.success() {
            bail!("{}", describe_exit(&self.command.program, &output));
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("analyzer {} printed invalid findings", self.command.program))
    }
}

// =============================================================================
// Action backend
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct CommandResult {
    #[serde(default)]
    diff: Option<Value>,
    #[serde(default)]
    output: Value,
}

/// Runs one configured program per action.
pub struct CommandBackend {
    config: BackendConfig,
}

impl CommandBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ActionBackend for CommandBackend {
    async fn execute(
        &self,
        spec: &ActionSpec,
        target: &str,
        params: &Value,
        dry_run: bool,
    ) -> Result<ActionOutcome, BackendError> {
        let command = self.config.command_for(&spec.name).ok_or_else(|| {
            BackendError::Terminal(format!("no backend command for action '{}'", spec.name))
        })?;
        let input = serde_json::to_vec(params)
            .map_err(|e| BackendError::Terminal(format!("unserializable parameters: {e}")))?;

        let env = [
            ("STEWARD_ACTION", spec.name.as_str()),
            ("STEWARD_TARGET", target),
            ("STEWARD_DRY_RUN", if dry_run { "1" } else { "0" }),
        ];
        let output = run_command(command, &[], &env, Some(&input))
            .await
            .map_err(|e| BackendError::Terminal(format!("failed to run {}: {e}", command.program)))?;

        match output.status.code() {
            Some(0) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if stdout.trim().is_empty() {
                    return Ok(ActionOutcome {
                        diff: None,
                        output: Value::Null,
                    });
                }
                let result: CommandResult = serde_json::from_str(&stdout).map_err(|e| {
                    BackendError::Terminal(format!("{} printed invalid JSON: {e}", command.program))
                })?;
                Ok(ActionOutcome {
                    diff: result.diff,
                    output: result.output,
                })
            }
            Some(EX_TEMPFAIL) | None => Err(BackendError::Retryable(describe_exit(
                &command.program,
                &output,
            ))),
            Some(_) => Err(BackendError::Terminal(describe_exit(
                &command.program,
                &output,
            ))),
        }
    }
}

// =============================================================================
// Signal source
// =============================================================================

/// Runs a program per signal query.
pub struct CommandSignalSource {
    command: CommandSpec,
}

impl CommandSignalSource {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl SignalSource for CommandSignalSource {
    async fn query_signal(
        &self,
        name: &str,
        window: SignalWindow,
    ) -> Result<Vec<Sample>, SignalError> {
        let unavailable = |message: String| SignalError::Unavailable {
            signal: name.to_string(),
            message,
        };
        let start = window.start.to_rfc3339();
        let end = window.end.to_rfc3339();
        let output = run_command(&self.command, &[name, start.as_str(), end.as_str()], &[], None)
            .await
            .map_err(|e| unavailable(format!("failed to run {}: {e}", self.command.program)))?;
        if !output.status.success() {
            return Err(unavailable(describe_exit(&self.command.program, &output)));
        }

        let points: Vec<(DateTime<Utc>, f64)> = serde_json::from_slice(&output.stdout)
            .map_err(|e| unavailable(format!("invalid series: {e}")))?;
        Ok(points
            .into_iter()
            .map(|(at, value)| Sample { at, value })
            .collect())
    }
}

/// Signal source for configurations without one: every query is
/// unavailable, so tracked signals fail the outcome.
pub struct UnconfiguredSignals;

#[async_trait]
impl SignalSource for UnconfiguredSignals {
    async fn query_signal(
        &self,
        name: &str,
        _window: SignalWindow,
    ) -> Result<Vec<Sample>, SignalError> {
        Err(SignalError::Unavailable {
            signal: name.to_string(),
            message: "no signal source configured".to_string(),
        })
    }
}
