//! Outbound events for the learning subsystem.
//!
//! Emitting never blocks the control loop: events go through a bounded
//! channel to a background writer, and anything that does not fit, or that
//! the writer fails to persist, is dropped with a warning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    PlanSucceeded,
    PlanDegraded,
    Reobserve,
    Demoted,
    PlanBlocked,
    RolledBack,
    UncompensatedFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub at: DateTime<Utc>,
    pub plan_id: Uuid,
    pub kind: FeedbackKind,
    pub severity: FeedbackSeverity,
    pub message: String,
    #[serde(default)]
    pub detail: Value,
}

impl FeedbackEvent {
    pub fn new(
        plan_id: Uuid,
        kind: FeedbackKind,
        severity: FeedbackSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            at: Utc::now(),
            plan_id,
            kind,
            severity,
            message: message.into(),
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Fire-and-forget event sink.
pub trait FeedbackSink: Send + Sync {
    fn emit(&self, event: FeedbackEvent);
}

/// Logs events instead of shipping them anywhere.
pub struct TracingFeedbackSink;

impl FeedbackSink for TracingFeedbackSink {
    fn emit(&self, event: FeedbackEvent) {
        tracing::info!(
            target: "steward::feedback",
            plan_id = %event.plan_id,
            kind = ?event.kind,
            severity = ?event.severity,
            "{}",
            event.message
        );
    }
}

/// Slow side of a [`ChannelFeedbackSink`].
#[async_trait]
pub trait FeedbackWriter: Send + Sync + 'static {
    async fn write(&self, event: &FeedbackEvent) -> anyhow::Result<()>;
}

/// Bounded channel in front of a [`FeedbackWriter`] running on its own task.
pub struct ChannelFeedbackSink {
    tx: mpsc::Sender<FeedbackEvent>,
}

impl ChannelFeedbackSink {
    /// Start the background writer. The task ends once every sink clone is
    /// dropped and the queue is drained.
    pub fn spawn(writer: impl FeedbackWriter, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<FeedbackEvent>(capacity.max(1));
        let writer = Arc::new(writer);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = writer.write(&event).await {
                    tracing::warn!(
                        plan_id = %event.plan_id,
                        kind = ?event.kind,
                        error = %e,
                        "Dropped feedback event"
                    );
                }
            }
        });
        (Self { tx }, handle)
    }
}

impl FeedbackSink for ChannelFeedbackSink {
    fn emit(&self, event: FeedbackEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let reason = match &e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            let event = e.into_inner();
            tracing::warn!(
                plan_id = %event.plan_id,
                kind = ?event.kind,
                reason,
                "Dropped feedback event"
            );
        }
    }
}

/// Appends events to a JSON Lines file.
pub struct JsonlFeedbackWriter {
    path: PathBuf,
}

impl JsonlFeedbackWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedbackWriter for JsonlFeedbackWriter {
    async fn write(&self, event: &FeedbackEvent) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
