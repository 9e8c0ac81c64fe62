//! Ledger storage backends.

use crate::entry::{self, LedgerEntry};
use crate::error::LedgerError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::io::AsyncWriteExt;

/// Trait for ledger storage backends.
///
/// Appends are issued by a single writer (see [`crate::RunLedger`]); a
/// backend only has to make each append durable before returning.
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Persist one entry at the end of the ledger.
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError>;

    /// Read every entry in sequence order.
    async fn load(&self) -> Result<Vec<LedgerEntry>, LedgerError>;
}

/// JSON Lines file storage.
pub struct FileStorage {
    path: PathBuf,
    fsync: bool,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            path: path.into(),
            fsync,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LedgerStorage for FileStorage {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let line = entry::encode(entry)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        if self.fsync {
            file.sync_data().await?;
        } else {
            file.flush().await?;
        }
        Ok(())
    }

    async fn load(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let decoded = entry::decode(&content)?;
        if let Some(offset) = decoded.torn_tail {
            // Drop the partial line so the next append starts on a fresh one.
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&self.path)
                .await?;
            file.set_len(offset as u64).await?;
            file.sync_all().await?;
            tracing::warn!(
                path = %self.path.display(),
                offset,
                "Truncated incomplete trailing ledger entry"
            );
        }
        Ok(decoded.entries)
    }
}

/// In-memory storage, for tests and plan-only runs.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<LedgerEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

#[async_trait]
impl LedgerStorage for MemoryStorage {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut entries = self.entries.write().map_err(|e| {
            LedgerError::Io(std::io::Error::other(format!(
                "Failed to acquire write lock: {}",
                e
            )))
        })?;
        entries.push(entry.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let entries = self.entries.read().map_err(|e| {
            LedgerError::Io(std::io::Error::other(format!(
                "Failed to acquire read lock: {}",
                e
            )))
        })?;
        Ok(entries.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LedgerRecord;
    use chrono::Utc;
    use steward_core::RunStatus;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn closed(seq: u64) -> LedgerEntry {
        LedgerEntry {
            seq,
            at: Utc::now(),
            plan_id: Uuid::nil(),
            record: LedgerRecord::PlanClosed {
                status: RunStatus::Succeeded,
                reason: "done".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn file_storage_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("nested/ledger.jsonl"), true);

        assert!(storage.load().await.unwrap().is_empty());
        storage.append(&closed(1)).await.unwrap();
        storage.append(&closed(2)).await.unwrap();

        let entries = storage.load().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].seq, 2);
    }

    #[tokio::test]
    async fn torn_tail_is_truncated_before_next_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let storage = FileStorage::new(&path, false);
        storage.append(&closed(1)).await.unwrap();

        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"seq\":2,\"at\":");
        std::fs::write(&path, &content).unwrap();

        assert_eq!(storage.load().await.unwrap().len(), 1);
        storage.append(&closed(2)).await.unwrap();

        let entries = storage.load().await.unwrap();
        assert_eq!(entries.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
    }
}
