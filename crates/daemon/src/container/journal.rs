//! Append-only record of container runs.
//!
//! Each start and stop is written as one JSON object per line to
//! `<data_dir>/runs.jsonl`, which gives operators a history of what ran and
//! for how long without needing a database.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{ContainerFuture, LifecycleHooks};

/// File name of the journal inside the data directory.
pub const JOURNAL_FILE: &str = "runs.jsonl";

/// What happened to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    Started,
    Ended,
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub container_id: String,
    pub event: RunEvent,
    /// Milliseconds since the Unix epoch.
    pub at_ms: u64,
}

impl RunRecord {
    fn now(container_id: &str, event: RunEvent) -> Self {
        let at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            container_id: container_id.to_string(),
            event,
            at_ms,
        }
    }
}

/// Lifecycle hooks that append run records to a JSONL file.
pub struct RunJournal {
    path: PathBuf,
    // Serializes appends so lines never interleave.
    write_lock: Mutex<()>,
}

impl RunJournal {
    /// Creates a journal writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Creates a journal at the default location inside `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(JOURNAL_FILE))
    }

    /// Returns the journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record.
    pub async fn append(&self, record: &RunRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open journal {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Reads every record in the journal. A missing file reads as empty.
    pub async fn read_all(&self) -> anyhow::Result<Vec<RunRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Malformed journal line {}", n + 1))
            })
            .collect()
    }

    async fn record(&self, container_id: &str, event: RunEvent) -> anyhow::Result<()> {
        self.append(&RunRecord::now(container_id, event)).await?;
        tracing::debug!(container_id = %container_id, event = ?event, "Run recorded");
        Ok(())
    }
}

impl LifecycleHooks for RunJournal {
    fn on_start<'a>(&'a self, container_id: &'a str) -> ContainerFuture<'a, anyhow::Result<()>> {
        Box::pin(self.record(container_id, RunEvent::Started))
    }

    fn on_stop<'a>(&'a self, container_id: &'a str) -> ContainerFuture<'a, anyhow::Result<()>> {
        Box::pin(self.record(container_id, RunEvent::Ended))
    }
}
