use std::path::{Path, PathBuf};

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One line of the per-run events file consumed by the metrics collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRecord {
    pub trace_id: Uuid,
    pub task_id: Uuid,
    /// Pid of the external process; absent if it never started.
    pub pid: Option<u32>,
    pub node: String,
    pub profile: String,
    pub input: Option<String>,
    pub output: Option<String>,
    pub cpuset: Option<String>,
    pub binding: String,
    pub cpu_units: u32,
    pub ts_enqueue: i64,
    pub ts_dispatch: i64,
    pub ts_start: i64,
    pub ts_end: i64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub status: i32,
}

/// Append-only JSONL sink. Lines are written whole under a lock.
#[derive(Debug)]
pub struct EventSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &CompletionRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open events file {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
