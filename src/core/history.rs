//! Run history journal.
//!
//! Every reconciliation and batch run appends one JSON line to
//! history.jsonl, so `zotsync status` can show recent activity without
//! a database. Replay tolerates corrupt lines; a half-written entry
//! should not hide the rest of the history.

use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::domain::{ExecutionReport, RunSummary};

/// One journaled run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    Reconciliation {
        at: DateTime<Utc>,
        report: ExecutionReport,
    },
    PipelineRun {
        at: DateTime<Utc>,
        summary: RunSummary,
    },
}

impl HistoryEntry {
    pub fn reconciliation(report: ExecutionReport) -> Self {
        Self::Reconciliation {
            at: Utc::now(),
            report,
        }
    }

    pub fn pipeline_run(summary: RunSummary) -> Self {
        Self::PipelineRun {
            at: Utc::now(),
            summary,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Reconciliation { at, .. } | Self::PipelineRun { at, .. } => *at,
        }
    }
}

/// Append one entry under an exclusive lock
pub fn append_history(path: &Path, entry: &HistoryEntry) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string(entry).context("Failed to serialize history entry")?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    file.lock_exclusive().context("Failed to lock history")?;

    writeln!(file, "{}", json).context("Failed to append history entry")?;
    file.flush().context("Failed to flush history")?;

    Ok(())
    // Lock is released when file is dropped
}

/// All entries in file order; corrupt lines are skipped with a warning
pub async fn read_history(path: &Path) -> Result<Vec<HistoryEntry>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to open {}", path.display())),
    };

    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut entries = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(error = %e, "Skipping corrupt history line"),
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");

        assert!(read_history(&path).await.unwrap().is_empty());

        append_history(&path, &HistoryEntry::reconciliation(ExecutionReport::new(false)))
            .unwrap();
        append_history(&path, &HistoryEntry::pipeline_run(RunSummary::new())).unwrap();

        let entries = read_history(&path).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], HistoryEntry::Reconciliation { .. }));
        assert!(matches!(entries[1], HistoryEntry::PipelineRun { .. }));
        assert!(entries[0].at() <= entries[1].at());
    }

    #[tokio::test]
    async fn test_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");

        append_history(&path, &HistoryEntry::pipeline_run(RunSummary::new())).unwrap();
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{half a line").unwrap();
        }
        append_history(&path, &HistoryEntry::pipeline_run(RunSummary::new())).unwrap();

        let entries = read_history(&path).await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}
