//! Batch run state that survives interruption.
//!
//! Two files under the zotsync home:
//! - checkpoint.json: snapshot of an in-progress run, rewritten
//!   atomically via tmp+rename
//! - done.txt: append-only list of keys that have ever completed,
//!   written under an exclusive lock

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

/// Snapshot of one batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Keys whose processing finished this run, success or failure
    #[serde(default)]
    pub processed_keys: HashSet<String>,

    /// Keys still queued when the run stopped
    #[serde(default)]
    pub pending_queue: Vec<String>,

    /// Collection filter the run was started with
    #[serde(default)]
    pub collection: Option<String>,

    #[serde(default)]
    pub succeeded: usize,

    #[serde(default)]
    pub failed: usize,

    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(collection: Option<String>) -> Self {
        Self {
            processed_keys: HashSet::new(),
            pending_queue: Vec::new(),
            collection,
            succeeded: 0,
            failed: 0,
            updated_at: Utc::now(),
        }
    }

    /// Load a checkpoint. Missing and corrupt files both mean a fresh
    /// start; corrupt ones are logged first.
    pub async fn load(path: &Path) -> Option<Self> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read checkpoint");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt checkpoint ignored");
                None
            }
        }
    }

    /// Persist atomically so a crash mid-write cannot corrupt the file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, raw)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    pub async fn clear(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove checkpoint {}", path.display()))
            }
        }
    }

    /// Mark one key processed, keeping the counters consistent
    pub fn record(&mut self, key: &str, succeeded: bool) {
        if self.processed_keys.insert(key.to_string()) {
            if succeeded {
                self.succeeded += 1;
            } else {
                self.failed += 1;
            }
        }
        self.updated_at = Utc::now();
    }
}

/// Keys that have completed the pipeline, one per line
pub struct DoneRecord {
    path: PathBuf,
    keys: HashSet<String>,
}

impl DoneRecord {
    /// Load the record; a missing file is an empty record
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let keys = match fs::read_to_string(&path).await {
            Ok(raw) => raw
                .lines()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect(),
            Err(e) if e.kind() == ErrorKind::NotFound => HashSet::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        Ok(Self { path, keys })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Append a key; returns false when it was already recorded
    pub fn mark_done(&mut self, key: &str) -> Result<bool> {
        if self.keys.contains(key) {
            return Ok(false);
        }
        append_line(&self.path, key)?;
        self.keys.insert(key.to_string());
        Ok(true)
    }

    /// Forget keys so they process again. Rewrites the file through a
    /// temp file; the append log stays clean of tombstones.
    pub async fn remove(&mut self, keys: &[String]) -> Result<()> {
        let before = self.keys.len();
        for key in keys {
            self.keys.remove(key);
        }
        if self.keys.len() == before {
            return Ok(());
        }

        let mut sorted: Vec<String> = self.keys.iter().cloned().collect();
        sorted.sort();
        let mut contents = sorted.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }

        let tmp = self.path.with_extension("txt.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Exclusive-locked append so concurrent runs cannot interleave lines
fn append_line(path: &Path, line: &str) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    file.lock_exclusive()
        .context("Failed to lock done record")?;

    writeln!(file, "{}", line).context("Failed to append to done record")?;
    file.flush().context("Failed to flush done record")?;

    Ok(())
    // Lock is released when file is dropped
}
