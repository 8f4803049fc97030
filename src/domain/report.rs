//! Outcome records for plan application and pipeline runs.
//!
//! Both are serializable so they can be appended to the history log and
//! inspected after the fact.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of applying a reconciliation plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// True when no filesystem mutation happened
    pub dry_run: bool,

    /// Snapshot archive created before mutation, if any
    pub backup: Option<PathBuf>,

    /// One record per planned move/archive
    pub operations: Vec<OperationRecord>,

    /// Added keys carried through for the pipeline; this executor never
    /// creates documents
    pub pending: Vec<String>,

    /// Folders removed by the empty-directory sweep
    pub removed_dirs: Vec<PathBuf>,
}

impl ExecutionReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            backup: None,
            operations: Vec::new(),
            pending: Vec::new(),
            removed_dirs: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op.outcome, OperationOutcome::Failed { .. }))
    }

    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|op| op.kind == kind).count()
    }

    pub fn applied_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op.outcome, OperationOutcome::Applied))
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op.outcome, OperationOutcome::Failed { .. }))
            .count()
    }
}

/// A single move or archive operation with its outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub key: String,
    pub kind: OperationKind,
    /// Source path relative to the vault root
    pub from: PathBuf,
    /// Destination path relative to the vault root
    pub to: PathBuf,
    pub outcome: OperationOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Move,
    Archive,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Move => write!(f, "move"),
            OperationKind::Archive => write!(f, "archive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    /// Listed only; dry run
    Planned,
    /// Performed this apply
    Applied,
    /// Found already in the target state, nothing to do
    AlreadyApplied,
    /// Left untouched; reason recorded
    Failed { reason: String },
}

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Fetching,
    Extracting,
    Summarizing,
    Rendering,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Fetching => write!(f, "Fetching"),
            Stage::Extracting => write!(f, "Extracting"),
            Stage::Summarizing => write!(f, "Summarizing"),
            Stage::Rendering => write!(f, "Rendering"),
        }
    }
}

/// A failed item with the stage it failed in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemFailure {
    pub key: String,
    pub stage: Stage,
    pub reason: String,
}

/// Result of one batch pipeline invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Items that reached Done this run
    pub succeeded: usize,

    /// Items that ended in a terminal failure
    pub failed: Vec<ItemFailure>,

    /// Candidates skipped before processing (already done or over limit)
    pub skipped: usize,

    /// True when the run exited through draining instead of finishing
    /// the queue
    pub drained: bool,
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            succeeded: 0,
            failed: Vec::new(),
            skipped: 0,
            drained: false,
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.failed.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_failure_detection() {
        let mut report = ExecutionReport::new(false);
        assert!(!report.has_failures());

        report.operations.push(OperationRecord {
            key: "AAAA1111".to_string(),
            kind: OperationKind::Move,
            from: PathBuf::from("X/Y/a.md"),
            to: PathBuf::from("X/Z/a.md"),
            outcome: OperationOutcome::Applied,
        });
        assert!(!report.has_failures());

        report.operations.push(OperationRecord {
            key: "BBBB2222".to_string(),
            kind: OperationKind::Archive,
            from: PathBuf::from("Old/b.md"),
            to: PathBuf::from("_archived/20240101/Old/b.md"),
            outcome: OperationOutcome::Failed {
                reason: "destination occupied".to_string(),
            },
        });
        assert!(report.has_failures());
        assert_eq!(report.failure_count(), 1);
        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.count(OperationKind::Move), 1);
    }

    #[test]
    fn test_stage_display_names() {
        assert_eq!(Stage::Summarizing.to_string(), "Summarizing");
        assert_eq!(Stage::Fetching.to_string(), "Fetching");
    }

    #[test]
    fn test_run_summary_counts() {
        let mut summary = RunSummary::new();
        summary.succeeded = 3;
        summary.failed.push(ItemFailure {
            key: "AAAA1111".to_string(),
            stage: Stage::Summarizing,
            reason: "retries-exhausted".to_string(),
        });
        assert_eq!(summary.processed(), 4);
        assert!(summary.has_failures());
    }
}
