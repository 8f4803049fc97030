//! Plan application: moves, archives, and the backup-then-mutate rule.
//!
//! Documents are never deleted; removed items go to a date-partitioned
//! archive under the vault. Every operation re-checks the current state
//! first, so re-applying a plan after an interruption converges instead
//! of duplicating work.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::domain::{
    ExecutionReport, LocalDocument, OperationKind, OperationOutcome, OperationRecord, PlannedMove,
    ReconciliationPlan,
};
use crate::vault::VaultStore;

use super::backup::snapshot_vault;

/// Options for one apply call
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Report operations without touching the filesystem
    pub dry_run: bool,

    /// Snapshot the vault before mutating (ignored for dry runs)
    pub backup: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            backup: true,
        }
    }
}

/// Applies reconciliation plans against one vault
pub struct ReconciliationExecutor {
    store: VaultStore,
    backups_dir: PathBuf,
}

impl ReconciliationExecutor {
    pub fn new(store: VaultStore, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            backups_dir: backups_dir.into(),
        }
    }

    /// Apply a plan. Backup failure aborts before any mutation;
    /// individual operation failures are recorded and do not stop the
    /// remaining operations.
    #[instrument(skip(self, plan, options), fields(
        moves = plan.moved.len(),
        archives = plan.deleted.len(),
        dry_run = options.dry_run,
    ))]
    pub async fn apply(
        &self,
        plan: &ReconciliationPlan,
        options: &ApplyOptions,
    ) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::new(options.dry_run);
        report.pending = plan.added.clone();

        if plan.operation_count() == 0 {
            return Ok(report);
        }

        let partition = self.store.archive_partition(Local::now().date_naive());

        if options.dry_run {
            for planned in &plan.moved {
                report.operations.push(record_move(planned, OperationOutcome::Planned));
            }
            for document in &plan.deleted {
                report
                    .operations
                    .push(record_archive(document, &partition, OperationOutcome::Planned));
            }
            return Ok(report);
        }

        if options.backup {
            let path = snapshot_vault(self.store.root(), &self.backups_dir)
                .await
                .context("Vault backup failed, aborting before any changes")?;
            report.backup = Some(path);
        }

        for planned in &plan.moved {
            let outcome = self.apply_move(planned).await;
            if let OperationOutcome::Failed { reason } = &outcome {
                warn!(key = planned.key(), reason = %reason, "Move failed");
            }
            report.operations.push(record_move(planned, outcome));
        }

        for document in &plan.deleted {
            let outcome = self.apply_archive(document, &partition).await;
            if let OperationOutcome::Failed { reason } = &outcome {
                warn!(key = %document.key, reason = %reason, "Archive failed");
            }
            report
                .operations
                .push(record_archive(document, &partition, outcome));
        }

        report.removed_dirs = self.store.remove_empty_dirs()?;

        info!(
            applied = report.applied_count(),
            failed = report.failure_count(),
            removed_dirs = report.removed_dirs.len(),
            "Plan applied"
        );
        Ok(report)
    }

    async fn apply_move(&self, planned: &PlannedMove) -> OperationOutcome {
        let source = self.store.absolute(&planned.document.relative_path());
        let destination = self
            .store
            .absolute(&planned.to.join(&planned.document.file_name));
        relocate(&source, &destination).await
    }

    async fn apply_archive(&self, document: &LocalDocument, partition: &Path) -> OperationOutcome {
        let source = self.store.absolute(&document.relative_path());
        let destination = partition.join(document.relative_path());
        relocate(&source, &destination).await
    }

}

fn record_move(planned: &PlannedMove, outcome: OperationOutcome) -> OperationRecord {
    OperationRecord {
        key: planned.key().to_string(),
        kind: OperationKind::Move,
        from: planned.document.relative_path(),
        to: planned.to.join(&planned.document.file_name),
        outcome,
    }
}

fn record_archive(
    document: &LocalDocument,
    partition: &Path,
    outcome: OperationOutcome,
) -> OperationRecord {
    OperationRecord {
        key: document.key.clone(),
        kind: OperationKind::Archive,
        from: document.relative_path(),
        to: partition.join(document.relative_path()),
        outcome,
    }
}

/// Move one file, re-checking both ends first.
///
/// Source gone with the destination in place means a previous apply
/// already did this. A destination occupied while the source still
/// exists is a conflict; the existing file is preserved.
async fn relocate(source: &Path, destination: &Path) -> OperationOutcome {
    let source_exists = source.exists();
    let destination_exists = destination.exists();

    if !source_exists {
        return if destination_exists {
            OperationOutcome::AlreadyApplied
        } else {
            OperationOutcome::Failed {
                reason: format!("source file missing: {}", source.display()),
            }
        };
    }

    if destination_exists {
        return OperationOutcome::Failed {
            reason: format!("destination already occupied: {}", destination.display()),
        };
    }

    if let Some(parent) = destination.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            return OperationOutcome::Failed {
                reason: format!("failed to create {}: {}", parent.display(), e),
            };
        }
    }

    match fs::rename(source, destination).await {
        Ok(()) => OperationOutcome::Applied,
        Err(e) => OperationOutcome::Failed {
            reason: e.to_string(),
        },
    }
}
