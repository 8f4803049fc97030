//! The reconciliation plan computed by the differ.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::document::LocalDocument;

/// Immutable diff between library and vault state, produced once per run.
/// Keys never appear in more than one of the three sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    /// Items in the library with no matching document (pipeline work)
    pub added: Vec<String>,

    /// Documents whose key is gone from the library (to archive)
    pub deleted: Vec<LocalDocument>,

    /// Documents sitting under a folder that matches none of their
    /// item's current collections (to relocate)
    pub moved: Vec<PlannedMove>,

    /// Documents sharing a key with an earlier document (conflicts,
    /// reported but never acted on)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duplicates: Vec<LocalDocument>,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.moved.is_empty()
    }

    /// Total number of planned filesystem operations
    pub fn operation_count(&self) -> usize {
        self.deleted.len() + self.moved.len()
    }
}

/// One planned relocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedMove {
    /// The document as currently on disk
    pub document: LocalDocument,

    /// Destination folder relative to the vault root (sanitized)
    pub to: PathBuf,
}

impl PlannedMove {
    pub fn key(&self) -> &str {
        &self.document.key
    }
}
