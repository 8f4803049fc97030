//! Domain types for zotsync.
//!
//! This module contains the core data structures:
//! - LibraryItem / CollectionPath: the read-only library side
//! - LocalDocument: the vault side
//! - ReconciliationPlan: the computed difference between the two
//! - ExecutionReport / RunSummary: outcome records

pub mod document;
pub mod item;
pub mod plan;
pub mod report;
pub mod summary;

// Re-export commonly used types
pub use document::{
    key_from_file_name, key_from_frontmatter, note_file_name, sanitize_segment, sanitize_title,
    LocalDocument,
};
pub use item::{AttachmentRef, CollectionPath, LibraryItem, UNCATEGORIZED};
pub use plan::{PlannedMove, ReconciliationPlan};
pub use report::{
    ExecutionReport, ItemFailure, OperationKind, OperationOutcome, OperationRecord, RunSummary,
    Stage,
};
pub use summary::Summary;
