//! zotsync - Zotero to Markdown sync and summarization
//!
//! Mirrors a Zotero library into a folder of Markdown notes. The vault
//! layout follows the library's collection tree, and each note carries
//! an AI-written summary of the attached PDF.
//!
//! # Architecture
//!
//! Two halves share one plan:
//! - Reconciliation compares the library against the vault and moves or
//!   archives notes so folders match collections. Nothing is deleted;
//!   archived notes land in a dated folder inside the vault.
//! - The batch pipeline takes items without notes through fetch,
//!   extract, summarize, and render on a bounded worker pool, with
//!   checkpoints so an interrupted run resumes where it stopped.
//!
//! # Modules
//!
//! - `adapters`: Zotero access (API and local database), PDF text
//!   extraction, and the summarization service
//! - `core`: the batch pipeline, retry and caching, checkpoints
//! - `sync`: plan computation and reconciliation
//! - `domain`: data structures (LibraryItem, ReconciliationPlan, ...)
//! - `vault`: the Markdown vault on disk
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # See what would change
//! zotsync diff
//!
//! # Reconcile folders, then summarize new items
//! zotsync sync
//!
//! # Continue an interrupted run
//! zotsync run --resume
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod sync;
pub mod vault;

// Re-export main types at crate root for convenience
pub use crate::core::{BatchPipeline, RateLimitedCaller, StageConfig};
pub use crate::domain::{
    ExecutionReport, LibraryItem, ReconciliationPlan, RunSummary, Stage, Summary,
};
pub use crate::sync::{compute_plan, ReconciliationExecutor};
pub use crate::vault::VaultStore;
