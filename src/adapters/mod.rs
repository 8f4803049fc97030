//! Adapters for external collaborators.
//!
//! The library side (Zotero web API or the local Zotero database), PDF
//! text extraction, and the summarization service all sit behind traits
//! so the pipeline can be driven against fakes in tests.

pub mod extractor;
pub mod local_db;
pub mod summarizer;
pub mod zotero;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{AttachmentRef, LibraryItem, Summary, UNCATEGORIZED};

pub use extractor::PdftotextExtractor;
pub use local_db::LocalLibrary;
pub use summarizer::{OpenAiSummarizer, SummarizeRequest};
pub use zotero::{ensure_attachment, ZoteroClient};

/// Item types the sync covers. Attachments, notes, and everything else
/// in the library are ignored.
pub const SYNCED_ITEM_TYPES: [&str; 3] = ["journalArticle", "preprint", "conferencePaper"];

/// External-call failures, grouped by how the caller should react
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Service asked us to slow down; retry with exponential backoff
    #[error("rate limited")]
    RateLimited,

    /// Timeout, connection failure, or server-side error; retry after a
    /// short fixed delay
    #[error("transient: {0}")]
    Transient(String),

    /// Malformed request or bad credentials; retrying cannot help
    #[error("non-retryable: {0}")]
    NonRetryable(String),

    /// The retry budget ran out
    #[error("retries-exhausted")]
    RetriesExhausted,
}

impl CallError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::RateLimited | CallError::Transient(_))
    }
}

/// Result of one text extraction
#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,

    /// Fraction of plausibility checks the text passed. Anything below
    /// 1.0 means the text looks corrupted and callers should fall back
    /// to the abstract.
    pub confidence: f64,
}

impl Extraction {
    pub fn usable(&self) -> bool {
        self.confidence >= 1.0 && !self.text.trim().is_empty()
    }
}

/// Text extraction boundary
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Extract text from a PDF on disk
    async fn extract(&self, pdf_path: &Path) -> Result<Extraction>;
}

/// Summarization boundary. One attempt per call; retry, backoff, and
/// caching live in the rate-limited caller.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    async fn summarize(&self, request: &SummarizeRequest) -> Result<Summary, CallError>;
}

/// Read side of the library
#[async_trait]
pub trait LibrarySource: Send + Sync {
    /// Human-readable source name
    fn name(&self) -> &str;

    /// All items of the supported types. A collection filter is
    /// validated against the source but never narrows the listing;
    /// the differ needs every live item to tell deletions apart from
    /// items categorized outside the filter.
    async fn list_items(&self, collection_filter: Option<&str>) -> Result<Vec<LibraryItem>>;

    /// Collection paths with item counts, sorted by path
    async fn list_collections(&self) -> Result<Vec<(String, usize)>>;

    /// The PDF attachment for one item, if it has one
    async fn attachment(&self, item_key: &str) -> Result<Option<AttachmentRef>>;
}

/// Fail fast when a collection filter matches neither a collection path
/// nor any item. Proceeding with an unmatched filter would hand the
/// differ an effectively empty library and schedule every note for
/// archival.
pub(crate) fn validate_collection_filter(
    filter: &str,
    collection_paths: &[String],
    items: &[LibraryItem],
) -> Result<()> {
    let needle = filter.to_lowercase();
    let in_paths = collection_paths
        .iter()
        .any(|path| path.to_lowercase().contains(&needle));
    let in_items = items.iter().any(|item| item.matches_filter(filter));
    if in_paths || in_items {
        return Ok(());
    }

    let mut available = collection_paths.to_vec();
    available.sort();
    available.dedup();
    anyhow::bail!(
        "No collection matches '{}'. Available: {}",
        filter,
        available.join(", ")
    )
}

/// Count items per collection path. Paths without items stay listed at
/// zero; uncategorized items add a sentinel row.
pub(crate) fn tally_collections(
    all_paths: impl IntoIterator<Item = String>,
    items: &[LibraryItem],
) -> Vec<(String, usize)> {
    let mut counts: std::collections::BTreeMap<String, usize> =
        all_paths.into_iter().map(|p| (p, 0)).collect();

    for item in items {
        for path in item.effective_collections() {
            *counts.entry(path.joined()).or_insert(0) += 1;
        }
    }

    // Drop the sentinel when nothing is uncategorized
    if counts.get(UNCATEGORIZED) == Some(&0) {
        counts.remove(UNCATEGORIZED);
    }

    counts.into_iter().collect()
}
