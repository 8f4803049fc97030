//! Library items and collection paths.
//!
//! A LibraryItem is the read-only view of one record in the reference
//! manager. Collection membership is modeled as ordered path segments so
//! the differ can compare it against folder paths in the vault.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::document::sanitize_segment;

/// Sentinel collection for items that belong to no collection
pub const UNCATEGORIZED: &str = "Uncategorized";

/// One item in the external library
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryItem {
    /// Stable unique key (8-char alphanumeric in Zotero)
    pub key: String,

    /// Item title
    pub title: String,

    /// Item type (journalArticle, preprint, conferencePaper)
    #[serde(default)]
    pub item_type: String,

    /// Authors as "Last, First" strings
    #[serde(default)]
    pub authors: Vec<String>,

    /// Collection paths this item belongs to (may be empty)
    #[serde(default)]
    pub collections: Vec<CollectionPath>,

    /// Abstract text, used as fallback when PDF extraction fails
    #[serde(default)]
    pub abstract_text: String,

    /// Publication date as given by the library
    #[serde(default)]
    pub date: String,

    /// Journal or venue title
    #[serde(default)]
    pub publication: String,

    #[serde(default)]
    pub doi: String,

    /// Tags attached in the library
    #[serde(default)]
    pub tags: Vec<String>,

    /// Primary PDF attachment, if any
    #[serde(default)]
    pub attachment: Option<AttachmentRef>,

    /// Rarely used metadata, kept as-is from the library response
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

impl LibraryItem {
    /// Create a minimal item (tests and the local reader fill the rest in)
    pub fn new(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            item_type: String::new(),
            authors: Vec::new(),
            collections: Vec::new(),
            abstract_text: String::new(),
            date: String::new(),
            publication: String::new(),
            doi: String::new(),
            tags: Vec::new(),
            attachment: None,
            extra: HashMap::new(),
        }
    }

    /// Collection paths with the Uncategorized sentinel applied, sorted
    /// so the first entry is the canonical destination for moves.
    pub fn effective_collections(&self) -> Vec<CollectionPath> {
        let mut paths = if self.collections.is_empty() {
            vec![CollectionPath::uncategorized()]
        } else {
            self.collections.clone()
        };
        paths.sort();
        paths.dedup();
        paths
    }

    /// The canonical collection for this item (first in sanitized order)
    pub fn primary_collection(&self) -> CollectionPath {
        self.effective_collections().remove(0)
    }

    /// Whether any collection path matches the filter
    /// (case-insensitive substring over the joined path)
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.effective_collections()
            .iter()
            .any(|p| p.matches_filter(filter))
    }

    /// Four-digit publication year scanned out of the date field
    pub fn year(&self) -> String {
        extract_year(&self.date)
    }

    /// First-three-authors citation line for the rendered note
    pub fn bibliography(&self) -> String {
        let mut names = self.authors.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
        if self.authors.len() > 3 {
            names.push_str("...");
        }
        format!("{}. ({}). {}. {}.", names, self.year(), self.title, self.publication)
    }
}

/// Pointer to a binary attachment stored by the library
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Key of the attachment item (directory name under storage/)
    pub file_key: String,

    /// Stored file name
    pub filename: String,

    /// Library link mode (imported_file, imported_url, linked_file)
    #[serde(default)]
    pub link_mode: String,
}

/// An ordered sequence of collection folder names, e.g. "AI/ML"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionPath(Vec<String>);

impl CollectionPath {
    /// Parse from a slash-joined string
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('/')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    pub fn from_segments(segments: Vec<String>) -> Self {
        Self(segments)
    }

    pub fn uncategorized() -> Self {
        Self(vec![UNCATEGORIZED.to_string()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Slash-joined form for display and filter matching
    pub fn joined(&self) -> String {
        self.0.join("/")
    }

    /// Relative folder path with each segment made filesystem-safe.
    /// This is the form compared against on-disk folders.
    pub fn sanitized(&self) -> std::path::PathBuf {
        self.0.iter().map(|s| sanitize_segment(s)).collect()
    }

    /// Case-insensitive substring match over the joined path
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.joined().to_lowercase().contains(&filter.to_lowercase())
    }
}

/// Paths order by their sanitized segments, the form folder names take
/// on disk; raw segments break ties to stay consistent with equality.
impl Ord for CollectionPath {
    fn cmp(&self, other: &Self) -> Ordering {
        let ours = self.0.iter().map(|s| sanitize_segment(s));
        let theirs = other.0.iter().map(|s| sanitize_segment(s));
        ours.cmp(theirs).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for CollectionPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.joined())
    }
}

/// Scan a free-form date for a plausible four-digit year (19xx/20xx)
pub fn extract_year(date: &str) -> String {
    let bytes = date.as_bytes();
    for (i, window) in bytes.windows(4).enumerate() {
        if !window.iter().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if !(window.starts_with(b"19") || window.starts_with(b"20")) {
            continue;
        }
        // Reject windows embedded in longer digit runs
        let before_ok = i == 0 || !bytes[i - 1].is_ascii_digit();
        let after_ok = i + 4 >= bytes.len() || !bytes[i + 4].is_ascii_digit();
        if before_ok && after_ok {
            return date[i..i + 4].to_string();
        }
    }
    date.to_string()
}
