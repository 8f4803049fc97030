//! Structured summarization output attached to a rendered note.

use serde::{Deserialize, Serialize};

/// Sections returned by the summarization service for one item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// One-paragraph overview
    #[serde(default)]
    pub short_summary: String,

    /// Multi-paragraph detailed notes
    #[serde(default)]
    pub long_summary: String,

    /// Main contributions of the work
    #[serde(default)]
    pub contributions: String,

    /// Stated or apparent limitations
    #[serde(default)]
    pub limitations: String,

    /// Follow-up ideas and open directions
    #[serde(default)]
    pub ideas: String,

    /// Topic keywords for note tagging
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Summary {
    /// Placeholder used when summarization is skipped or no usable text
    /// exists. Keywords fall back to the item's own tags.
    pub fn unavailable(tags: &[String]) -> Self {
        let placeholder = "No text available for summarization.".to_string();
        Self {
            short_summary: placeholder.clone(),
            long_summary: placeholder,
            keywords: tags.to_vec(),
            ..Default::default()
        }
    }

    /// True when the service produced at least the two required summaries
    pub fn is_complete(&self) -> bool {
        !self.short_summary.trim().is_empty() && !self.long_summary.trim().is_empty()
    }
}
