//! Note rendering and placement.
//!
//! Renders one Markdown note per library item (YAML frontmatter with the
//! embedded key, Zotero links, bibliography, summary sections) and writes
//! it under the item's sanitized collection folder.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::fs;

use crate::domain::{note_file_name, LibraryItem, Summary};

use super::store::VaultStore;

/// Per-note inputs beyond the item and summary
#[derive(Debug, Clone, Default)]
pub struct NoteContext {
    /// Link target for the source PDF (a `file://` URL into library storage)
    pub pdf_link: Option<String>,

    /// Library user id for the web-library link
    pub user_id: Option<String>,

    /// Set when extraction failed and the abstract was summarized instead
    pub degraded: bool,
}

/// Render the full Markdown note for one item
pub fn render_note(item: &LibraryItem, summary: &Summary, ctx: &NoteContext) -> String {
    let mut note = String::with_capacity(2048);

    // Frontmatter
    note.push_str("---\n");
    note.push_str(&format!("title: \"{}\"\n", yaml_escape(&item.title)));
    if !item.authors.is_empty() {
        note.push_str("authors:\n");
        for author in &item.authors {
            note.push_str(&format!("  - \"{}\"\n", yaml_escape(author)));
        }
    }
    let year = item.year();
    if !year.is_empty() {
        note.push_str(&format!("year: {}\n", year));
    }
    note.push_str(&format!("zotero_key: {}\n", item.key));
    note.push_str(&format!("item_type: {}\n", item.item_type));
    if !item.publication.is_empty() {
        note.push_str(&format!("publication: \"{}\"\n", yaml_escape(&item.publication)));
    }
    if !item.doi.is_empty() {
        note.push_str(&format!("doi: {}\n", item.doi));
    }
    let tags = merged_tags(item, summary);
    if !tags.is_empty() {
        note.push_str("tags:\n");
        for tag in &tags {
            note.push_str(&format!("  - {}\n", tag.replace(' ', "-")));
        }
    }
    note.push_str(&format!("created: {}\n", Utc::now().format("%Y-%m-%d")));
    note.push_str("---\n\n");

    // Header and links
    note.push_str(&format!("# {}\n\n", item.title));
    note.push_str(&format!("[Open in Zotero](zotero://select/items/0_{})", item.key));
    if let Some(user_id) = &ctx.user_id {
        note.push_str(&format!(
            " | [Web Library](https://www.zotero.org/users/{}/items/{})",
            user_id, item.key
        ));
    }
    note.push('\n');
    if let Some(pdf) = &ctx.pdf_link {
        note.push_str(&format!("\n**PDF:** [{}]({})\n", item.title, pdf));
    }
    note.push('\n');

    note.push_str("## Bibliography\n\n");
    note.push_str(&item.bibliography());
    note.push_str("\n\n");

    if !item.abstract_text.trim().is_empty() {
        note.push_str("## Abstract\n\n");
        note.push_str(item.abstract_text.trim());
        note.push_str("\n\n");
    }

    note.push_str("## Summary\n\n");
    if ctx.degraded {
        note.push_str("⚠️ PDF extraction failed, summarized from the abstract only.\n\n");
    }
    note.push_str(summary.short_summary.trim());
    note.push_str("\n\n");

    note.push_str("## Detailed Notes\n\n");
    note.push_str(summary.long_summary.trim());
    note.push_str("\n\n");

    push_optional_section(&mut note, "Key Contributions", &summary.contributions);
    push_optional_section(&mut note, "Limitations", &summary.limitations);
    push_optional_section(&mut note, "Ideas", &summary.ideas);

    note
}

fn push_optional_section(note: &mut String, heading: &str, body: &str) {
    if !body.trim().is_empty() {
        note.push_str(&format!("## {}\n\n", heading));
        note.push_str(body.trim());
        note.push_str("\n\n");
    }
}

/// Item tags first, then summary keywords not already present
fn merged_tags(item: &LibraryItem, summary: &Summary) -> Vec<String> {
    let mut tags = item.tags.clone();
    for keyword in &summary.keywords {
        if !tags.iter().any(|t| t.eq_ignore_ascii_case(keyword)) {
            tags.push(keyword.clone());
        }
    }
    tags
}

fn yaml_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Write a rendered note into the vault under the item's primary
/// collection folder. Returns the absolute path written.
pub async fn write_note(store: &VaultStore, item: &LibraryItem, content: &str) -> Result<PathBuf> {
    let folder = store.root().join(item.primary_collection().sanitized());
    fs::create_dir_all(&folder)
        .await
        .with_context(|| format!("Failed to create note folder: {}", folder.display()))?;

    let path = folder.join(note_file_name(&item.title, &item.key));
    fs::write(&path, content)
        .await
        .with_context(|| format!("Failed to write note: {}", path.display()))?;

    Ok(path)
}
