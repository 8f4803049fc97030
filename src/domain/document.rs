//! Local generated documents and vault naming rules.
//!
//! Notes live at `<vault>/<collection folders>/<title>_<KEY>.md`. The key
//! embedded in the filename ties a document back to its library item; the
//! folder path mirrors one sanitized collection path.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Maximum length of the title portion of a note filename
pub const MAX_TITLE_LEN: usize = 100;

/// One note on disk, identified by its embedded library key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDocument {
    /// Library item key parsed from the filename or frontmatter
    pub key: String,

    /// File name including the `.md` extension
    pub file_name: String,

    /// Folder path relative to the vault root (empty for the root)
    pub folder: PathBuf,
}

impl LocalDocument {
    pub fn new(key: impl Into<String>, file_name: impl Into<String>, folder: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            file_name: file_name.into(),
            folder: folder.into(),
        }
    }

    /// Path relative to the vault root
    pub fn relative_path(&self) -> PathBuf {
        self.folder.join(&self.file_name)
    }

    /// Slash-joined folder for filter matching and display
    pub fn folder_joined(&self) -> String {
        self.folder
            .iter()
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Case-insensitive substring match over the folder path
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.folder_joined().to_lowercase().contains(&filter.to_lowercase())
    }
}

/// Make one folder segment filesystem-safe: path separators and colons
/// become `-`, shell-hostile characters are dropped, whitespace trimmed.
pub fn sanitize_segment(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            '/' | '\\' | ':' => Some('-'),
            '*' | '?' | '"' | '<' | '>' | '|' => None,
            c => Some(c),
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Reduce a title to the filename-safe form used in note names:
/// alphanumeric plus space, dash, underscore, capped at 100 characters.
pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '-' || *c == '_')
        .take(MAX_TITLE_LEN)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Build the note file name for an item: `<title>_<KEY>.md`
pub fn note_file_name(title: &str, key: &str) -> String {
    format!("{}_{}.md", sanitize_title(title), key)
}

/// Whether a string has the shape of a library key (8 alphanumeric,
/// uppercase letters and digits only)
pub fn is_item_key(candidate: &str) -> bool {
    candidate.len() == 8
        && candidate
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Parse the embedded key out of a note file name. The key is the final
/// `_`-separated segment of the stem.
pub fn key_from_file_name(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(".md")?;
    let (_, candidate) = stem.rsplit_once('_')?;
    if is_item_key(candidate) {
        Some(candidate.to_string())
    } else {
        None
    }
}

/// Scan YAML frontmatter for a `zotero_key:` field. Fallback for notes
/// whose filename does not carry a parseable key.
pub fn key_from_frontmatter(content: &str) -> Option<String> {
    let mut lines = content.lines();
    if lines.next()?.trim() != "---" {
        return None;
    }
    for line in lines {
        let trimmed = line.trim();
        if trimmed == "---" {
            break;
        }
        if let Some(value) = trimmed.strip_prefix("zotero_key:") {
            let candidate = value.trim().trim_matches('"');
            if is_item_key(candidate) {
                return Some(candidate.to_string());
            }
        }
    }
    None
}

/// Folder names excluded from scanning, archiving, and empty-dir cleanup
pub fn is_reserved_folder(name: &str) -> bool {
    name == "img" || name == "_archived"
}

/// Whether any component of a relative path is reserved
pub fn path_has_reserved_folder(path: &Path) -> bool {
    path.iter()
        .filter_map(|s| s.to_str())
        .any(is_reserved_folder)
}
