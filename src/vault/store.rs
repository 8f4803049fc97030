//! Vault scanning and tree maintenance.
//!
//! The store enumerates managed notes (files carrying a library key),
//! leaving `img/` and `_archived/` alone. Scans are read-only; mutation
//! of the tree belongs to the reconciliation executor and note writer.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::domain::document::{is_reserved_folder, path_has_reserved_folder};
use crate::domain::{key_from_file_name, key_from_frontmatter, LocalDocument};

/// Folder under the vault root receiving archived notes
pub const ARCHIVE_FOLDER: &str = "_archived";

/// Handle to an on-disk vault
#[derive(Debug, Clone)]
pub struct VaultStore {
    root: PathBuf,
}

/// Result of one vault scan
#[derive(Debug, Default)]
pub struct VaultScan {
    /// One document per key, sorted by key
    pub documents: Vec<LocalDocument>,

    /// Extra files whose key already appeared at another path
    pub duplicates: Vec<LocalDocument>,
}

impl VaultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a vault-relative one
    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Archive partition for a run date: `_archived/YYYYMMDD`
    pub fn archive_partition(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join(ARCHIVE_FOLDER)
            .join(date.format("%Y%m%d").to_string())
    }

    /// Enumerate managed notes under the vault root.
    ///
    /// A note is managed when its filename ends in `_<KEY>.md` or its
    /// frontmatter carries a `zotero_key`. Files under reserved folders
    /// and files without a key are skipped. When one key appears at
    /// several paths, the first in path order wins and the rest are
    /// reported as duplicates.
    pub fn scan(&self) -> Result<VaultScan> {
        if !self.root.exists() {
            return Ok(VaultScan::default());
        }

        let pattern = format!("{}/**/*.md", self.root.display());
        let mut paths: Vec<PathBuf> = Vec::new();

        for entry in glob::glob(&pattern)
            .with_context(|| format!("Invalid vault scan pattern: {}", pattern))?
        {
            match entry {
                Ok(path) => paths.push(path),
                Err(e) => warn!("Skipping unreadable vault entry: {}", e),
            }
        }
        paths.sort();

        let mut scan = VaultScan::default();
        let mut seen: HashSet<String> = HashSet::new();

        for path in paths {
            let relative = match path.strip_prefix(&self.root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            if path_has_reserved_folder(relative) {
                continue;
            }

            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let key = match key_from_file_name(file_name) {
                Some(key) => key,
                None => match self.key_from_note_header(&path) {
                    Some(key) => key,
                    None => {
                        debug!(path = %relative.display(), "No library key, skipping");
                        continue;
                    }
                },
            };

            let folder = relative.parent().unwrap_or(Path::new("")).to_path_buf();
            let document = LocalDocument::new(key.clone(), file_name, folder);

            if seen.insert(key) {
                scan.documents.push(document);
            } else {
                scan.duplicates.push(document);
            }
        }

        scan.documents.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(scan)
    }

    /// Frontmatter fallback for notes whose filename has no key
    fn key_from_note_header(&self, path: &Path) -> Option<String> {
        let content = std::fs::read_to_string(path).ok()?;
        key_from_frontmatter(&content)
    }

    /// Remove folders left empty after moves and archives. Reserved
    /// folders and the vault root itself are never removed. Returns the
    /// removed paths, deepest first.
    pub fn remove_empty_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        if self.root.is_dir() {
            prune_empty(&self.root, false, &mut removed)?;
        }
        Ok(removed)
    }
}

/// Depth-first prune. Returns true when `dir` ended up empty and was
/// removed (never the case for the top-level call).
fn prune_empty(dir: &Path, removable: bool, removed: &mut Vec<PathBuf>) -> Result<bool> {
    let mut remaining = 0usize;

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();

        if path.is_dir() {
            if is_reserved_folder(&name.to_string_lossy()) {
                remaining += 1;
                continue;
            }
            if !prune_empty(&path, true, removed)? {
                remaining += 1;
            }
        } else {
            remaining += 1;
        }
    }

    if removable && remaining == 0 {
        std::fs::remove_dir(dir)
            .with_context(|| format!("Failed to remove empty directory: {}", dir.display()))?;
        removed.push(dir.to_path_buf());
        return Ok(true);
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_note(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_scan_empty_vault() {
        let temp = TempDir::new().unwrap();
        let store = VaultStore::new(temp.path());

        let scan = store.scan().unwrap();
        assert!(scan.documents.is_empty());
        assert!(scan.duplicates.is_empty());
    }

    #[test]
    fn test_scan_finds_keyed_notes() {
        let temp = TempDir::new().unwrap();
        write_note(temp.path(), "AI/ML/Paper One_ABCD1234.md", "# One");
        write_note(temp.path(), "Physics/Paper Two_WXYZ9876.md", "# Two");
        write_note(temp.path(), "AI/ML/notes-without-key.md", "# Loose");

        let store = VaultStore::new(temp.path());
        let scan = store.scan().unwrap();

        assert_eq!(scan.documents.len(), 2);
        assert_eq!(scan.documents[0].key, "ABCD1234");
        assert_eq!(scan.documents[0].folder, PathBuf::from("AI/ML"));
        assert_eq!(scan.documents[1].key, "WXYZ9876");
    }

    #[test]
    fn test_scan_frontmatter_fallback() {
        let temp = TempDir::new().unwrap();
        write_note(
            temp.path(),
            "AI/renamed-note.md",
            "---\nzotero_key: KEYA1234\n---\nbody",
        );

        let store = VaultStore::new(temp.path());
        let scan = store.scan().unwrap();

        assert_eq!(scan.documents.len(), 1);
        assert_eq!(scan.documents[0].key, "KEYA1234");
    }

    #[test]
    fn test_scan_skips_reserved_folders() {
        let temp = TempDir::new().unwrap();
        write_note(temp.path(), "_archived/20240101/Old_ABCD1234.md", "# Old");
        write_note(temp.path(), "img/figures_WXYZ9876.md", "# Img");
        write_note(temp.path(), "AI/Live_KEYA1234.md", "# Live");

        let store = VaultStore::new(temp.path());
        let scan = store.scan().unwrap();

        assert_eq!(scan.documents.len(), 1);
        assert_eq!(scan.documents[0].key, "KEYA1234");
    }

    #[test]
    fn test_scan_reports_duplicates() {
        let temp = TempDir::new().unwrap();
        write_note(temp.path(), "AI/Paper_ABCD1234.md", "# A");
        write_note(temp.path(), "Old/Paper_ABCD1234.md", "# A again");

        let store = VaultStore::new(temp.path());
        let scan = store.scan().unwrap();

        assert_eq!(scan.documents.len(), 1);
        assert_eq!(scan.duplicates.len(), 1);
        // Path order decides the winner
        assert_eq!(scan.documents[0].folder, PathBuf::from("AI"));
        assert_eq!(scan.duplicates[0].folder, PathBuf::from("Old"));
    }

    #[test]
    fn test_remove_empty_dirs() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("AI/ML")).unwrap();
        std::fs::create_dir_all(temp.path().join("img/paper")).unwrap();
        write_note(temp.path(), "Physics/Paper_WXYZ9876.md", "# Keep");

        let store = VaultStore::new(temp.path());
        let removed = store.remove_empty_dirs().unwrap();

        assert!(!temp.path().join("AI").exists());
        assert!(temp.path().join("img/paper").exists());
        assert!(temp.path().join("Physics").exists());
        assert_eq!(removed.len(), 2);
    }

    #[test]
    fn test_archive_partition_layout() {
        let store = VaultStore::new("/vault");
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            store.archive_partition(date),
            PathBuf::from("/vault/_archived/20240309")
        );
    }
}
