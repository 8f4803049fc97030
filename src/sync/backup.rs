//! Vault snapshots taken before reconciliation mutates anything.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Local;
use flate2::{write::GzEncoder, Compression};
use tokio::task::spawn_blocking;
use tracing::info;

/// Create a timestamped tar.gz snapshot of the whole vault tree and
/// return its path. A failure here must abort reconciliation before any
/// file is touched.
pub async fn snapshot_vault(vault: &Path, backups_dir: &Path) -> Result<PathBuf> {
    let vault = vault.to_path_buf();
    let backups_dir = backups_dir.to_path_buf();

    let path = spawn_blocking(move || write_snapshot(&vault, &backups_dir))
        .await
        .context("Backup task panicked")??;

    info!("Vault snapshot created at {}", path.display());
    Ok(path)
}

// Sync on purpose; called through spawn_blocking.
fn write_snapshot(vault: &Path, backups_dir: &Path) -> Result<PathBuf> {
    if !vault.is_dir() {
        bail!("Vault directory not found: {}", vault.display());
    }
    std::fs::create_dir_all(backups_dir)
        .with_context(|| format!("Failed to create backup directory: {}", backups_dir.display()))?;

    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let path = backups_dir.join(format!("vault_backup_{}.tar.gz", stamp));

    let file = File::create(&path)
        .with_context(|| format!("Failed to create snapshot file: {}", path.display()))?;
    let mut tar = tar::Builder::new(GzEncoder::new(BufWriter::new(file), Compression::default()));

    // Archive entries live under the vault's basename
    let arc_root = vault.file_name().unwrap_or_else(|| OsStr::new("vault"));
    tar.append_dir_all(arc_root, vault)
        .with_context(|| format!("Failed to archive vault tree: {}", vault.display()))?;

    let encoder = tar.into_inner().context("Failed to finalize snapshot archive")?;
    let mut writer = encoder.finish().context("Failed to finish snapshot compression")?;
    writer.flush().context("Failed to flush snapshot to disk")?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::bufread::GzDecoder;
    use std::io::BufReader;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_contains_vault_files() {
        let temp = TempDir::new().unwrap();
        let vault = temp.path().join("vault");
        std::fs::create_dir_all(vault.join("AI/ML")).unwrap();
        std::fs::write(vault.join("AI/ML/Paper_ABCD1234.md"), "# note").unwrap();
        let backups = temp.path().join("backups");

        let path = snapshot_vault(&vault, &backups).await.unwrap();

        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("vault_backup_"));
        assert!(name.ends_with(".tar.gz"));

        // Entries are rooted at the vault basename
        let reader = BufReader::new(File::open(&path).unwrap());
        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        let entries: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(entries
            .iter()
            .any(|p| p == "vault/AI/ML/Paper_ABCD1234.md"));
    }

    #[tokio::test]
    async fn test_snapshot_fails_for_missing_vault() {
        let temp = TempDir::new().unwrap();
        let result = snapshot_vault(&temp.path().join("nope"), &temp.path().join("backups")).await;
        assert!(result.is_err());
    }
}
