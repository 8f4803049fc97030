//! Configuration for zotsync paths and service credentials.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ZOTSYNC_HOME, ZOTSYNC_VAULT, ZOTERO_USER_ID,
//!    ZOTERO_API_KEY)
//! 2. Config file (.zotsync/config.yaml)
//! 3. Defaults (~/.zotsync, auto-detected Zotero data directory)
//!
//! Config file discovery:
//! - Searches current directory and parents for .zotsync/config.yaml
//! - Paths in config file are relative to the config file's parent directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub zotero: Option<ZoteroFileConfig>,
    #[serde(default)]
    pub summarizer: Option<SummarizerFileConfig>,
    #[serde(default)]
    pub pipeline: Option<PipelineFileConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to config file)
    pub home: Option<String>,
    /// Vault root (relative to the project root)
    pub vault: Option<String>,
    /// Snapshot directory (default: sibling "backups" next to the vault)
    pub backups: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoteroFileConfig {
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    /// Zotero data directory holding storage/ and zotero.sqlite
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummarizerFileConfig {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineFileConfig {
    pub workers: Option<usize>,
    pub cache_ttl_days: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to zotsync state (done record, checkpoint, cache)
    pub home: PathBuf,
    /// Absolute path to the vault root
    pub vault: PathBuf,
    /// Absolute path to the snapshot directory
    pub backups: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Zotero access settings
    pub zotero: ZoteroSettings,
    /// Summarization service settings
    pub summarizer: SummarizerSettings,
    /// Pipeline defaults
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ZoteroSettings {
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    /// Local data directory, config value or auto-detected
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SummarizerSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub language: String,
}

impl Default for SummarizerSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            language: "ko".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers: usize,
    pub cache_ttl_days: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            cache_ttl_days: 30,
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".zotsync").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(&path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Candidate Zotero data directories, checked in order.
/// A candidate counts only if it contains a storage/ subdirectory.
fn zotero_data_dir_candidates(home: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![home.join("Zotero"), home.join("Documents").join("Zotero")];
    if cfg!(target_os = "linux") {
        candidates.push(home.join(".zotero").join("zotero"));
        candidates.push(home.join(".local").join("share").join("zotero"));
    }
    candidates
}

/// Auto-detect the Zotero data directory
pub fn detect_zotero_data_dir() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    zotero_data_dir_candidates(&home)
        .into_iter()
        .find(|dir| dir.join("storage").is_dir())
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let user_home = dirs::home_dir().context("Failed to determine home directory")?;
    let default_home = user_home.join(".zotsync");

    let config_file = find_config_file();

    let mut zotero = ZoteroSettings::default();
    let mut summarizer = SummarizerSettings::default();
    let mut pipeline = PipelineSettings::default();

    let (home, vault, backups) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        // Base directory is the parent of .zotsync/ (i.e., grandparent of config.yaml)
        let base_dir = config_path
            .parent()
            .and_then(|p| p.parent())
            .unwrap_or(Path::new("."));

        let home = if let Ok(env_home) = std::env::var("ZOTSYNC_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            // home is relative to the .zotsync/ directory
            let zotsync_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(zotsync_dir, home_path)
        } else {
            default_home.clone()
        };

        let vault = if let Ok(env_vault) = std::env::var("ZOTSYNC_VAULT") {
            PathBuf::from(env_vault)
        } else if let Some(ref vault_path) = config.paths.vault {
            resolve_path(base_dir, vault_path)
        } else {
            home.join("vault")
        };

        let backups = if let Some(ref backups_path) = config.paths.backups {
            resolve_path(base_dir, backups_path)
        } else {
            default_backups_dir(&vault)
        };

        if let Some(z) = config.zotero {
            zotero.user_id = z.user_id;
            zotero.api_key = z.api_key;
            zotero.data_dir = z.data_dir.map(|d| resolve_path(base_dir, &d));
        }

        if let Some(s) = config.summarizer {
            if let Some(endpoint) = s.endpoint {
                summarizer.endpoint = endpoint;
            }
            if let Some(model) = s.model {
                summarizer.model = model;
            }
            if let Some(env) = s.api_key_env {
                summarizer.api_key_env = env;
            }
            if let Some(language) = s.language {
                summarizer.language = language;
            }
        }

        if let Some(p) = config.pipeline {
            if let Some(workers) = p.workers {
                pipeline.workers = workers;
            }
            if let Some(ttl) = p.cache_ttl_days {
                pipeline.cache_ttl_days = ttl;
            }
        }

        (home, vault, backups)
    } else {
        // No config file - env vars or defaults
        let home = std::env::var("ZOTSYNC_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home.clone());

        let vault = std::env::var("ZOTSYNC_VAULT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("vault"));

        let backups = default_backups_dir(&vault);

        (home, vault, backups)
    };

    // Env vars always win for credentials
    if let Ok(user_id) = std::env::var("ZOTERO_USER_ID") {
        zotero.user_id = Some(user_id);
    }
    if let Ok(api_key) = std::env::var("ZOTERO_API_KEY") {
        zotero.api_key = Some(api_key);
    }
    if zotero.data_dir.is_none() {
        zotero.data_dir = detect_zotero_data_dir();
    }

    Ok(ResolvedConfig {
        home,
        vault,
        backups,
        config_file,
        zotero,
        summarizer,
        pipeline,
    })
}

/// Snapshot directory when not configured: "backups" next to the vault
fn default_backups_dir(vault: &Path) -> PathBuf {
    vault
        .parent()
        .map(|p| p.join("backups"))
        .unwrap_or_else(|| vault.join("backups"))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

// ============================================================================
// Convenience functions
// ============================================================================

/// Get the zotsync state directory
pub fn zotsync_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the vault root
pub fn vault_dir() -> Result<PathBuf> {
    Ok(config()?.vault.clone())
}

/// Get the snapshot directory
pub fn backups_dir() -> Result<PathBuf> {
    Ok(config()?.backups.clone())
}

/// Get the done record path ($ZOTSYNC_HOME/done.txt)
pub fn done_record_path() -> Result<PathBuf> {
    Ok(config()?.home.join("done.txt"))
}

/// Get the checkpoint path ($ZOTSYNC_HOME/checkpoint.json)
pub fn checkpoint_path() -> Result<PathBuf> {
    Ok(config()?.home.join("checkpoint.json"))
}

/// Get the summary cache directory ($ZOTSYNC_HOME/cache/summaries)
pub fn summary_cache_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("cache").join("summaries"))
}

/// Get the history log path ($ZOTSYNC_HOME/history.jsonl)
pub fn history_path() -> Result<PathBuf> {
    Ok(config()?.home.join("history.jsonl"))
}
