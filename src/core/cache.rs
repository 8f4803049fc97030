//! Fingerprint-keyed summary cache.
//!
//! One JSON file per request fingerprint under the cache directory.
//! Freshness is judged by file mtime, so entries age out without any
//! index to maintain. Cache problems never fail a run; a bad entry is
//! just a miss.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tokio::fs;
use tracing::{debug, warn};

use crate::domain::Summary;

/// On-disk cache of summarization responses
pub struct ResponseCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>, ttl_days: u64) -> Self {
        Self {
            dir: dir.into(),
            ttl: Duration::from_secs(ttl_days * 24 * 60 * 60),
        }
    }

    pub fn from_config() -> Result<Self> {
        let ttl_days = crate::config::config()?.pipeline.cache_ttl_days;
        Ok(Self::new(crate::config::summary_cache_dir()?, ttl_days))
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// A fresh cached summary, or None. Stale, unreadable, and corrupt
    /// entries all count as misses.
    pub async fn fetch(&self, fingerprint: &str) -> Option<Summary> {
        let path = self.entry_path(fingerprint);
        let metadata = fs::metadata(&path).await.ok()?;
        let modified = metadata.modified().ok()?;
        let age = SystemTime::now().duration_since(modified).ok()?;
        if age > self.ttl {
            debug!(fingerprint, "Cache entry expired");
            return None;
        }

        match fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(summary) => {
                    debug!(fingerprint, "Cache hit");
                    Some(summary)
                }
                Err(e) => {
                    warn!(fingerprint, error = %e, "Corrupt cache entry ignored");
                    None
                }
            },
            Err(e) => {
                warn!(fingerprint, error = %e, "Unreadable cache entry ignored");
                None
            }
        }
    }

    /// Best-effort store; a failed write is logged and forgotten
    pub async fn store(&self, fingerprint: &str, summary: &Summary) {
        if let Err(e) = self.try_store(fingerprint, summary).await {
            warn!(fingerprint, error = %e, "Failed to write cache entry");
        }
    }

    async fn try_store(&self, fingerprint: &str, summary: &Summary) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let raw = serde_json::to_string_pretty(summary)?;
        fs::write(self.entry_path(fingerprint), raw).await?;
        Ok(())
    }
}
