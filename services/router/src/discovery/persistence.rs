//! Discovery cache persistence.
//!
//! The cache file is a JSON object `{hostname: {target, port}}`. Access
//! times are process-local and never written.
//!
//! Saves use the write-to-temp + rename pattern so a reader of the file
//! never sees a partial document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

/// Persisted backend for one hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBackend {
    pub target: String,
    pub port: u16,
}

/// Full cache file contents, keyed by hostname.
pub type PersistedCache = BTreeMap<String, PersistedBackend>;

/// Cache file manager.
#[derive(Debug, Clone)]
pub struct CacheFile {
    /// Path to the cache file.
    path: PathBuf,
}

impl CacheFile {
    /// Create a new cache file manager.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cache from disk.
    ///
    /// Returns an empty cache if the file doesn't exist.
    /// Returns error if the file exists but is invalid.
    pub async fn load(&self) -> Result<PersistedCache> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            debug!(path = %self.path.display(), "No cache file, starting fresh");
            return Ok(PersistedCache::new());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read cache file: {}", self.path.display()))?;

        let cache: PersistedCache = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse cache file: {}", self.path.display()))?;

        info!(
            path = %self.path.display(),
            entry_count = cache.len(),
            "Loaded discovery cache from disk"
        );

        Ok(cache)
    }

    /// Save the cache to disk atomically.
    pub async fn save(&self, cache: &PersistedCache) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(cache).context("Failed to serialize cache")?;

        fs::write(&tmp_path, &content)
            .await
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;

        fs::rename(&tmp_path, &self.path).await.with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        debug!(
            path = %self.path.display(),
            entry_count = cache.len(),
            "Saved discovery cache to disk"
        );

        Ok(())
    }
}
