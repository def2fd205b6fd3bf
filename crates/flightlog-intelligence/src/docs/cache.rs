//! Persistent embedding cache: one JSON file keyed by source URL.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::chunker::DocChunk;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedDoc {
    pub content: String,
    pub content_hash: String,
    pub chunks: Vec<DocChunk>,
    pub embeddings: Vec<Vec<f32>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocsCacheFile {
    pub docs: HashMap<String, CachedDoc>,
    #[serde(rename = "lastCheck")]
    pub last_check: Option<DateTime<Utc>>,
}

pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_string()
}

pub struct DocsCache {
    path: PathBuf,
}

impl DocsCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join("docs-cache.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cache file; a missing or corrupt file yields an empty cache.
    pub fn load(&self) -> DocsCacheFile {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(file) => file,
                Err(e) => {
                    warn!(
                        "Doc cache at {} is corrupt ({}); starting empty",
                        self.path.display(),
                        e
                    );
                    DocsCacheFile::default()
                }
            },
            Err(_) => DocsCacheFile::default(),
        }
    }

    pub fn save(&self, file: &DocsCacheFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating cache dir {}", parent.display()))?;
        }
        let raw = serde_json::to_string(file)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("writing doc cache {}", self.path.display()))?;
        info!(
            "Doc cache saved ({} source(s)) to {}",
            file.docs.len(),
            self.path.display()
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("removing doc cache {}", self.path.display()))?;
            info!("Doc cache cleared at {}", self.path.display());
        }
        Ok(())
    }
}
