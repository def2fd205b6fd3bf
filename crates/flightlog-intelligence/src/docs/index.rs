//! Vector index over documentation chunks.
//!
//! The index is append-only within a process and backed by the
//! persistent cache in `cache.rs`. Embeddings are reused across restarts
//! while the fetched content hash is unchanged and young enough.

use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::cache::{content_hash, CachedDoc, DocsCache, DocsCacheFile};
use super::chunker::{chunk_document, DocChunk};
use crate::config::{DOC_CACHE_MAX_AGE_DAYS, DOC_TOP_K};
use crate::llm::ChatBackend;

/// Minimal built-in corpus used when the documentation source cannot be
/// fetched, so retrieval stays operational.
const FALLBACK_CORPUS: &str = r#"
# ATT

Attitude telemetry from the AHRS. Fields: Roll, Pitch, Yaw in degrees, plus
the desired values DesRoll, DesPitch, DesYaw commanded by the controller.

# GPS

Global position fix. Fields: Lat and Lng in degrees, Alt in metres above
sea level, Spd ground speed in m/s, NSats satellite count, HDop horizontal
dilution of precision. Status 3 or higher indicates a 3D fix.

# BAT

Battery state. Fields: Volt pack voltage, Curr current draw in amperes,
CurrTot consumed capacity in mAh, Temp pack temperature when a sensor is
fitted.

# CTUN

Control tuning. Fields: ThI throttle input, ThO throttle output, Alt
inertial altitude estimate, DAlt desired altitude, CRt climb rate in cm/s.

# MODE

Flight mode changes. Fields: Mode as a numeric identifier and ModeNum, with
the time of the change. Common values: 0 Stabilize, 3 Auto, 5 Loiter,
6 RTL.

# VIBE

Vibration levels measured by the IMU accelerometers. Fields: VibeX, VibeY,
VibeZ in m/s/s, and Clip0/Clip1/Clip2 accelerometer clipping counts.
High vibration degrades position estimation.

# ERR

Error events. Fields: Subsys identifying the failing subsystem and ECode
for the specific condition. Subsys 6 is a failsafe, ECode 1 means
triggered.
"#;

#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub content: String,
    #[serde(rename = "type")]
    pub chunk_type: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocIndexStatus {
    pub initialized: bool,
    pub chunk_count: usize,
    pub embedding_dimension: usize,
    pub sources: Vec<DocSourceStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocSourceStatus {
    pub url: String,
    pub chunk_count: usize,
    pub from_cache: bool,
    pub fetched_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Default)]
struct IndexState {
    chunks: Vec<DocChunk>,
    embeddings: Vec<Vec<f32>>,
    cache_file: DocsCacheFile,
    initialized: bool,
    sources: Vec<DocSourceStatus>,
}

pub struct DocIndex {
    backend: Arc<dyn ChatBackend>,
    embed_model: String,
    cache: DocsCache,
    source_url: String,
    http_client: reqwest::Client,
    state: RwLock<IndexState>,
}

impl DocIndex {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        embed_model: String,
        cache: DocsCache,
        source_url: String,
        fetch_timeout_seconds: u64,
    ) -> Self {
        Self {
            backend,
            embed_model,
            cache,
            source_url,
            http_client: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(fetch_timeout_seconds))
                .build()
                .unwrap_or_default(),
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Fetch, chunk and embed the documentation source, reusing cached
    /// embeddings when the content hash is unchanged and the cache entry
    /// is younger than the staleness bound.
    pub async fn initialize(&self) -> Result<()> {
        let cache_file = self.cache.load();
        self.build(cache_file, false).await
    }

    /// Re-fetch the source and re-embed on content change.
    pub async fn refresh(&self) -> Result<()> {
        let cache_file = { self.state.read().await.cache_file.clone() };
        self.build(cache_file, true).await
    }

    async fn build(&self, mut cache_file: DocsCacheFile, force_fetch: bool) -> Result<()> {
        let url = self.source_url.clone();

        let fetched = match self.fetch_source(&url).await {
            Ok(content) => Some(content),
            Err(e) => {
                warn!("Failed to fetch documentation from {}: {}", url, e);
                None
            }
        };

        let (chunks, embeddings, from_cache, content_for_cache) = match fetched {
            Some(content) => {
                let hash = content_hash(&content);
                let reusable = !force_fetch
                    && cache_file.docs.get(&url).map_or(false, |doc| {
                        doc.content_hash == hash
                            && Utc::now() - doc.timestamp
                                < Duration::days(DOC_CACHE_MAX_AGE_DAYS)
                    });
                let reusable = reusable
                    || cache_file
                        .docs
                        .get(&url)
                        .map_or(false, |doc| force_fetch && doc.content_hash == hash);

                if reusable {
                    let doc = &cache_file.docs[&url];
                    info!(
                        "Doc cache hit for {} ({} chunks, unchanged content)",
                        url,
                        doc.chunks.len()
                    );
                    (doc.chunks.clone(), doc.embeddings.clone(), true, None)
                } else {
                    let chunks = chunk_document(&content);
                    info!(
                        "Embedding {} documentation chunk(s) from {}",
                        chunks.len(),
                        url
                    );
                    let embeddings = self.embed_chunks(&chunks).await?;
                    (chunks, embeddings, false, Some((content, hash)))
                }
            }
            None => match cache_file.docs.get(&url) {
                Some(doc) => {
                    warn!("Using cached documentation for {} despite fetch failure", url);
                    (doc.chunks.clone(), doc.embeddings.clone(), true, None)
                }
                None => {
                    warn!("Seeding documentation index from the built-in corpus");
                    let chunks = chunk_document(FALLBACK_CORPUS);
                    let embeddings = self.embed_chunks(&chunks).await?;
                    (chunks, embeddings, false, None)
                }
            },
        };

        if let Some((content, hash)) = content_for_cache {
            cache_file.docs.insert(
                url.clone(),
                CachedDoc {
                    content,
                    content_hash: hash,
                    chunks: chunks.clone(),
                    embeddings: embeddings.clone(),
                    timestamp: Utc::now(),
                },
            );
        }
        cache_file.last_check = Some(Utc::now());
        if let Err(e) = self.cache.save(&cache_file) {
            warn!("Failed to persist doc cache: {}", e);
        }

        let mut state = self.state.write().await;
        state.sources = vec![DocSourceStatus {
            url,
            chunk_count: chunks.len(),
            from_cache,
            fetched_at: Some(Utc::now()),
        }];
        state.chunks = chunks;
        state.embeddings = embeddings;
        state.cache_file = cache_file;
        state.initialized = true;
        info!("Doc index ready with {} chunk(s)", state.chunks.len());
        Ok(())
    }

    async fn fetch_source(&self, url: &str) -> Result<String> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("doc fetch failed: {}", e))?;
        if !response.status().is_success() {
            return Err(anyhow!("doc fetch returned {}", response.status()));
        }
        response
            .text()
            .await
            .map_err(|e| anyhow!("doc fetch body read failed: {}", e))
    }

    async fn embed_chunks(&self, chunks: &[DocChunk]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        self.backend.embed(&self.embed_model, &texts).await
    }

    /// Top-K chunks by cosine similarity to the query.
    pub async fn search(&self, query: &str, k: Option<usize>) -> Result<Vec<ScoredChunk>> {
        let k = k.unwrap_or(DOC_TOP_K);
        {
            let state = self.state.read().await;
            if state.chunks.is_empty() {
                return Ok(Vec::new());
            }
        }

        let query_embedding = self
            .backend
            .embed(&self.embed_model, &[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("empty query embedding"))?;

        let state = self.state.read().await;
        let mut scored: Vec<ScoredChunk> = state
            .chunks
            .iter()
            .zip(state.embeddings.iter())
            .map(|(chunk, embedding)| ScoredChunk {
                content: chunk.content.clone(),
                chunk_type: chunk.chunk_type.clone(),
                score: cosine_similarity(&query_embedding, embedding),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    pub async fn status(&self) -> DocIndexStatus {
        let state = self.state.read().await;
        DocIndexStatus {
            initialized: state.initialized,
            chunk_count: state.chunks.len(),
            embedding_dimension: state.embeddings.first().map(|e| e.len()).unwrap_or(0),
            sources: state.sources.clone(),
        }
    }

    /// Purge the on-disk cache; the in-memory index stays serviceable.
    pub async fn clear_cache(&self) -> Result<()> {
        self.cache.clear()?;
        let mut state = self.state.write().await;
        state.cache_file = DocsCacheFile::default();
        Ok(())
    }

    /// Flush the current cache state to disk (shutdown path).
    pub async fn persist(&self) -> Result<()> {
        let state = self.state.read().await;
        if state.cache_file.docs.is_empty() {
            return Ok(());
        }
        self.cache.save(&state.cache_file)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
