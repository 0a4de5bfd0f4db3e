//! Read-only similarity search over the committed index.
//!
//! Retrieval is best effort: a missing or unreadable index, an unreachable
//! embedding service or a timeout all produce an empty result so commit
//! message generation can carry on without context. Only configuration
//! problems (no or rejected credentials) are reported as errors.

use crate::config::{Config, RetrievalConfig};
use crate::embedding::{EmbeddingAdapter, provider_from_config};
use crate::error::RagError;
use crate::indexer::{estimator_from_config, truncate_query};
use crate::types::Snippet;
use crate::vector_db::{IndexStorage, LoadedIndex, VectorStore};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Top-k search over the committed index
pub struct Retriever {
    storage: IndexStorage,
    adapter: Arc<EmbeddingAdapter>,
    min_score: f32,
    timeout: Duration,
    /// Last loaded generation, reused until a newer one is committed
    cached: Mutex<Option<Arc<LoadedIndex>>>,
}

impl Retriever {
    pub fn new(
        storage: IndexStorage,
        adapter: Arc<EmbeddingAdapter>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            storage,
            adapter,
            min_score: config.min_score,
            timeout: config.timeout(),
            cached: Mutex::new(None),
        }
    }

    /// Build a retriever for a repository from its configuration
    pub fn from_config(config: &Config, repo_root: &Path) -> Result<Self, RagError> {
        let layout = config.layout(repo_root);
        let provider = provider_from_config(&config.embedding, layout.storage_dir())?;
        let estimator = estimator_from_config(&config.chunking)?;
        let adapter = EmbeddingAdapter::new(provider, &config.embedding).with_estimator(estimator);
        Ok(Self::new(
            IndexStorage::new(layout),
            Arc::new(adapter),
            &config.retrieval,
        ))
    }

    /// The `k` stored units most similar to `query`, best first
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Snippet>, RagError> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let Some(loaded) = self.current_index().await else {
            return Ok(Vec::new());
        };
        if loaded.index.is_empty() {
            tracing::debug!("Index is empty, skipping retrieval");
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let query = truncate_query(
            query,
            self.adapter.max_input_tokens(),
            self.adapter.estimator(),
        );

        let vector = match tokio::time::timeout(self.timeout, self.adapter.embed(&query)).await {
            Ok(Ok(Some(vector))) => vector,
            Ok(Ok(None)) => return Ok(Vec::new()),
            Ok(Err(e)) if e.is_fatal() => return Err(e.into()),
            Ok(Err(e)) => {
                tracing::warn!("Failed to embed query, continuing without context: {}", e);
                return Ok(Vec::new());
            }
            Err(_) => {
                tracing::warn!(
                    "Query embedding timed out after {:?}, continuing without context",
                    self.timeout
                );
                return Ok(Vec::new());
            }
        };

        let hits = match loaded.index.query(&vector, k) {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!("Index query failed: {}", e);
                return Ok(Vec::new());
            }
        };

        let snippets: Vec<Snippet> = hits
            .into_iter()
            .filter(|hit| hit.score >= self.min_score)
            .map(Snippet::from)
            .collect();

        tracing::debug!(
            "Retrieved {} snippets from generation {} in {:?}",
            snippets.len(),
            loaded.meta.generation,
            start.elapsed()
        );
        Ok(snippets)
    }

    /// The committed index, reloaded only when its generation changed
    async fn current_index(&self) -> Option<Arc<LoadedIndex>> {
        let storage = self.storage.clone();
        let meta = match tokio::task::spawn_blocking(move || storage.read_meta()).await {
            Ok(Ok(Some(meta))) => meta,
            Ok(Ok(None)) => {
                tracing::debug!("No index committed yet");
                return None;
            }
            Ok(Err(e)) => {
                tracing::warn!("Index unavailable, continuing without context: {}", e);
                return None;
            }
            Err(e) => {
                tracing::warn!("Index read task failed: {}", e);
                return None;
            }
        };

        let mut cached = self.cached.lock().await;
        if let Some(loaded) = cached.as_ref()
            && loaded.meta.generation == meta.generation
        {
            return Some(loaded.clone());
        }

        let storage = self.storage.clone();
        let loaded = match tokio::task::spawn_blocking(move || storage.load()).await {
            Ok(Ok(Some(loaded))) => loaded,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                tracing::warn!("Index unavailable, continuing without context: {}", e);
                return None;
            }
            Err(e) => {
                tracing::warn!("Index read task failed: {}", e);
                return None;
            }
        };

        if loaded.meta.embedding_model != self.adapter.model_name() {
            tracing::warn!(
                "Index was built with {} but queries use {}; run a sync to rebuild it",
                loaded.meta.embedding_model,
                self.adapter.model_name()
            );
            return None;
        }

        tracing::debug!(
            "Loaded index generation {} ({} units)",
            loaded.meta.generation,
            loaded.index.len()
        );
        let loaded = Arc::new(loaded);
        *cached = Some(loaded.clone());
        Some(loaded)
    }
}

/// Join snippets into the context block of a prompt
pub fn render_context(snippets: &[Snippet]) -> String {
    snippets
        .iter()
        .map(Snippet::to_prompt_string)
        .collect::<Vec<_>>()
        .join("\n\n")
}
