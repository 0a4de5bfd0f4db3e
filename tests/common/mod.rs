//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use autocommit_rag::config::{Config, ProviderKind};
use autocommit_rag::embedding::{EmbeddingAdapter, EmbeddingProvider, HashingEmbedder};
use autocommit_rag::error::EmbeddingError;
use autocommit_rag::indexer::Chunker;
use autocommit_rag::vector_db::IndexStorage;
use autocommit_rag::{IndexSynchronizer, Retriever};
use git2::{IndexAddOption, Oid, Repository, Signature};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Local embedder that records every text sent to it
pub struct CountingProvider {
    inner: HashingEmbedder,
    texts: Mutex<Vec<String>>,
}

impl CountingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: HashingEmbedder::new(dimension),
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        self.texts.lock().unwrap().clear();
    }
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.texts.lock().unwrap().extend(texts.iter().cloned());
        self.inner.embed_batch(texts).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Configuration using the local embedder, no pacing and small units
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.embedding.provider = ProviderKind::Hashing;
    config.embedding.dimension = 128;
    config.embedding.rate_limit_interval_ms = 0;
    config.embedding.backoff_base_ms = 1;
    config.embedding.backoff_max_ms = 1;
    config.chunking.max_unit_tokens = 200;
    config
}

pub fn synchronizer(
    config: &Config,
    repo_root: &Path,
    provider: Arc<CountingProvider>,
) -> IndexSynchronizer {
    let layout = config.layout(repo_root);
    let chunker = Chunker::from_config(&config.chunking, layout.storage_prefix()).unwrap();
    let adapter = EmbeddingAdapter::new(provider, &config.embedding);
    IndexSynchronizer::new(IndexStorage::new(layout), chunker, Arc::new(adapter))
        .with_lock_timeout(Duration::from_secs(5))
}

pub fn retriever(config: &Config, repo_root: &Path, provider: Arc<CountingProvider>) -> Retriever {
    let adapter = EmbeddingAdapter::new(provider, &config.embedding);
    Retriever::new(
        IndexStorage::new(config.layout(repo_root)),
        Arc::new(adapter),
        &config.retrieval,
    )
}

pub fn init_repo() -> (TempDir, Repository) {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    (dir, repo)
}

pub fn write_file(root: &Path, path: &str, content: &str) {
    let full = root.join(path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(full, content).unwrap();
}

/// Stage every change in the working tree and commit it
pub fn commit_all(repo: &Repository, message: &str) -> Oid {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .unwrap();
    index.update_all(["*"].iter(), None).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("Test", "test@example.com").unwrap();
    let parents: Vec<git2::Commit> = repo
        .head()
        .ok()
        .and_then(|h| h.peel_to_commit().ok())
        .into_iter()
        .collect();
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap()
}

/// Stage a single path without committing
pub fn stage(repo: &Repository, path: &str) {
    let mut index = repo.index().unwrap();
    index.add_path(Path::new(path)).unwrap();
    index.write().unwrap();
}

/// Ten short lines about the change a query for a.py describes
pub fn small_file() -> String {
    (1..=10)
        .map(|i| format!("# change to a py, step {}\n", i))
        .collect()
}

/// Five hundred lines of unrelated assignments
pub fn large_file() -> String {
    (0..500)
        .map(|i| format!("value_{:03} = {}\n", i, i + 1000))
        .collect()
}
