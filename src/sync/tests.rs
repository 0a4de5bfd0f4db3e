use super::*;
use crate::config::EmbeddingConfig;
use crate::embedding::{EmbeddingProvider, HashingEmbedder};
use crate::error::EmbeddingError;
use crate::indexer::{CharRatioEstimator, StaticTree, TreeSnapshot};
use crate::paths::StorageLayout;
use crate::vector_db::FORMAT_VERSION;
use async_trait::async_trait;
use std::fs;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::TempDir;

/// Hashing embedder that records every text it is asked to embed and can be
/// told to fail some of them
struct RecordingProvider {
    inner: HashingEmbedder,
    texts: StdMutex<Vec<String>>,
    fail_marker: StdMutex<Option<String>>,
    unauthorized: AtomicBool,
}

impl RecordingProvider {
    fn new() -> Self {
        Self {
            inner: HashingEmbedder::new(32),
            texts: StdMutex::new(Vec::new()),
            fail_marker: StdMutex::new(None),
            unauthorized: AtomicBool::new(false),
        }
    }

    fn embedded(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    fn reset(&self) {
        self.texts.lock().unwrap().clear();
    }

    fn fail_texts_containing(&self, marker: Option<&str>) {
        *self.fail_marker.lock().unwrap() = marker.map(str::to_string);
    }
}

#[async_trait]
impl EmbeddingProvider for RecordingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unauthorized("bad key".to_string()));
        }
        if let Some(marker) = self.fail_marker.lock().unwrap().as_deref()
            && texts.iter().any(|t| t.contains(marker))
        {
            return Err(EmbeddingError::Rejected {
                status: 400,
                message: "input rejected".to_string(),
            });
        }
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

/// Tree source counting how often it is read
struct CountingSource {
    tree: StdMutex<StaticTree>,
    reads: AtomicUsize,
}

impl CountingSource {
    fn new(tree: StaticTree) -> Self {
        Self {
            tree: StdMutex::new(tree),
            reads: AtomicUsize::new(0),
        }
    }
}

impl TreeSource for CountingSource {
    fn resolve(&self, reference: &str) -> Result<String, RagError> {
        self.tree.lock().unwrap().resolve(reference)
    }

    fn entries(&self, reference: &str) -> Result<Vec<crate::indexer::SourceEntry>, RagError> {
        self.tree.lock().unwrap().entries(reference)
    }

    fn snapshot(&self, reference: &str) -> Result<TreeSnapshot, RagError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.tree.lock().unwrap().snapshot(reference)
    }
}

fn test_config() -> EmbeddingConfig {
    EmbeddingConfig {
        rate_limit_interval_ms: 0,
        backoff_base_ms: 1,
        backoff_max_ms: 1,
        batch_size: 1,
        ..Default::default()
    }
}

fn synchronizer(dir: &TempDir, provider: Arc<RecordingProvider>) -> IndexSynchronizer {
    let adapter = EmbeddingAdapter::new(provider, &test_config());
    let storage = IndexStorage::new(StorageLayout::for_index_dir(&dir.path().join("rag_index")));
    IndexSynchronizer::new(storage, Chunker::default(), Arc::new(adapter))
        .with_lock_timeout(Duration::from_millis(0))
}

fn two_files() -> StaticTree {
    StaticTree::new()
        .with_file("a.py", "def f():\n    return 1\n")
        .with_file("b.py", "def g():\n    return 2\n")
}

fn source(tree: StaticTree) -> Arc<dyn TreeSource> {
    Arc::new(tree)
}

#[tokio::test]
async fn test_first_sync_is_full() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(RecordingProvider::new());
    let sync = synchronizer(&dir, provider.clone());

    let report = sync
        .sync(source(two_files()), "HEAD", &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.units_added, 2);
    assert_eq!(report.units_total, 2);
    assert!(report.sync_point.complete);
    assert_eq!(provider.embedded().len(), 2);

    let stats = sync.stats().await.unwrap().unwrap();
    assert_eq!(stats.units, 2);
    assert_eq!(stats.files, 2);
    assert_eq!(stats.generation, 1);
    assert_eq!(stats.embedding_model, "feature-hashing-32");
}

#[tokio::test]
async fn test_second_sync_is_noop() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(RecordingProvider::new());
    let sync = synchronizer(&dir, provider.clone());
    let tree = source(two_files());

    sync.sync(tree.clone(), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    let meta_before = fs::read(sync.storage().layout().meta_path()).unwrap();
    provider.reset();

    let report = sync
        .sync(tree, "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.mode, SyncMode::Unchanged);
    assert_eq!(report.units_added, 0);
    assert_eq!(report.units_removed, 0);
    assert_eq!(report.units_unchanged, 2);
    assert!(provider.embedded().is_empty());

    let meta_after = fs::read(sync.storage().layout().meta_path()).unwrap();
    assert_eq!(meta_before, meta_after);
}

#[tokio::test]
async fn test_only_changed_units_are_embedded() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(RecordingProvider::new());
    let sync = synchronizer(&dir, provider.clone());

    sync.sync(source(two_files()), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    provider.reset();

    let changed = two_files().with_file("b.py", "def g():\n    return 3\n");
    let report = sync
        .sync(source(changed), "HEAD", &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(report.mode, SyncMode::Incremental);
    assert_eq!(report.units_added, 1);
    assert_eq!(report.units_removed, 1);
    assert_eq!(report.units_unchanged, 1);
    assert_eq!(provider.embedded(), vec!["def g():\n    return 3\n".to_string()]);
}

#[tokio::test]
async fn test_kept_units_follow_moved_lines() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(RecordingProvider::new());
    let adapter = EmbeddingAdapter::new(provider.clone(), &test_config());
    let storage = IndexStorage::new(StorageLayout::for_index_dir(&dir.path().join("rag_index")));
    // one line per unit
    let chunker = Chunker::new(6, Arc::new(CharRatioEstimator::new(1)));
    let sync = IndexSynchronizer::new(storage, chunker, Arc::new(adapter));

    let before = StaticTree::new().with_file("a.py", "bbbbb\nccccc\n");
    sync.sync(source(before), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    let old_hash = sync.storage().load().unwrap().unwrap().index.units_for_path("a.py")[0]
        .unit
        .file_hash
        .clone();
    provider.reset();

    let after = StaticTree::new().with_file("a.py", "aaaaa\nbbbbb\nccccc\n");
    let report = sync
        .sync(source(after), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.mode, SyncMode::Incremental);
    assert_eq!(report.units_added, 1);
    assert_eq!(report.units_unchanged, 2);
    assert_eq!(provider.embedded(), vec!["aaaaa\n".to_string()]);

    let loaded = sync.storage().load().unwrap().unwrap();
    let units = loaded.index.units_for_path("a.py");
    assert_eq!(units.len(), 3);
    let moved = units.iter().find(|u| u.unit.text == "ccccc\n").unwrap();
    assert_eq!(moved.unit.span.start_line, 3);
    assert_eq!(moved.unit.span.start_byte, 12);
    assert_eq!(moved.unit.span.end_byte, 18);
    assert_ne!(moved.unit.file_hash, old_hash);
    assert!(units.iter().all(|u| u.unit.file_hash == moved.unit.file_hash));
}

#[tokio::test]
async fn test_deleted_file_units_are_removed() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(RecordingProvider::new());
    let sync = synchronizer(&dir, provider);

    sync.sync(source(two_files()), "HEAD", &SyncOptions::default())
        .await
        .unwrap();

    let mut tree = two_files();
    tree.remove("b.py");
    let report = sync
        .sync(source(tree), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.units_removed, 1);

    let loaded = sync.storage().load().unwrap().unwrap();
    assert!(loaded.index.units_for_path("b.py").is_empty());
    assert_eq!(loaded.index.units_for_path("a.py").len(), 1);
}

#[tokio::test]
async fn test_dropped_prepare_leaves_index_untouched() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(RecordingProvider::new());
    let sync = synchronizer(&dir, provider);

    sync.sync(source(two_files()), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    let before = sync.storage().load().unwrap().unwrap();

    let changed = two_files().with_file("c.py", "print('new')\n");
    let prepared = sync
        .prepare(source(changed), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(prepared.staged().len(), 3);
    drop(prepared);

    let after = sync.storage().load().unwrap().unwrap();
    assert_eq!(after.meta, before.meta);
    assert_eq!(after.index, before.index);
}

#[tokio::test]
async fn test_held_lock_is_busy() {
    let dir = TempDir::new().unwrap();
    let sync = synchronizer(&dir, Arc::new(RecordingProvider::new()));
    let _held = FsLockGuard::try_acquire(&sync.storage().layout().lock_path())
        .unwrap()
        .unwrap();

    let result = sync
        .sync(source(two_files()), "HEAD", &SyncOptions::default())
        .await;
    assert!(matches!(result, Err(SyncError::Busy(_))));
}

#[tokio::test]
async fn test_prepared_sync_holds_lock() {
    let dir = TempDir::new().unwrap();
    let sync = synchronizer(&dir, Arc::new(RecordingProvider::new()));

    let prepared = sync
        .prepare(source(two_files()), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    let second = sync
        .prepare(source(two_files()), "HEAD", &SyncOptions::default())
        .await;
    assert!(matches!(second, Err(SyncError::Busy(_))));

    sync.commit(prepared).await.unwrap();
    assert!(
        sync.prepare(source(two_files()), "HEAD", &SyncOptions::default())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_cancelled_sync_commits_nothing() {
    let dir = TempDir::new().unwrap();
    let sync = synchronizer(&dir, Arc::new(RecordingProvider::new()));

    let token = CancellationToken::new();
    let options = SyncOptions::default().with_cancel(token.clone());
    let prepared = sync
        .prepare(source(two_files()), "HEAD", &options)
        .await
        .unwrap();
    token.cancel();

    assert!(matches!(
        sync.commit(prepared).await,
        Err(SyncError::Cancelled)
    ));
    assert!(sync.storage().load().unwrap().is_none());
}

#[tokio::test]
async fn test_partial_sync_commits_successes() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(RecordingProvider::new());
    let sync = synchronizer(&dir, provider.clone());
    let tree = two_files().with_file("c.py", "BROKEN = True\n");

    provider.fail_texts_containing(Some("BROKEN"));
    let err = sync
        .sync(source(tree.clone()), "HEAD", &SyncOptions::default())
        .await
        .unwrap_err();

    let point = err.committed_sync_point().cloned().unwrap();
    assert!(!point.complete);
    match err {
        SyncError::Partial(report) => {
            assert_eq!(report.embedded, 2);
            assert_eq!(report.failed.len(), 1);
            assert_eq!(report.failed[0].source_path, "c.py");
        }
        other => panic!("expected partial sync, got {:?}", other),
    }

    let loaded = sync.storage().load().unwrap().unwrap();
    assert_eq!(loaded.index.len(), 2);
    assert!(!loaded.meta.sync_point.complete);

    // the next sync retries only the failed unit
    provider.fail_texts_containing(None);
    provider.reset();
    let report = sync
        .sync(source(tree), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.units_added, 1);
    assert!(report.sync_point.complete);
    assert_eq!(provider.embedded(), vec!["BROKEN = True\n".to_string()]);
}

#[tokio::test]
async fn test_fatal_embedding_error_aborts() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(RecordingProvider::new());
    provider.unauthorized.store(true, Ordering::SeqCst);
    let sync = synchronizer(&dir, provider);

    let result = sync
        .sync(source(two_files()), "HEAD", &SyncOptions::default())
        .await;
    match result {
        Err(SyncError::Embedding(e)) => assert!(e.is_fatal()),
        other => panic!("expected fatal embedding error, got {:?}", other),
    }
    assert!(sync.storage().load().unwrap().is_none());
}

#[tokio::test]
async fn test_format_mismatch_triggers_rebuild() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(RecordingProvider::new());
    let sync = synchronizer(&dir, provider.clone());
    sync.sync(source(two_files()), "HEAD", &SyncOptions::default())
        .await
        .unwrap();

    let meta_path = sync.storage().layout().meta_path();
    let mut value: serde_json::Value = serde_json::from_slice(&fs::read(&meta_path).unwrap()).unwrap();
    value["format_version"] = serde_json::json!(FORMAT_VERSION + 7);
    fs::write(&meta_path, serde_json::to_vec(&value).unwrap()).unwrap();
    provider.reset();

    let report = sync
        .sync(source(two_files()), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(provider.embedded().len(), 2);
    assert_eq!(
        sync.storage().load().unwrap().unwrap().meta.format_version,
        FORMAT_VERSION
    );
}

#[tokio::test]
async fn test_corrupt_index_requires_rebuild() {
    let dir = TempDir::new().unwrap();
    let sync = synchronizer(&dir, Arc::new(RecordingProvider::new()));
    sync.sync(source(two_files()), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    fs::write(sync.storage().layout().meta_path(), b"not json").unwrap();

    let result = sync
        .sync(source(two_files()), "HEAD", &SyncOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(SyncError::Storage(StorageError::Corrupt { .. }))
    ));

    let report = sync
        .sync(source(two_files()), "HEAD", &SyncOptions::rebuild())
        .await
        .unwrap();
    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.units_total, 2);
}

#[tokio::test]
async fn test_model_change_triggers_rebuild() {
    let dir = TempDir::new().unwrap();
    let sync = synchronizer(&dir, Arc::new(RecordingProvider::new()));
    sync.sync(source(two_files()), "HEAD", &SyncOptions::default())
        .await
        .unwrap();

    // same directory, different model
    let adapter = EmbeddingAdapter::new(Arc::new(HashingEmbedder::new(16)), &test_config());
    let other = IndexSynchronizer::new(sync.storage().clone(), Chunker::default(), Arc::new(adapter));
    let report = other
        .sync(source(two_files()), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(
        other.stats().await.unwrap().unwrap().embedding_model,
        "feature-hashing-16"
    );
}

#[tokio::test]
async fn test_skipped_files_are_reported() {
    let dir = TempDir::new().unwrap();
    let sync = synchronizer(&dir, Arc::new(RecordingProvider::new()));
    let tree = two_files()
        .with_file("logo.png", vec![0x89, b'P', b'N', b'G', 0, 0, 1])
        .with_file("empty.txt", "  \n");

    let report = sync
        .sync(source(tree), "HEAD", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.units_total, 2);
    let skipped: Vec<&str> = report.skipped.iter().map(|s| s.path.as_str()).collect();
    assert!(skipped.contains(&"logo.png"));
    assert!(skipped.contains(&"empty.txt"));
}

#[tokio::test]
async fn test_worker_coalesces_queued_requests() {
    let dir = TempDir::new().unwrap();
    let sync = Arc::new(synchronizer(&dir, Arc::new(RecordingProvider::new())));
    let counting = Arc::new(CountingSource::new(two_files()));

    let worker = SyncWorker::spawn(sync.clone(), counting.clone());
    assert_eq!(*worker.status().borrow(), SyncStatus::Idle);

    // the worker task has not run yet on this single-threaded runtime
    assert!(worker.request("HEAD"));
    assert!(worker.request("HEAD"));
    assert!(worker.request("HEAD"));
    let status = worker.status();
    worker.shutdown().await;

    assert_eq!(counting.reads.load(Ordering::SeqCst), 1);
    match &*status.borrow() {
        SyncStatus::Finished(report) => assert_eq!(report.units_total, 2),
        other => panic!("expected finished status, got {:?}", other),
    }
    assert_eq!(sync.stats().await.unwrap().unwrap().units, 2);
}

#[tokio::test]
async fn test_worker_reports_failures() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(RecordingProvider::new());
    provider.unauthorized.store(true, Ordering::SeqCst);
    let sync = Arc::new(synchronizer(&dir, provider));

    let worker = SyncWorker::spawn(sync, source(two_files()));
    worker.request("HEAD");
    let status = worker.status();
    worker.shutdown().await;

    match &*status.borrow() {
        SyncStatus::Failed { reference, error } => {
            assert_eq!(reference, "HEAD");
            assert!(error.contains("credentials"));
        }
        other => panic!("expected failed status, got {:?}", other),
    }
}
