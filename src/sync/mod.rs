//! Bringing the committed index up to date with a source tree.
//!
//! A sync runs in two phases. [`IndexSynchronizer::prepare`] takes the
//! cross-process writer lock, computes the delta between the committed index
//! and the tree, and embeds only the new units into a staged copy.
//! [`IndexSynchronizer::commit`] atomically publishes the staged copy.
//! Dropping a [`PreparedSync`] instead of committing leaves the previous index
//! untouched.

pub mod fs_lock;
pub mod worker;

pub use fs_lock::FsLockGuard;
pub use worker::{SyncRequest, SyncStatus, SyncWorker};

use crate::config::Config;
use crate::embedding::{EmbedSkip, EmbedSlot, EmbeddingAdapter, provider_from_config};
use crate::error::{RagError, StorageError, SyncError};
use crate::indexer::{Chunker, TreeSource, estimator_from_config};
use crate::types::{
    EmbeddedUnit, FailedUnit, IndexStats, PartialSyncReport, SkippedFile, SyncMode, SyncPoint,
    SyncReport, Unit, UnitId,
};
use crate::vector_db::{FlatIndex, IndexMeta, IndexStorage, LoadedIndex, VectorStore};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Per-run options
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Ignore the committed index and embed everything again
    pub rebuild: bool,
    /// Aborts the run before anything is committed
    pub cancel: Option<CancellationToken>,
}

impl SyncOptions {
    pub fn rebuild() -> Self {
        Self {
            rebuild: true,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => {
                tracing::info!("Sync cancelled");
                Err(SyncError::Cancelled)
            }
            _ => Ok(()),
        }
    }
}

/// A staged sync holding the writer lock, ready to be committed
#[derive(Debug)]
pub struct PreparedSync {
    _lock: FsLockGuard,
    staged: FlatIndex,
    sync_point: SyncPoint,
    previous: Option<IndexMeta>,
    mode: SyncMode,
    units_added: usize,
    units_removed: usize,
    units_unchanged: usize,
    skipped: Vec<SkippedFile>,
    failed: Vec<FailedUnit>,
    options: SyncOptions,
    started: Instant,
}

impl PreparedSync {
    pub fn sync_point(&self) -> &SyncPoint {
        &self.sync_point
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// The index as it will look once committed
    pub fn staged(&self) -> &FlatIndex {
        &self.staged
    }

    pub fn failed(&self) -> &[FailedUnit] {
        &self.failed
    }
}

/// The single writer of an index directory
pub struct IndexSynchronizer {
    storage: IndexStorage,
    chunker: Arc<Chunker>,
    adapter: Arc<EmbeddingAdapter>,
    lock_timeout: Duration,
    commit_lock: Mutex<()>,
}

impl IndexSynchronizer {
    pub fn new(storage: IndexStorage, chunker: Chunker, adapter: Arc<EmbeddingAdapter>) -> Self {
        Self {
            storage,
            chunker: Arc::new(chunker),
            adapter,
            lock_timeout: Duration::from_secs(600),
            commit_lock: Mutex::new(()),
        }
    }

    /// Build a synchronizer for a repository from its configuration
    pub fn from_config(config: &Config, repo_root: &Path) -> Result<Self, RagError> {
        let layout = config.layout(repo_root);
        let provider = provider_from_config(&config.embedding, layout.storage_dir())?;
        let estimator = estimator_from_config(&config.chunking)?;
        let adapter = EmbeddingAdapter::new(provider, &config.embedding).with_estimator(estimator);
        let chunker = Chunker::from_config(&config.chunking, layout.storage_prefix())?;

        Ok(Self::new(IndexStorage::new(layout), chunker, Arc::new(adapter))
            .with_lock_timeout(config.sync.lock_timeout()))
    }

    /// How long to wait for another process's sync to finish
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn storage(&self) -> &IndexStorage {
        &self.storage
    }

    pub fn adapter(&self) -> &Arc<EmbeddingAdapter> {
        &self.adapter
    }

    /// Bring the index up to date with `reference` in `source`
    pub async fn sync(
        &self,
        source: Arc<dyn TreeSource>,
        reference: &str,
        options: &SyncOptions,
    ) -> Result<SyncReport, SyncError> {
        let prepared = self.prepare(source, reference, options).await?;
        self.commit(prepared).await
    }

    /// Compute the delta and embed new units without touching the index
    pub async fn prepare(
        &self,
        source: Arc<dyn TreeSource>,
        reference: &str,
        options: &SyncOptions,
    ) -> Result<PreparedSync, SyncError> {
        let started = Instant::now();
        options.check_cancelled()?;

        let lock = self.acquire_lock().await?;

        let (current, previous) = self.load_current(options.rebuild).await?;
        let full = previous.is_none();

        // Resolve the reference and read the tree
        let reference_owned = reference.to_string();
        let snapshot = tokio::task::spawn_blocking(move || source.snapshot(&reference_owned))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
            .map_err(|e| match e {
                RagError::Sync(e) => e,
                other => SyncError::Source(other.to_string()),
            })?;
        options.check_cancelled()?;

        let chunker = self.chunker.clone();
        let entries = snapshot.entries;
        let chunked = tokio::task::spawn_blocking(move || chunker.chunk_tree(&entries))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
            .map_err(|e| SyncError::Source(e.to_string()))?;
        options.check_cancelled()?;

        // Delta by id
        let target: BTreeMap<UnitId, Unit> = chunked
            .units
            .into_iter()
            .map(|unit| (unit.id.clone(), unit))
            .collect();
        let current_ids: BTreeSet<UnitId> = current.ids().into_iter().collect();
        let to_remove: Vec<UnitId> = current_ids
            .iter()
            .filter(|id| !target.contains_key(*id))
            .cloned()
            .collect();
        let to_embed: Vec<Unit> = target
            .values()
            .filter(|unit| !current_ids.contains(&unit.id))
            .cloned()
            .collect();
        let units_unchanged = target.len() - to_embed.len();

        if let Some(meta) = previous.as_ref()
            && !meta.sync_point.complete
            && meta.sync_point.same_revision(&snapshot.sync_point)
        {
            tracing::info!(
                "Retrying units that failed to embed at {}",
                meta.sync_point
            );
        }
        tracing::info!(
            "Sync of {}: {} units in tree, {} to embed, {} to remove",
            snapshot.sync_point,
            target.len(),
            to_embed.len(),
            to_remove.len()
        );

        let (embedded, mut failed) = self.embed_units(&to_embed, options).await?;

        let mut staged = current;
        for id in &to_remove {
            staged.remove(id);
        }
        // Kept units take the span and file hash of the new tree
        let mut units_relocated = 0;
        for unit in target.values().filter(|unit| current_ids.contains(&unit.id)) {
            let Some(stored) = staged.get(&unit.id) else {
                continue;
            };
            if stored.unit == *unit {
                continue;
            }
            let relocated = EmbeddedUnit::new(unit.clone(), stored.vector.clone());
            staged.insert(relocated).map_err(StorageError::from)?;
            units_relocated += 1;
        }
        if units_relocated > 0 {
            tracing::debug!("{} unchanged units moved within their files", units_relocated);
        }
        let mut units_added = 0;
        for unit in embedded {
            let (id, source_path, span) = (
                unit.unit.id.clone(),
                unit.unit.source_path.clone(),
                unit.unit.span,
            );
            match staged.insert(unit) {
                Ok(_) => units_added += 1,
                Err(e) => failed.push(FailedUnit {
                    id,
                    source_path,
                    span,
                    error: e.to_string(),
                }),
            }
        }

        let sync_point = if failed.is_empty() {
            snapshot.sync_point
        } else {
            snapshot.sync_point.incomplete()
        };

        let changed = units_added > 0
            || units_relocated > 0
            || !to_remove.is_empty()
            || previous
                .as_ref()
                .is_none_or(|meta| meta.sync_point != sync_point);
        let mode = if full {
            SyncMode::Full
        } else if changed {
            SyncMode::Incremental
        } else {
            SyncMode::Unchanged
        };

        Ok(PreparedSync {
            _lock: lock,
            staged,
            sync_point,
            previous,
            mode,
            units_added,
            units_removed: to_remove.len(),
            units_unchanged,
            skipped: chunked.skipped,
            failed,
            options: options.clone(),
            started,
        })
    }

    /// Publish a prepared sync; nothing is written when nothing changed
    pub async fn commit(&self, prepared: PreparedSync) -> Result<SyncReport, SyncError> {
        let PreparedSync {
            _lock,
            staged,
            sync_point,
            previous,
            mode,
            units_added,
            units_removed,
            units_unchanged,
            skipped,
            failed,
            options,
            started,
        } = prepared;

        if mode == SyncMode::Unchanged {
            tracing::info!(
                "Index already at {} (generation {}), nothing to commit",
                sync_point,
                previous.as_ref().map(|m| m.generation).unwrap_or(0)
            );
        } else {
            options.check_cancelled()?;
            let _guard = self.commit_lock.lock().await;
            let storage = self.storage.clone();
            let model = self.adapter.model_name().to_string();
            let point = sync_point.clone();
            tokio::task::spawn_blocking(move || storage.commit(&staged, &point, &model))
                .await
                .map_err(|e| SyncError::Task(e.to_string()))??;
        }

        let units_total = units_unchanged + units_added;
        let duration_ms = started.elapsed().as_millis() as u64;

        if !failed.is_empty() {
            tracing::warn!(
                "Sync of {} left {} units unembedded; they will be retried",
                sync_point,
                failed.len()
            );
            return Err(SyncError::Partial(Box::new(PartialSyncReport {
                sync_point,
                embedded: units_added,
                removed: units_removed,
                failed,
            })));
        }

        tracing::info!(
            "Synced {} in {}ms: {} added, {} removed, {} unchanged, {} files skipped",
            sync_point,
            duration_ms,
            units_added,
            units_removed,
            units_unchanged,
            skipped.len()
        );

        Ok(SyncReport {
            sync_point,
            mode,
            units_total,
            units_added,
            units_removed,
            units_unchanged,
            skipped,
            duration_ms,
        })
    }

    /// Statistics of the committed index, if there is one
    pub async fn stats(&self) -> Result<Option<IndexStats>, SyncError> {
        let storage = self.storage.clone();
        let loaded = tokio::task::spawn_blocking(move || storage.load())
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??;
        Ok(loaded.as_ref().map(LoadedIndex::stats))
    }

    async fn acquire_lock(&self) -> Result<FsLockGuard, SyncError> {
        let lock_path = self.storage.layout().lock_path();
        let timeout = self.lock_timeout;
        let path = lock_path.clone();
        tokio::task::spawn_blocking(move || FsLockGuard::acquire_blocking(&path, timeout))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??
            .ok_or_else(|| SyncError::Busy(lock_path.display().to_string()))
    }

    /// The committed index to start from, or an empty one
    async fn load_current(
        &self,
        rebuild: bool,
    ) -> Result<(FlatIndex, Option<IndexMeta>), SyncError> {
        let empty = || (FlatIndex::with_dimension(self.adapter.dimension()), None);
        if rebuild {
            tracing::info!("Rebuilding index from scratch");
            return Ok(empty());
        }

        let storage = self.storage.clone();
        let loaded = tokio::task::spawn_blocking(move || storage.load())
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?;

        match loaded {
            Ok(Some(LoadedIndex { meta, index })) => {
                let model = self.adapter.model_name();
                let dimension = self.adapter.dimension();
                if meta.embedding_model != model {
                    tracing::info!(
                        "Embedding model changed ({} -> {}), rebuilding index",
                        meta.embedding_model,
                        model
                    );
                    Ok(empty())
                } else if meta.dimension.is_some_and(|d| d != dimension) {
                    tracing::info!(
                        "Embedding dimension changed ({:?} -> {}), rebuilding index",
                        meta.dimension,
                        dimension
                    );
                    Ok(empty())
                } else {
                    Ok((index, Some(meta)))
                }
            }
            Ok(None) => Ok(empty()),
            Err(StorageError::FormatMismatch { found, expected }) => {
                tracing::warn!(
                    "Index format {} does not match {}, rebuilding index",
                    found,
                    expected
                );
                Ok(empty())
            }
            Err(e) => Err(SyncError::Storage(e)),
        }
    }

    /// Embed units, splitting them into successes and failures
    async fn embed_units(
        &self,
        units: &[Unit],
        options: &SyncOptions,
    ) -> Result<(Vec<EmbeddedUnit>, Vec<FailedUnit>), SyncError> {
        if units.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let texts: Vec<&str> = units.iter().map(|u| u.text.as_str()).collect();
        let slots = match &options.cancel {
            Some(token) => tokio::select! {
                slots = self.adapter.embed_many(&texts) => slots?,
                _ = token.cancelled() => {
                    tracing::info!("Sync cancelled while embedding");
                    return Err(SyncError::Cancelled);
                }
            },
            None => self.adapter.embed_many(&texts).await?,
        };

        let mut embedded = Vec::with_capacity(units.len());
        let mut failed = Vec::new();
        for (unit, slot) in units.iter().zip(slots) {
            let error = match slot {
                EmbedSlot::Vector(vector) => {
                    embedded.push(EmbeddedUnit::new(unit.clone(), vector));
                    continue;
                }
                EmbedSlot::Skipped(EmbedSkip::TooLong { tokens, limit }) => {
                    format!("unit of ~{} tokens exceeds the input limit of {}", tokens, limit)
                }
                EmbedSlot::Skipped(EmbedSkip::Blank) => "unit is blank".to_string(),
                EmbedSlot::Failed(err) => err.to_string(),
            };
            tracing::debug!(
                "Failed to embed {} ({}:{}): {}",
                unit.id.short(),
                unit.source_path,
                unit.span.start_line,
                error
            );
            failed.push(FailedUnit {
                id: unit.id.clone(),
                source_path: unit.source_path.clone(),
                span: unit.span,
                error,
            });
        }
        Ok((embedded, failed))
    }
}

#[cfg(test)]
mod tests;
