//! On-disk persistence of the flat index.
//!
//! A commit writes a new generation of the units file and then atomically
//! replaces `meta.json`, which names the units file of the live generation.
//! Readers only ever follow `meta.json`, so they observe either the previous
//! or the new generation in full.

use super::{FlatIndex, VectorStore};
use crate::error::StorageError;
use crate::paths::StorageLayout;
use crate::types::{EmbeddedUnit, IndexStats, SyncPoint};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Version of the on-disk layout; a mismatch forces a rebuild
pub const FORMAT_VERSION: u32 = 1;

const TMP_SUFFIX: &str = ".tmp";
const LOAD_ATTEMPTS: usize = 3;

/// Commit record stored in `meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub format_version: u32,
    pub generation: u64,
    pub sync_point: SyncPoint,
    pub embedding_model: String,
    pub dimension: Option<usize>,
    pub unit_count: usize,
    pub units_file: String,
    pub units_sha256: String,
    /// RFC 3339 timestamp of the commit
    pub committed_at: String,
}

/// A committed index together with its metadata
#[derive(Debug, Clone)]
pub struct LoadedIndex {
    pub meta: IndexMeta,
    pub index: FlatIndex,
}

impl LoadedIndex {
    pub fn stats(&self) -> IndexStats {
        let store = self.index.stats();
        IndexStats {
            units: store.units,
            files: store.files,
            dimension: store.dimension,
            generation: self.meta.generation,
            sync_point: Some(self.meta.sync_point.clone()),
            embedding_model: self.meta.embedding_model.clone(),
            committed_at: self.meta.committed_at.clone(),
        }
    }
}

/// Handle to one index directory
#[derive(Debug, Clone)]
pub struct IndexStorage {
    layout: StorageLayout,
}

impl IndexStorage {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn open(index_dir: &Path) -> Self {
        Self::new(StorageLayout::for_index_dir(index_dir))
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Read the commit record; `None` when nothing was committed yet
    pub fn read_meta(&self) -> Result<Option<IndexMeta>, StorageError> {
        let path = self.layout.meta_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::ReadFailed {
                    path: display(&path),
                    source,
                });
            }
        };

        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(&path, e))?;
        let found = value
            .get("format_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| corrupt(&path, "missing format_version"))?;
        if found != u64::from(FORMAT_VERSION) {
            return Err(StorageError::FormatMismatch {
                found: u32::try_from(found).unwrap_or(u32::MAX),
                expected: FORMAT_VERSION,
            });
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| corrupt(&path, e))
    }

    /// Load the committed index; `None` when nothing was committed yet
    pub fn load(&self) -> Result<Option<LoadedIndex>, StorageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(meta) = self.read_meta()? else {
                return Ok(None);
            };

            let units_path = self.layout.index_dir().join(&meta.units_file);
            let bytes = match fs::read(&units_path) {
                Ok(bytes) => bytes,
                // a newer commit pruned this generation between the two reads
                Err(e) if e.kind() == io::ErrorKind::NotFound && attempt < LOAD_ATTEMPTS => {
                    tracing::debug!(
                        "Units file {:?} vanished, re-reading index metadata",
                        units_path
                    );
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(corrupt(&units_path, "units file is missing"));
                }
                Err(source) => {
                    return Err(StorageError::ReadFailed {
                        path: display(&units_path),
                        source,
                    });
                }
            };

            let checksum = sha256_hex(&bytes);
            if checksum != meta.units_sha256 {
                return Err(corrupt(
                    &units_path,
                    format!(
                        "checksum mismatch (expected {}, found {})",
                        meta.units_sha256, checksum
                    ),
                ));
            }

            let units: Vec<EmbeddedUnit> =
                serde_json::from_slice(&bytes).map_err(|e| corrupt(&units_path, e))?;
            if units.len() != meta.unit_count {
                return Err(corrupt(
                    &units_path,
                    format!(
                        "expected {} units, found {}",
                        meta.unit_count,
                        units.len()
                    ),
                ));
            }

            let count = units.len();
            let index =
                FlatIndex::from_units(meta.dimension, units).map_err(|e| corrupt(&units_path, e))?;
            if index.len() != count {
                return Err(corrupt(&units_path, "duplicate unit ids"));
            }

            tracing::debug!(
                "Loaded index generation {} ({} units)",
                meta.generation,
                index.len()
            );
            return Ok(Some(LoadedIndex { meta, index }));
        }
    }

    /// Persist `index` as a new generation and make it the committed one
    pub fn commit(
        &self,
        index: &FlatIndex,
        sync_point: &SyncPoint,
        embedding_model: &str,
    ) -> Result<IndexMeta, StorageError> {
        let dir = self.layout.index_dir();
        fs::create_dir_all(dir).map_err(|source| commit_failed(dir, source))?;
        self.remove_stale_temp_files();

        let generation = self.latest_generation_on_disk()? + 1;
        let units: Vec<&EmbeddedUnit> = index.iter().collect();
        let bytes =
            serde_json::to_vec(&units).map_err(|e| StorageError::Serialize(e.to_string()))?;

        let units_path = self.layout.units_path(generation);
        write_atomic(&units_path, &bytes)?;

        let meta = IndexMeta {
            format_version: FORMAT_VERSION,
            generation,
            sync_point: sync_point.clone(),
            embedding_model: embedding_model.to_string(),
            dimension: index.dimension(),
            unit_count: units.len(),
            units_file: StorageLayout::units_file_name(generation),
            units_sha256: sha256_hex(&bytes),
            committed_at: chrono::Utc::now().to_rfc3339(),
        };
        let meta_bytes =
            serde_json::to_vec_pretty(&meta).map_err(|e| StorageError::Serialize(e.to_string()))?;
        write_atomic(&self.layout.meta_path(), &meta_bytes)?;
        sync_dir(dir);

        self.prune(generation);

        tracing::info!(
            "Committed index generation {} ({} units) at {}",
            generation,
            meta.unit_count,
            meta.sync_point
        );
        Ok(meta)
    }

    /// Highest generation named by a units file or the current meta
    fn latest_generation_on_disk(&self) -> Result<u64, StorageError> {
        let dir = self.layout.index_dir();
        let entries = fs::read_dir(dir).map_err(|source| commit_failed(dir, source))?;
        let from_files = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                StorageLayout::parse_units_file_name(&entry.file_name().to_string_lossy())
            })
            .max()
            .unwrap_or(0);
        // an unreadable meta must not block a rebuild
        let from_meta = self
            .read_meta()
            .ok()
            .flatten()
            .map(|meta| meta.generation)
            .unwrap_or(0);
        Ok(from_files.max(from_meta))
    }

    /// Delete units files older than the previous generation
    fn prune(&self, current: u64) {
        let keep_from = current.saturating_sub(1);
        let Ok(entries) = fs::read_dir(self.layout.index_dir()) else {
            return;
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name();
            let Some(generation) = StorageLayout::parse_units_file_name(&name.to_string_lossy())
            else {
                continue;
            };
            if generation < keep_from {
                match fs::remove_file(entry.path()) {
                    Ok(()) => tracing::debug!("Pruned units generation {}", generation),
                    Err(e) => tracing::warn!("Failed to prune {:?}: {}", entry.path(), e),
                }
            }
        }
    }

    /// Temp files left behind by an interrupted commit
    fn remove_stale_temp_files(&self) {
        let Ok(entries) = fs::read_dir(self.layout.index_dir()) else {
            return;
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            if entry.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
                tracing::debug!("Removing stale temp file {:?}", entry.path());
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp).map_err(|source| commit_failed(&tmp, source))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|source| commit_failed(&tmp, source))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|source| commit_failed(path, source))
}

/// Make the renames durable
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::warn!("Failed to fsync index directory {:?}: {}", dir, e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn corrupt(path: &Path, reason: impl ToString) -> StorageError {
    StorageError::Corrupt {
        path: display(path),
        reason: reason.to_string(),
    }
}

fn commit_failed(path: &Path, source: io::Error) -> StorageError {
    StorageError::CommitFailed {
        path: display(path),
        source,
    }
}
