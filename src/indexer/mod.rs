//! Source trees, chunking and token budgets
//!
//! Provides the views of repository content the synchronizer indexes (a git
//! tree, the working directory, or an in-memory map) and turns their files
//! into units for embedding.

pub mod budget;
mod chunker;
pub mod diff;
mod file_walker;
mod filter;

pub use budget::{
    CharRatioEstimator, TiktokenEstimator, TokenEstimator, default_estimator,
    estimator_from_config, hard_cut,
};
pub use chunker::{ChunkedTree, Chunker, FileChunks};
pub use diff::{compute_truncation, truncate_query};
pub use file_walker::WorktreeSource;
pub use filter::PathFilter;

use crate::error::RagError;
use crate::types::SyncPoint;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// One file of a source tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Repository-relative path with `/` separators
    pub path: String,
    pub content: Vec<u8>,
    /// Set when the source already knows the content is binary
    pub is_binary: bool,
}

impl SourceEntry {
    pub fn new(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content,
            is_binary: false,
        }
    }

    pub fn text(path: impl Into<String>, content: &str) -> Self {
        Self::new(path, content.as_bytes().to_vec())
    }

    pub fn binary(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content,
            is_binary: true,
        }
    }
}

/// A resolved tree: the sync point it corresponds to and its files
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    pub sync_point: SyncPoint,
    pub entries: Vec<SourceEntry>,
}

/// Read access to a repository state.
///
/// Implementations do blocking I/O; async callers run them on the blocking
/// pool.
pub trait TreeSource: Send + Sync {
    /// Resolve a reference to a revision identifier
    fn resolve(&self, reference: &str) -> Result<String, RagError>;

    /// List every file of the tree a reference resolves to
    fn entries(&self, reference: &str) -> Result<Vec<SourceEntry>, RagError>;

    /// Resolve and list in one step
    fn snapshot(&self, reference: &str) -> Result<TreeSnapshot, RagError> {
        let revision = self.resolve(reference)?;
        let entries = self.entries(&revision)?;
        Ok(TreeSnapshot {
            sync_point: SyncPoint::new(reference, revision),
            entries,
        })
    }
}

/// In-memory tree, for callers that already hold the files
#[derive(Debug, Clone, Default)]
pub struct StaticTree {
    files: BTreeMap<String, Vec<u8>>,
}

impl StaticTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.insert(path, content);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), content.into());
    }

    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.files.remove(path)
    }

    fn to_entries(&self) -> Vec<SourceEntry> {
        self.files
            .iter()
            .map(|(path, content)| SourceEntry::new(path.clone(), content.clone()))
            .collect()
    }
}

impl TreeSource for StaticTree {
    fn resolve(&self, _reference: &str) -> Result<String, RagError> {
        Ok(fingerprint(&self.to_entries()))
    }

    fn entries(&self, _reference: &str) -> Result<Vec<SourceEntry>, RagError> {
        Ok(self.to_entries())
    }

    fn snapshot(&self, reference: &str) -> Result<TreeSnapshot, RagError> {
        let entries = self.to_entries();
        Ok(TreeSnapshot {
            sync_point: SyncPoint::new(reference, fingerprint(&entries)),
            entries,
        })
    }
}

/// Revision identifier of a tree without version control: hash of every path
/// and content hash, in path order
pub fn fingerprint(entries: &[SourceEntry]) -> String {
    let mut sorted: Vec<&SourceEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for entry in sorted {
        hasher.update(entry.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash_bytes(&entry.content).as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

pub(crate) fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Binary heuristic: a NUL byte, or more than 30% control characters
pub(crate) fn looks_binary(content: &[u8]) -> bool {
    if content.is_empty() {
        return false;
    }
    let sample = &content[..content.len().min(8192)];
    if sample.contains(&0) {
        return true;
    }
    let non_printable = sample
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();
    (non_printable as f64 / sample.len() as f64) >= 0.3
}
