//! Working-directory tree source

use super::filter::PathFilter;
use super::{SourceEntry, TreeSnapshot, TreeSource, fingerprint, looks_binary};
use crate::error::{RagError, SyncError};
use crate::types::SyncPoint;
use ignore::WalkBuilder;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Walks a directory honoring `.gitignore`, for indexing uncommitted state.
///
/// The revision of a worktree is a fingerprint of its paths and contents, so
/// syncing an unchanged directory twice is a no-op.
pub struct WorktreeSource {
    pub(crate) root: PathBuf,
    pub(crate) max_file_size: usize,
    filter: PathFilter,
    /// Checked between entries; the walk stops early once cancelled
    cancel: Option<CancellationToken>,
}

impl WorktreeSource {
    pub fn new(root: impl AsRef<Path>, max_file_size: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_file_size,
            filter: PathFilter::none(),
            cancel: None,
        }
    }

    /// Paths the filter excludes are never read
    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// Walk the directory and collect all eligible files, sorted by path
    pub fn walk(&self) -> Result<Vec<SourceEntry>, RagError> {
        if !self.root.exists() {
            return Err(RagError::other(format!(
                "Root directory does not exist: {}",
                self.root.display()
            )));
        }
        if !self.root.is_dir() {
            return Err(RagError::other(format!(
                "Root path is not a directory: {}",
                self.root.display()
            )));
        }

        let mut entries = Vec::new();

        let walker = WalkBuilder::new(&self.root)
            .standard_filters(true) // Respect .gitignore, .ignore, etc.
            .hidden(false) // Don't skip hidden files by default
            .git_ignore(true)
            .git_exclude(true)
            .git_global(true)
            .require_git(false)
            .build();

        for entry in walker {
            if self.is_cancelled() {
                tracing::info!("Directory walk cancelled after {} files", entries.len());
                return Err(SyncError::Cancelled.into());
            }

            let entry = entry.map_err(|e| RagError::other(format!("Failed to read directory entry: {}", e)))?;
            let path = entry.path();

            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            let Some(relative_path) = relative_slash_path(&self.root, path) else {
                continue;
            };

            if self.filter.is_excluded(&relative_path) {
                tracing::debug!("Skipping excluded file: {}", relative_path);
                continue;
            }

            if let Ok(metadata) = fs::metadata(path)
                && metadata.len() > self.max_file_size as u64
            {
                tracing::debug!("Skipping large file: {}", relative_path);
                continue;
            }

            let content = match fs::read(path) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path.display(), e);
                    continue;
                }
            };

            let is_binary = looks_binary(&content);
            entries.push(SourceEntry {
                path: relative_path,
                content,
                is_binary,
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::debug!("Found {} files under {}", entries.len(), self.root.display());
        Ok(entries)
    }
}

impl TreeSource for WorktreeSource {
    fn resolve(&self, _reference: &str) -> Result<String, RagError> {
        Ok(fingerprint(&self.walk()?))
    }

    fn entries(&self, _reference: &str) -> Result<Vec<SourceEntry>, RagError> {
        self.walk()
    }

    fn snapshot(&self, reference: &str) -> Result<TreeSnapshot, RagError> {
        let entries = self.walk()?;
        Ok(TreeSnapshot {
            sync_point: SyncPoint::new(reference, fingerprint(&entries)),
            entries,
        })
    }
}

/// `path` relative to `root`, with `/` separators
fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
