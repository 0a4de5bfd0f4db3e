use super::budget::{TokenEstimator, default_estimator, estimator_from_config, hard_cut};
use super::filter::PathFilter;
use super::{SourceEntry, hash_bytes, looks_binary};
use crate::config::ChunkingConfig;
use crate::error::{ChunkingError, ConfigError};
use crate::types::{SkipReason, SkippedFile, Span, Unit};
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

/// Result of chunking one source entry
#[derive(Debug, Clone, PartialEq)]
pub enum FileChunks {
    /// Units in file order
    Chunked(Vec<Unit>),
    Skipped(SkipReason),
}

/// Result of chunking a whole tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkedTree {
    /// Sorted by `(source_path, span.start_byte)`
    pub units: Vec<Unit>,
    /// Sorted by path
    pub skipped: Vec<SkippedFile>,
}

/// Turns source files into indexable units.
///
/// A file that fits the unit budget is one unit. Larger files are split
/// greedily at line boundaries; a single line above the budget is cut at
/// character boundaries.
#[derive(Clone)]
pub struct Chunker {
    max_unit_tokens: usize,
    estimator: Arc<dyn TokenEstimator>,
    filter: PathFilter,
}

impl Chunker {
    pub fn new(max_unit_tokens: usize, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            max_unit_tokens: max_unit_tokens.max(1),
            estimator,
            filter: PathFilter::none(),
        }
    }

    /// Chunker for a configuration; `storage_prefix` is the repository-relative
    /// storage directory, which is never indexed
    pub fn from_config(
        config: &ChunkingConfig,
        storage_prefix: Option<String>,
    ) -> Result<Self, ConfigError> {
        let filter = PathFilter::new(&config.exclude_patterns, storage_prefix)?;
        Ok(Self::new(config.max_unit_tokens, estimator_from_config(config)?).with_filter(filter))
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn max_unit_tokens(&self) -> usize {
        self.max_unit_tokens
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Chunk a single entry
    pub fn chunk_entry(&self, entry: &SourceEntry) -> Result<FileChunks, ChunkingError> {
        if entry.path.is_empty() {
            return Err(ChunkingError::EmptyPath);
        }
        if entry.path.starts_with('/') || std::path::Path::new(&entry.path).is_absolute() {
            return Err(ChunkingError::AbsolutePath(entry.path.clone()));
        }

        if self.filter.is_excluded(&entry.path) {
            return Ok(FileChunks::Skipped(SkipReason::Excluded));
        }
        if entry.is_binary || looks_binary(&entry.content) {
            return Ok(FileChunks::Skipped(SkipReason::Binary));
        }
        let Ok(text) = std::str::from_utf8(&entry.content) else {
            return Ok(FileChunks::Skipped(SkipReason::NotUtf8));
        };
        if text.trim().is_empty() {
            return Ok(FileChunks::Skipped(SkipReason::Empty));
        }

        let file_hash = hash_bytes(&entry.content);
        let mut seen = HashSet::new();
        let mut units = Vec::new();
        let mut line = 1usize;
        let mut cursor = 0usize;

        for (start, end) in self.split_ranges(text) {
            line += text[cursor..start].matches('\n').count();
            cursor = start;

            let piece = &text[start..end];
            if piece.trim().is_empty() {
                continue;
            }

            let body_newlines = piece.trim_end_matches('\n').matches('\n').count();
            let span = Span {
                start_line: line,
                end_line: line + body_newlines,
                start_byte: start,
                end_byte: end,
            };
            let unit = Unit::new(entry.path.as_str(), span, piece, file_hash.as_str());
            if seen.insert(unit.id.clone()) {
                units.push(unit);
            } else {
                tracing::debug!(
                    "Dropping duplicate chunk in {} at line {}",
                    entry.path,
                    span.start_line
                );
            }
        }

        Ok(FileChunks::Chunked(units))
    }

    /// Chunk every entry in parallel
    pub fn chunk_tree(&self, entries: &[SourceEntry]) -> Result<ChunkedTree, ChunkingError> {
        let results: Vec<(&str, FileChunks)> = entries
            .par_iter()
            .map(|entry| {
                self.chunk_entry(entry)
                    .map(|chunks| (entry.path.as_str(), chunks))
            })
            .collect::<Result<_, ChunkingError>>()?;

        let mut tree = ChunkedTree::default();
        for (path, chunks) in results {
            match chunks {
                FileChunks::Chunked(units) => tree.units.extend(units),
                FileChunks::Skipped(reason) => {
                    tracing::debug!("Skipping {} ({})", path, reason);
                    tree.skipped.push(SkippedFile {
                        path: path.to_string(),
                        reason,
                    });
                }
            }
        }

        tree.units.sort_by(|a, b| {
            a.source_path
                .cmp(&b.source_path)
                .then(a.span.start_byte.cmp(&b.span.start_byte))
        });
        tree.skipped.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(tree)
    }

    /// Consecutive, non-overlapping byte ranges covering `text`, each within
    /// budget
    fn split_ranges(&self, text: &str) -> Vec<(usize, usize)> {
        let budget = self.max_unit_tokens;
        let est = self.estimator.as_ref();

        if est.estimate(text) <= budget {
            return vec![(0, text.len())];
        }

        let mut ranges = Vec::new();
        let mut start = 0usize;
        let mut end = 0usize;

        for line in text.split_inclusive('\n') {
            let line_start = end.max(start);
            let line_end = line_start + line.len();

            if est.estimate(&text[start..line_end]) <= budget {
                end = line_end;
                continue;
            }

            if end > start {
                ranges.push((start, end));
                start = end;
            }

            if est.estimate(&text[start..line_end]) <= budget {
                end = line_end;
                continue;
            }

            // One line above the budget on its own
            let mut cut_start = start;
            while cut_start < line_end {
                let cut = hard_cut(&text[cut_start..line_end], budget, est);
                let mut cut_end = cut_start + cut.len();
                if cut_end == cut_start {
                    // A single char over budget still has to make progress
                    cut_end += text[cut_start..]
                        .chars()
                        .next()
                        .map(char::len_utf8)
                        .unwrap_or(1);
                }
                ranges.push((cut_start, cut_end));
                cut_start = cut_end;
            }
            start = line_end;
            end = line_end;
        }

        if end > start {
            ranges.push((start, end));
        }
        ranges
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkingConfig::default().max_unit_tokens, default_estimator())
    }
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("max_unit_tokens", &self.max_unit_tokens)
            .field("filter", &self.filter)
            .finish()
    }
}
