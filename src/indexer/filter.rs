//! Glob pattern matching for excluded paths

use crate::error::ConfigError;
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Decides which repository-relative paths are never indexed: the storage
/// directory, anything under `.git`, and configured exclude globs.
#[derive(Debug, Clone)]
pub struct PathFilter {
    storage_prefix: Option<String>,
    excludes: GlobSet,
    pattern_count: usize,
}

impl PathFilter {
    /// Compile exclude patterns
    ///
    /// Patterns are matched against the whole relative path and against every
    /// suffix of it, so `target/**` also excludes `crates/a/target/x`.
    pub fn new(patterns: &[String], storage_prefix: Option<String>) -> Result<Self, ConfigError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| ConfigError::InvalidValue {
                key: "chunking.exclude_patterns".to_string(),
                reason: format!("invalid glob '{}': {}", pattern, e),
            })?;
            builder.add(glob);
        }
        let excludes = builder.build().map_err(|e| ConfigError::InvalidValue {
            key: "chunking.exclude_patterns".to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            storage_prefix: storage_prefix.map(|p| p.trim_matches('/').to_string()),
            excludes,
            pattern_count: patterns.len(),
        })
    }

    /// Filter that only guards `.git`
    pub fn none() -> Self {
        Self {
            storage_prefix: None,
            excludes: GlobSet::empty(),
            pattern_count: 0,
        }
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');

        if let Some(prefix) = &self.storage_prefix
            && !prefix.is_empty()
            && (path == prefix || path.starts_with(&format!("{}/", prefix)))
        {
            return true;
        }

        if path.split('/').any(|part| part == ".git") {
            return true;
        }

        if self.pattern_count == 0 {
            return false;
        }

        let parts: Vec<&str> = path.split('/').collect();
        (0..parts.len()).any(|i| self.excludes.is_match(parts[i..].join("/")))
    }
}

impl Default for PathFilter {
    fn default() -> Self {
        Self::none()
    }
}
