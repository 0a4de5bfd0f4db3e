use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content-addressed identifier of a [`Unit`].
///
/// Hex SHA-256 over the source path, a NUL separator and the unit text, so it
/// changes exactly when the text changes and never collides across paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn from_content(source_path: &str, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Location of a unit inside its source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    /// First line (1-based, inclusive)
    pub start_line: usize,
    /// Last line (1-based, inclusive)
    pub end_line: usize,
    /// Byte offset of the first byte (0-based, inclusive)
    pub start_byte: usize,
    /// Byte offset one past the last byte
    pub end_byte: usize,
}

/// The atomic indexable item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    /// Repository-relative path with `/` separators
    pub source_path: String,
    pub span: Span,
    /// The exact text that is embedded
    pub text: String,
    /// SHA-256 of the whole source file
    pub file_hash: String,
}

impl Unit {
    pub fn new(
        source_path: impl Into<String>,
        span: Span,
        text: impl Into<String>,
        file_hash: impl Into<String>,
    ) -> Self {
        let source_path = source_path.into();
        let text = text.into();
        Self {
            id: UnitId::from_content(&source_path, &text),
            source_path,
            span,
            text,
            file_hash: file_hash.into(),
        }
    }
}

/// A unit together with its embedding; the only thing the index stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedUnit {
    #[serde(flatten)]
    pub unit: Unit,
    pub vector: Vec<f32>,
}

impl EmbeddedUnit {
    pub fn new(unit: Unit, vector: Vec<f32>) -> Self {
        Self { unit, vector }
    }

    pub fn id(&self) -> &UnitId {
        &self.unit.id
    }
}

/// Marker of the repository state an index reflects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    /// Reference as requested by the caller (e.g. `HEAD`)
    pub reference: String,
    /// Resolved revision: a commit id or a working-tree fingerprint
    pub revision: String,
    /// False when some units of this revision failed to embed
    pub complete: bool,
}

impl SyncPoint {
    pub fn new(reference: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            revision: revision.into(),
            complete: true,
        }
    }

    pub fn incomplete(mut self) -> Self {
        self.complete = false;
        self
    }

    /// Same repository state, regardless of completeness
    pub fn same_revision(&self, other: &SyncPoint) -> bool {
        self.revision == other.revision
    }
}

impl fmt::Display for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = &self.revision[..self.revision.len().min(12)];
        write!(f, "{}@{}", self.reference, short)?;
        if !self.complete {
            f.write_str(" (incomplete)")?;
        }
        Ok(())
    }
}

/// Why a source entry produced no units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Flagged binary by the tree source or by content sniffing
    Binary,
    /// Bytes are not valid UTF-8
    NotUtf8,
    /// Empty or whitespace-only
    Empty,
    /// Storage directory or an exclude pattern
    Excluded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::Binary => "binary",
            SkipReason::NotUtf8 => "not utf-8",
            SkipReason::Empty => "empty",
            SkipReason::Excluded => "excluded",
        };
        f.write_str(s)
    }
}

/// A file the chunker did not turn into units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: SkipReason,
}

/// A stored unit returned by a similarity query
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub unit: Unit,
    /// Cosine similarity in [-1, 1]
    pub score: f32,
}

/// A retrieved snippet ready for prompt assembly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub source_path: String,
    pub span: Span,
    pub text: String,
    pub score: f32,
}

impl Snippet {
    /// Header line plus text, the layout the commit-message prompt expects
    pub fn to_prompt_string(&self) -> String {
        format!(
            "----{}: l.{} to l.{}-----\n{}",
            self.source_path, self.span.start_line, self.span.end_line, self.text
        )
    }
}

impl From<SearchHit> for Snippet {
    fn from(hit: SearchHit) -> Self {
        Self {
            source_path: hit.unit.source_path,
            span: hit.unit.span,
            text: hit.unit.text,
            score: hit.score,
        }
    }
}

/// How a sync run treated the existing index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Started from an empty index (first run, rebuild, or incompatible index)
    Full,
    /// Applied a delta to the committed index
    Incremental,
    /// Nothing changed; nothing was written
    Unchanged,
}

/// Outcome of a successful sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub sync_point: SyncPoint,
    pub mode: SyncMode,
    /// Units in the target tree
    pub units_total: usize,
    /// Units embedded and inserted by this run
    pub units_added: usize,
    /// Units removed by this run
    pub units_removed: usize,
    /// Units that were already indexed
    pub units_unchanged: usize,
    /// Files that produced no units
    pub skipped: Vec<SkippedFile>,
    pub duration_ms: u64,
}

/// A unit the synchronizer could not embed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub id: UnitId,
    pub source_path: String,
    pub span: Span,
    pub error: String,
}

/// Successes committed plus the failed subset, to be retried by the next sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialSyncReport {
    pub sync_point: SyncPoint,
    /// Units embedded and committed
    pub embedded: usize,
    pub removed: usize,
    pub failed: Vec<FailedUnit>,
}

/// Summary of a committed index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub units: usize,
    pub files: usize,
    pub dimension: Option<usize>,
    pub generation: u64,
    pub sync_point: Option<SyncPoint>,
    pub embedding_model: String,
    pub committed_at: String,
}

#[cfg(test)]
mod tests;
