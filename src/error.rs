/// Centralized error types for autocommit-rag using thiserror
///
/// Transient service errors are retried, content problems are skip conditions
/// (see `indexer::SkipReason`), persistence and configuration errors are fatal
/// for the current attempt.
use crate::types::{PartialSyncReport, SyncPoint};
use std::time::Duration;
use thiserror::Error;

/// Main error type for the retrieval subsystem
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Vector store error: {0}")]
    VectorDb(#[from] VectorDbError),

    #[error("Index storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Chunking error: {0}")]
    Chunking(#[from] ChunkingError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors raised while talking to the embedding service.
///
/// Variants carry strings rather than source errors so a single failure can
/// be attached to every slot of the batch it belongs to.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("No API key found; set an api_key_file, $MISTRAL_API_KEY or <storage>/api_key")]
    MissingCredentials,

    #[error("Embedding service rejected the credentials: {0}")]
    Unauthorized(String),

    #[error("Embedding service rate limit hit")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient embedding service failure: {0}")]
    Transient(String),

    #[error("Embedding request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Embedding service rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("Invalid embedding dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        last: Box<EmbeddingError>,
    },
}

impl EmbeddingError {
    /// Errors that must stop all further requests (bad or missing credentials)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EmbeddingError::MissingCredentials | EmbeddingError::Unauthorized(_)
        )
    }

    /// Errors worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmbeddingError::RateLimited { .. }
                | EmbeddingError::Transient(_)
                | EmbeddingError::Timeout(_)
        )
    }
}

/// Errors related to the in-memory vector store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorDbError {
    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Vector for unit '{0}' has zero norm")]
    ZeroVector(String),

    #[error("Vector for unit '{0}' contains non-finite values")]
    NonFinite(String),
}

/// Errors related to the on-disk index
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Index format version {found} does not match expected version {expected}")]
    FormatMismatch { found: u32, expected: u32 },

    #[error("Index at '{path}' is corrupted: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Failed to read index file '{path}': {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to commit index to '{path}': {source}")]
    CommitFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize index: {0}")]
    Serialize(String),

    #[error("Index store rejected a unit: {0}")]
    InvalidUnit(#[from] VectorDbError),
}

/// Errors related to chunking a single source entry
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChunkingError {
    #[error("Source entry has an empty path")]
    EmptyPath,

    #[error("Source path must be repository-relative: {0}")]
    AbsolutePath(String),
}

/// Errors returned by the index synchronizer
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Another process is synchronizing the index at '{0}'")]
    Busy(String),

    #[error("Synchronization was cancelled")]
    Cancelled,

    #[error("Sync committed {} units for {} but {} failed to embed", .0.embedded, .0.sync_point, .0.failed.len())]
    Partial(Box<PartialSyncReport>),

    #[error("Failed to read the source tree: {0}")]
    Source(String),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// The sync point committed despite the error, if any
    pub fn committed_sync_point(&self) -> Option<&SyncPoint> {
        match self {
            SyncError::Partial(report) => Some(&report.sync_point),
            _ => None,
        }
    }
}

/// Errors related to configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {0}")]
    LoadFailed(String),

    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

/// Errors related to git operations
#[derive(Error, Debug)]
pub enum GitError {
    #[error("Git repository not found at: {0}")]
    RepoNotFound(String),

    #[error("Failed to resolve git reference '{reference}': {reason}")]
    RefNotFound { reference: String, reason: String },

    #[error("Failed to read git tree: {0}")]
    TreeFailed(String),

    #[error("Failed to compute diff: {0}")]
    DiffFailed(String),
}

impl From<git2::Error> for GitError {
    fn from(err: git2::Error) -> Self {
        GitError::TreeFailed(err.message().to_string())
    }
}

// Conversion from anyhow::Error to RagError
impl From<anyhow::Error> for RagError {
    fn from(err: anyhow::Error) -> Self {
        RagError::Other(format!("{:#}", err))
    }
}

impl RagError {
    /// Create a new error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        RagError::Other(msg.into())
    }

    /// Configuration problems the caller has to fix before anything works
    pub fn is_fatal(&self) -> bool {
        match self {
            RagError::Config(_) => true,
            RagError::Embedding(e) => e.is_fatal(),
            RagError::Sync(SyncError::Embedding(e)) => e.is_fatal(),
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RagError::Embedding(e) => e.is_retryable(),
            RagError::Sync(SyncError::Busy(_)) | RagError::Sync(SyncError::Partial(_)) => true,
            RagError::Io(_) => true,
            _ => false,
        }
    }
}
