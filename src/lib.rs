//! # autocommit-rag - Repository Context for Commit Messages
//!
//! Keeps a vector index of a repository's source files in step with a git
//! reference (or the working tree), and retrieves the snippets most similar
//! to a pending diff so they can be added to a commit-message prompt.
//!
//! ## Overview
//!
//! Files are split into units that fit the embedding model's input limit.
//! Every unit has a content-derived id, so a sync only embeds units whose
//! text changed and removes units that disappeared. The index is committed
//! atomically; readers always see a complete generation.
//!
//! ## Architecture
//!
//! ```text
//!  TreeSource (git / worktree)
//!          |
//!          v
//!      Chunker ----> EmbeddingAdapter ----> EmbeddingProvider (Mistral)
//!          |               |
//!          v               v
//!   IndexSynchronizer --> IndexStorage (meta.json + units-N.json)
//!                              |
//!                              v
//!                         Retriever --> Snippets
//! ```
//!
//! ## Modules
//!
//! - [`indexer`]: tree sources, chunking, token budgets, query truncation
//! - [`git`]: git trees and the staged diff
//! - [`embedding`]: providers, rate limiting, batching and retry
//! - [`vector_db`]: flat cosine index and its on-disk storage
//! - [`sync`]: the single writer, its lock and the background worker
//! - [`retriever`]: best-effort top-k search
//! - [`config`]: configuration with environment variable support
//! - [`types`]: domain types shared by every module
//! - [`error`]: error types
//! - [`paths`]: on-disk layout
//!
//! ## Usage Example
//!
//! ```no_run
//! use autocommit_rag::{Config, GitTreeSource, IndexSynchronizer, Retriever, SyncOptions};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let repo = Path::new(".");
//!     let config = Config::new(repo)?;
//!
//!     let synchronizer = IndexSynchronizer::from_config(&config, repo)?;
//!     let source = Arc::new(GitTreeSource::discover(repo)?);
//!     synchronizer.sync(source.clone(), "HEAD", &SyncOptions::default()).await?;
//!
//!     let retriever = Retriever::from_config(&config, repo)?;
//!     let diff = source.pending_diff()?;
//!     for snippet in retriever.retrieve(&diff, 5).await? {
//!         println!("{}", snippet.to_prompt_string());
//!     }
//!     Ok(())
//! }
//! ```

/// Configuration management with environment variable overrides
pub mod config;

/// Embedding providers and the batching/retry adapter
pub mod embedding;

/// Error types and utilities
pub mod error;

/// Git trees and staged diffs
pub mod git;

/// Tree sources, chunking and token budgets
pub mod indexer;

/// On-disk layout of the storage directory
pub mod paths;

/// Top-k retrieval over the committed index
pub mod retriever;

/// Index synchronization, locking and the background worker
pub mod sync;

/// Domain types
pub mod types;

/// Flat cosine index and atomic persistence
pub mod vector_db;

pub use config::Config;
pub use error::{RagError, SyncError};
pub use git::GitTreeSource;
pub use indexer::{StaticTree, TreeSource, WorktreeSource};
pub use retriever::{Retriever, render_context};
pub use sync::{IndexSynchronizer, SyncOptions, SyncWorker};
pub use types::{Snippet, SyncPoint, SyncReport};
