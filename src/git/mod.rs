//! Git repository access
//!
//! Reads the tree of a commit for indexing and the staged change that a
//! commit message is about to describe.

/// Tree source over a git repository
pub mod tree;

pub use tree::GitTreeSource;
