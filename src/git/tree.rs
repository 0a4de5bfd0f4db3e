use crate::error::{GitError, RagError};
use crate::indexer::{SourceEntry, TreeSnapshot, TreeSource};
use crate::types::SyncPoint;
use git2::{DiffFormat, DiffOptions, ObjectType, Oid, Repository, TreeWalkMode, TreeWalkResult};
use std::path::{Path, PathBuf};

const SYMLINK_MODE: i32 = 0o120000;

/// Tree source reading committed content through libgit2.
///
/// `git2::Repository` is not `Sync`, so the repository is reopened for each
/// operation; opening is cheap compared to reading a tree.
#[derive(Debug, Clone)]
pub struct GitTreeSource {
    repo_path: PathBuf,
}

impl GitTreeSource {
    /// Discover and open a git repository from any path within it
    pub fn discover<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let path = path.as_ref();
        let repo = Repository::discover(path)
            .map_err(|e| GitError::RepoNotFound(format!("{}: {}", path.display(), e.message())))?;

        let repo_path = match repo.workdir() {
            Some(workdir) => workdir.to_path_buf(),
            None => repo.path().to_path_buf(),
        };

        tracing::debug!("Opened git repository at: {}", repo_path.display());
        Ok(Self { repo_path })
    }

    /// Repository root (the working directory, or the git dir when bare)
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn open(&self) -> Result<Repository, GitError> {
        Repository::open(&self.repo_path).map_err(|e| {
            GitError::RepoNotFound(format!("{}: {}", self.repo_path.display(), e.message()))
        })
    }

    fn resolve_commit(repo: &Repository, reference: &str) -> Result<Oid, GitError> {
        let object = repo
            .revparse_single(reference)
            .map_err(|e| GitError::RefNotFound {
                reference: reference.to_string(),
                reason: e.message().to_string(),
            })?;
        let commit = object.peel_to_commit().map_err(|e| GitError::RefNotFound {
            reference: reference.to_string(),
            reason: e.message().to_string(),
        })?;
        Ok(commit.id())
    }

    fn read_tree(repo: &Repository, commit_id: Oid) -> Result<Vec<SourceEntry>, GitError> {
        let tree = repo.find_commit(commit_id)?.tree()?;
        let mut entries = Vec::new();
        let mut failure: Option<GitError> = None;

        let walked = tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() != Some(ObjectType::Blob) || entry.filemode() == SYMLINK_MODE {
                return TreeWalkResult::Ok;
            }
            let Some(name) = entry.name() else {
                tracing::debug!("Skipping tree entry with a non UTF-8 name under '{}'", root);
                return TreeWalkResult::Ok;
            };

            match repo.find_blob(entry.id()) {
                Ok(blob) => {
                    entries.push(SourceEntry {
                        path: format!("{}{}", root, name),
                        content: blob.content().to_vec(),
                        is_binary: blob.is_binary(),
                    });
                    TreeWalkResult::Ok
                }
                Err(e) => {
                    failure = Some(GitError::TreeFailed(format!(
                        "blob {}{}: {}",
                        root,
                        name,
                        e.message()
                    )));
                    TreeWalkResult::Abort
                }
            }
        });

        // An aborted walk reports a generic error; prefer the recorded cause
        if let Some(err) = failure {
            return Err(err);
        }
        walked?;

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Staged changes against `HEAD` as unified patch text.
    ///
    /// This is the pending change a commit message describes. An unborn
    /// `HEAD` diffs against the empty tree.
    pub fn pending_diff(&self) -> Result<String, GitError> {
        let repo = self.open()?;
        let head_tree = match repo.head() {
            Ok(head) => Some(head.peel_to_tree()?),
            Err(e)
                if matches!(
                    e.code(),
                    git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound
                ) =>
            {
                None
            }
            Err(e) => return Err(GitError::DiffFailed(e.message().to_string())),
        };
        let index = repo.index()?;

        let mut opts = DiffOptions::new();
        opts.context_lines(3).ignore_whitespace(false);

        let diff = repo
            .diff_tree_to_index(head_tree.as_ref(), Some(&index), Some(&mut opts))
            .map_err(|e| GitError::DiffFailed(e.message().to_string()))?;

        let mut patch = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            let content = String::from_utf8_lossy(line.content());
            match line.origin() {
                origin @ ('+' | '-' | ' ') => {
                    patch.push(origin);
                    patch.push_str(&content);
                }
                // File headers, hunk headers and binary notices carry their own text
                'F' | 'H' | 'B' => patch.push_str(&content),
                _ => {}
            }
            true
        })
        .map_err(|e| GitError::DiffFailed(e.message().to_string()))?;

        Ok(patch)
    }
}

impl TreeSource for GitTreeSource {
    fn resolve(&self, reference: &str) -> Result<String, RagError> {
        let repo = self.open()?;
        Ok(Self::resolve_commit(&repo, reference)?.to_string())
    }

    fn entries(&self, reference: &str) -> Result<Vec<SourceEntry>, RagError> {
        let repo = self.open()?;
        let commit_id = Self::resolve_commit(&repo, reference)?;
        Ok(Self::read_tree(&repo, commit_id)?)
    }

    fn snapshot(&self, reference: &str) -> Result<TreeSnapshot, RagError> {
        let repo = self.open()?;
        let commit_id = Self::resolve_commit(&repo, reference)?;
        let entries = Self::read_tree(&repo, commit_id)?;
        tracing::debug!(
            "Read {} files from {} ({})",
            entries.len(),
            reference,
            commit_id
        );
        Ok(TreeSnapshot {
            sync_point: SyncPoint::new(reference, commit_id.to_string()),
            entries,
        })
    }
}
