/// Centralized path computation for the on-disk index
///
/// Everything the crate writes lives under one storage directory inside the
/// repository:
///
/// ```text
/// <repo>/.autocommit_storage_dir/
///     rag.toml            optional configuration
///     api_key             optional credentials
///     rag_index/
///         meta.json       commit record
///         units-N.json    embedded units of generation N
///         sync.lock       cross-process writer lock
/// ```
use crate::config::StorageConfig;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "rag.toml";
const API_KEY_FILE: &str = "api_key";
const META_FILE: &str = "meta.json";
const LOCK_FILE: &str = "sync.lock";
const UNITS_PREFIX: &str = "units-";
const UNITS_SUFFIX: &str = ".json";

/// Resolved locations of one repository's storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    repo_root: PathBuf,
    storage_dir: PathBuf,
    index_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(repo_root: &Path, storage: &StorageConfig) -> Self {
        let storage_dir = repo_root.join(&storage.dir);
        let index_dir = storage_dir.join(&storage.index_dir_name);
        Self {
            repo_root: repo_root.to_path_buf(),
            storage_dir,
            index_dir,
        }
    }

    /// Layout rooted at an index directory, for callers without a repository
    pub fn for_index_dir(index_dir: &Path) -> Self {
        let storage_dir = index_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| index_dir.to_path_buf());
        Self {
            repo_root: storage_dir.clone(),
            storage_dir,
            index_dir: index_dir.to_path_buf(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join(CONFIG_FILE)
    }

    pub fn api_key_path(&self) -> PathBuf {
        self.storage_dir.join(API_KEY_FILE)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.index_dir.join(META_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.index_dir.join(LOCK_FILE)
    }

    /// File name of the units file for a generation
    pub fn units_file_name(generation: u64) -> String {
        format!("{}{:08}{}", UNITS_PREFIX, generation, UNITS_SUFFIX)
    }

    pub fn units_path(&self, generation: u64) -> PathBuf {
        self.index_dir.join(Self::units_file_name(generation))
    }

    /// Generation encoded in a units file name, if it is one
    pub fn parse_units_file_name(name: &str) -> Option<u64> {
        name.strip_prefix(UNITS_PREFIX)?
            .strip_suffix(UNITS_SUFFIX)?
            .parse()
            .ok()
    }

    /// Storage directory as a repository-relative `/`-separated prefix, used to
    /// keep the index from indexing itself
    pub fn storage_prefix(&self) -> Option<String> {
        let relative = self.storage_dir.strip_prefix(&self.repo_root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// User-level configuration file
    ///
    /// Returns: {config_dir}/autocommit/rag.toml
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("autocommit").join(CONFIG_FILE))
    }
}
