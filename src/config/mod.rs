/// Configuration system for autocommit-rag
///
/// Supports loading from multiple sources with priority:
/// Environment variables > `<storage>/rag.toml` > user config file > Defaults
use crate::error::{ConfigError, EmbeddingError, RagError};
use crate::paths::StorageLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "AUTOCOMMIT_RAG_";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Where the index lives inside the repository
    #[serde(default)]
    pub storage: StorageConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Synchronizer configuration
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Storage directory, relative to the repository root
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,

    /// Name of the index directory inside the storage directory
    #[serde(default = "default_index_dir_name")]
    pub index_dir_name: String,
}

/// Which embedding backend to use
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Remote Mistral-compatible embeddings endpoint
    Mistral,
    /// Offline feature-hashing embedder
    Hashing,
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mistral" => Ok(ProviderKind::Mistral),
            "hashing" => Ok(ProviderKind::Hashing),
            other => Err(format!("unknown embedding provider '{}'", other)),
        }
    }
}

/// How token budgets are measured
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    /// BPE token count with the `cl100k_base` encoding
    #[default]
    Cl100kBase,
    /// BPE token count with the `o200k_base` encoding
    O200kBase,
    /// `ceil(chars / chars_per_token)`, for models without a known encoding
    CharRatio,
}

impl std::str::FromStr for TokenizerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cl100k_base" => Ok(TokenizerKind::Cl100kBase),
            "o200k_base" => Ok(TokenizerKind::O200kBase),
            "char_ratio" => Ok(TokenizerKind::CharRatio),
            other => Err(format!("unknown tokenizer '{}'", other)),
        }
    }
}

/// Embedding service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,

    /// Base URL of the embeddings API; `/embeddings` is appended
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Vector dimension produced by the model
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// File holding the API key; takes precedence over the environment
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,

    /// Maximum number of texts per request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum estimated tokens per request
    #[serde(default = "default_max_batch_tokens")]
    pub max_batch_tokens: usize,

    /// Texts above this estimate are skipped rather than sent
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,

    /// Minimum gap between the end of one request and the start of the next
    #[serde(default = "default_rate_limit_interval_ms")]
    pub rate_limit_interval_ms: u64,

    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: usize,

    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: usize,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Timeout in seconds for a single request
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkingConfig {
    /// Token budget of a single unit
    #[serde(default = "default_max_unit_tokens")]
    pub max_unit_tokens: usize,

    /// Token counter used for every budget
    #[serde(default)]
    pub tokenizer: TokenizerKind,

    /// Characters per token when `tokenizer = "char_ratio"`
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,

    /// Glob patterns never indexed
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// Maximum file size to index (in bytes)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    /// Default number of snippets
    #[serde(default = "default_k")]
    pub k: usize,

    /// Hits below this cosine similarity are dropped
    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// Overall budget for embedding the query
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
}

/// Synchronizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Reference synchronized when none is given
    #[serde(default = "default_reference")]
    pub reference: String,

    /// How long to wait for another writer before giving up
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

// Default value functions
fn default_storage_dir() -> PathBuf {
    PathBuf::from(".autocommit_storage_dir")
}

fn default_index_dir_name() -> String {
    "rag_index".to_string()
}

fn default_provider() -> ProviderKind {
    ProviderKind::Mistral
}

fn default_endpoint() -> String {
    "https://api.mistral.ai/v1".to_string()
}

fn default_model_name() -> String {
    "mistral-embed".to_string()
}

fn default_dimension() -> usize {
    1024
}

fn default_api_key_env() -> String {
    "MISTRAL_API_KEY".to_string()
}

fn default_batch_size() -> usize {
    64
}

fn default_max_batch_tokens() -> usize {
    16_384
}

fn default_max_input_tokens() -> usize {
    8192
}

fn default_rate_limit_interval_ms() -> u64 {
    1100
}

fn default_max_rate_limit_retries() -> usize {
    5
}

fn default_max_transient_retries() -> usize {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_embedding_timeout() -> u64 {
    30
}

fn default_max_unit_tokens() -> usize {
    1024
}

fn default_chars_per_token() -> usize {
    3
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        "**/*.lock".to_string(),
        "**/node_modules/**".to_string(),
        "**/target/**".to_string(),
    ]
}

fn default_max_file_size() -> usize {
    1_048_576 // 1 MB
}

fn default_k() -> usize {
    5
}

fn default_min_score() -> f32 {
    0.0
}

fn default_retrieval_timeout() -> u64 {
    20
}

fn default_reference() -> String {
    "HEAD".to_string()
}

fn default_lock_timeout() -> u64 {
    600
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
            index_dir_name: default_index_dir_name(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: default_endpoint(),
            model_name: default_model_name(),
            dimension: default_dimension(),
            api_key_env: default_api_key_env(),
            api_key_file: None,
            batch_size: default_batch_size(),
            max_batch_tokens: default_max_batch_tokens(),
            max_input_tokens: default_max_input_tokens(),
            rate_limit_interval_ms: default_rate_limit_interval_ms(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            max_transient_retries: default_max_transient_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_unit_tokens: default_max_unit_tokens(),
            tokenizer: TokenizerKind::default(),
            chars_per_token: default_chars_per_token(),
            exclude_patterns: default_exclude_patterns(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            min_score: default_min_score(),
            timeout_secs: default_retrieval_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reference: default_reference(),
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn rate_limit_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Find the API key: `api_key_file`, then the `api_key_env` variable,
    /// then `<storage>/api_key`.
    ///
    /// Credentials are read on demand and never stored in the index.
    pub fn resolve_api_key(&self, storage_dir: &Path) -> Result<String, EmbeddingError> {
        if let Some(file) = &self.api_key_file
            && let Some(key) = read_key_file(file)
        {
            return Ok(key);
        }

        if let Ok(key) = std::env::var(&self.api_key_env) {
            let key = key.trim();
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }

        read_key_file(&storage_dir.join("api_key")).ok_or(EmbeddingError::MissingCredentials)
    }
}

fn read_key_file(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let key = content.trim();
    if key.is_empty() {
        tracing::warn!("API key file {} is empty", path.display());
        return None;
    }
    Some(key.to_string())
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SyncConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> Result<Self, RagError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseFailed(format!("Invalid TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load the repository's `rag.toml`, falling back to the user config file
    /// and then to defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self, RagError> {
        let repo_config = StorageLayout::new(repo_root, &StorageConfig::default()).config_path();
        if repo_config.exists() {
            tracing::info!("Loading config from: {}", repo_config.display());
            return Self::from_file(&repo_config);
        }

        if let Some(user_config) = StorageLayout::user_config_path()
            && user_config.exists()
        {
            tracing::info!("Loading config from: {}", user_config.display());
            return Self::from_file(&user_config);
        }

        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), RagError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::SaveFailed(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved config to: {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), RagError> {
        fn invalid(key: &str, reason: impl Into<String>) -> RagError {
            ConfigError::InvalidValue {
                key: key.to_string(),
                reason: reason.into(),
            }
            .into()
        }

        if self.storage.dir.as_os_str().is_empty() {
            return Err(invalid("storage.dir", "must not be empty"));
        }
        if self.storage.dir.is_absolute() {
            return Err(invalid(
                "storage.dir",
                format!(
                    "must be relative to the repository root, got '{}'",
                    self.storage.dir.display()
                ),
            ));
        }
        if self.storage.index_dir_name.is_empty() || self.storage.index_dir_name.contains('/') {
            return Err(invalid(
                "storage.index_dir_name",
                "must be a single path component",
            ));
        }

        if self.embedding.provider == ProviderKind::Mistral
            && !self.embedding.endpoint.starts_with("http://")
            && !self.embedding.endpoint.starts_with("https://")
        {
            return Err(invalid(
                "embedding.endpoint",
                format!("must be an http(s) URL, got '{}'", self.embedding.endpoint),
            ));
        }
        if self.embedding.model_name.trim().is_empty() {
            return Err(invalid("embedding.model_name", "must not be empty"));
        }
        for (key, value) in [
            ("embedding.dimension", self.embedding.dimension),
            ("embedding.batch_size", self.embedding.batch_size),
            ("embedding.max_batch_tokens", self.embedding.max_batch_tokens),
            ("embedding.max_input_tokens", self.embedding.max_input_tokens),
            ("chunking.max_unit_tokens", self.chunking.max_unit_tokens),
            ("chunking.chars_per_token", self.chunking.chars_per_token),
            ("chunking.max_file_size", self.chunking.max_file_size),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be greater than 0"));
            }
        }
        if self.embedding.max_input_tokens > self.embedding.max_batch_tokens {
            return Err(invalid(
                "embedding.max_input_tokens",
                format!(
                    "must not exceed embedding.max_batch_tokens ({})",
                    self.embedding.max_batch_tokens
                ),
            ));
        }
        if self.chunking.max_unit_tokens > self.embedding.max_input_tokens {
            return Err(invalid(
                "chunking.max_unit_tokens",
                format!(
                    "must not exceed embedding.max_input_tokens ({}), units would never be embedded",
                    self.embedding.max_input_tokens
                ),
            ));
        }
        if self.embedding.timeout_secs == 0 {
            return Err(invalid("embedding.timeout_secs", "must be greater than 0"));
        }
        if self.embedding.backoff_base_ms > self.embedding.backoff_max_ms {
            return Err(invalid(
                "embedding.backoff_base_ms",
                "must not exceed embedding.backoff_max_ms",
            ));
        }

        if !(-1.0..=1.0).contains(&self.retrieval.min_score) {
            return Err(invalid(
                "retrieval.min_score",
                format!(
                    "must be between -1.0 and 1.0, got {}",
                    self.retrieval.min_score
                ),
            ));
        }
        if self.retrieval.timeout_secs == 0 {
            return Err(invalid("retrieval.timeout_secs", "must be greater than 0"));
        }

        if self.sync.reference.trim().is_empty() {
            return Err(invalid("sync.reference", "must not be empty"));
        }

        Ok(())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok());
    }

    /// Apply overrides looked up by unprefixed name; unparsable values are
    /// ignored with a warning
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Ignoring {}{}={:?}: not a valid value", ENV_PREFIX, name, raw);
                    None
                }
            }
        }

        if let Some(dir) = lookup("STORAGE_DIR") {
            self.storage.dir = PathBuf::from(dir);
        }
        if let Some(provider) = parsed("PROVIDER", lookup("PROVIDER")) {
            self.embedding.provider = provider;
        }
        if let Some(endpoint) = lookup("ENDPOINT") {
            self.embedding.endpoint = endpoint;
        }
        if let Some(model) = lookup("MODEL") {
            self.embedding.model_name = model;
        }
        if let Some(file) = lookup("API_KEY_FILE") {
            self.embedding.api_key_file = Some(PathBuf::from(file));
        }
        if let Some(size) = parsed("BATCH_SIZE", lookup("BATCH_SIZE")) {
            self.embedding.batch_size = size;
        }
        if let Some(ms) = parsed("RATE_LIMIT_MS", lookup("RATE_LIMIT_MS")) {
            self.embedding.rate_limit_interval_ms = ms;
        }
        if let Some(tokenizer) = parsed("TOKENIZER", lookup("TOKENIZER")) {
            self.chunking.tokenizer = tokenizer;
        }
        if let Some(tokens) = parsed("MAX_UNIT_TOKENS", lookup("MAX_UNIT_TOKENS")) {
            self.chunking.max_unit_tokens = tokens;
        }
        if let Some(k) = parsed("TOP_K", lookup("TOP_K")) {
            self.retrieval.k = k;
        }
        if let Some(score) = parsed("MIN_SCORE", lookup("MIN_SCORE")) {
            self.retrieval.min_score = score;
        }
    }

    /// Load configuration for a repository with environment overrides applied
    pub fn new(repo_root: &Path) -> Result<Self, RagError> {
        let mut config = Self::load_or_default(repo_root)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Storage layout for a repository under this configuration
    pub fn layout(&self, repo_root: &Path) -> StorageLayout {
        StorageLayout::new(repo_root, &self.storage)
    }
}
