mod adapter;
mod hashing;
mod mistral_client;
mod rate_limiter;

pub use adapter::{EmbedSkip, EmbedSlot, EmbeddingAdapter, RetryPolicy};
pub use hashing::HashingEmbedder;
pub use mistral_client::{MistralEmbeddingClient, classify_status};
pub use rate_limiter::{Clock, GatePermit, IntervalGate, ManualClock, TokioClock};

use crate::config::{EmbeddingConfig, ProviderKind};
use crate::error::EmbeddingError;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Trait for embedding generation
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of text, one vector per input in order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Get the dimension of the embeddings
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Build the configured provider
pub fn provider_from_config(
    config: &EmbeddingConfig,
    storage_dir: &Path,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    match config.provider {
        ProviderKind::Mistral => Ok(Arc::new(MistralEmbeddingClient::from_config(
            config,
            storage_dir,
        )?)),
        ProviderKind::Hashing => Ok(Arc::new(HashingEmbedder::new(config.dimension))),
    }
}
