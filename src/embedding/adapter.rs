use super::EmbeddingProvider;
use super::rate_limiter::{Clock, IntervalGate, TokioClock};
use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;
use crate::indexer::{TokenEstimator, default_estimator};
use std::sync::Arc;
use std::time::Duration;

/// Why a text was not sent to the embedding service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedSkip {
    /// Empty or whitespace-only
    Blank,
    /// Estimated size above the per-input limit
    TooLong { tokens: usize, limit: usize },
}

/// Outcome for one input of [`EmbeddingAdapter::embed_many`]
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedSlot {
    /// L2-normalized embedding
    Vector(Vec<f32>),
    Skipped(EmbedSkip),
    /// The batch holding this text failed
    Failed(EmbeddingError),
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_rate_limit_retries: usize,
    pub max_transient_retries: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_rate_limit_retries: config.max_rate_limit_retries,
            max_transient_retries: config.max_transient_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31) as u32).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EmbeddingConfig::default())
    }
}

/// Batching, pacing and retry in front of an [`EmbeddingProvider`].
///
/// Fatal errors (missing or rejected credentials) abort the whole call.
/// Every other failure is confined to the batch it happened in.
pub struct EmbeddingAdapter {
    provider: Arc<dyn EmbeddingProvider>,
    gate: IntervalGate,
    clock: Arc<dyn Clock>,
    estimator: Arc<dyn TokenEstimator>,
    batch_size: usize,
    max_batch_tokens: usize,
    max_input_tokens: usize,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl EmbeddingAdapter {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self::with_clock(
            provider,
            config,
            default_estimator(),
            Arc::new(TokioClock::new()),
        )
    }

    pub fn with_clock(
        provider: Arc<dyn EmbeddingProvider>,
        config: &EmbeddingConfig,
        estimator: Arc<dyn TokenEstimator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            gate: IntervalGate::new(config.rate_limit_interval(), clock.clone()),
            clock,
            estimator,
            batch_size: config.batch_size.max(1),
            max_batch_tokens: config.max_batch_tokens.max(1),
            max_input_tokens: config.max_input_tokens.max(1),
            retry: RetryPolicy::from_config(config),
            request_timeout: config.timeout(),
        }
    }

    /// Replace the size estimator used for batching and input limits
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn max_input_tokens(&self) -> usize {
        self.max_input_tokens
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Embed one text; `None` when it is blank or too long to send
    pub async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        match self.embed_many(&[text]).await?.pop() {
            Some(EmbedSlot::Vector(vector)) => Ok(Some(vector)),
            Some(EmbedSlot::Failed(err)) => Err(err),
            Some(EmbedSlot::Skipped(_)) | None => Ok(None),
        }
    }

    /// Embed many texts; slots are returned in input order
    pub async fn embed_many<S>(&self, texts: &[S]) -> Result<Vec<EmbedSlot>, EmbeddingError>
    where
        S: AsRef<str> + Sync,
    {
        let mut slots: Vec<Option<EmbedSlot>> = vec![None; texts.len()];
        let mut pending: Vec<(usize, usize)> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let text = text.as_ref();
            if text.trim().is_empty() {
                slots[i] = Some(EmbedSlot::Skipped(EmbedSkip::Blank));
                continue;
            }
            let tokens = self.estimator.estimate(text);
            if tokens > self.max_input_tokens {
                tracing::warn!(
                    "Skipping text of ~{} tokens (limit {})",
                    tokens,
                    self.max_input_tokens
                );
                slots[i] = Some(EmbedSlot::Skipped(EmbedSkip::TooLong {
                    tokens,
                    limit: self.max_input_tokens,
                }));
                continue;
            }
            pending.push((i, tokens));
        }

        let batches = self.pack(&pending);
        let batch_count = batches.len();
        for (n, batch) in batches.into_iter().enumerate() {
            let inputs: Vec<String> = batch.iter().map(|&i| texts[i].as_ref().to_string()).collect();
            tracing::debug!(
                "Embedding batch {}/{} ({} texts)",
                n + 1,
                batch_count,
                inputs.len()
            );

            match self.request_with_retry(&inputs).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    for (&i, vector) in batch.iter().zip(vectors) {
                        slots[i] = Some(self.check_vector(vector));
                    }
                }
                Ok(vectors) => {
                    let err = EmbeddingError::InvalidResponse(format!(
                        "expected {} embeddings, got {}",
                        batch.len(),
                        vectors.len()
                    ));
                    for &i in &batch {
                        slots[i] = Some(EmbedSlot::Failed(err.clone()));
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!("Embedding batch of {} texts failed: {}", batch.len(), err);
                    for &i in &batch {
                        slots[i] = Some(EmbedSlot::Failed(err.clone()));
                    }
                }
            }
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or(EmbedSlot::Skipped(EmbedSkip::Blank)))
            .collect())
    }

    /// Pack consecutive texts into batches within the item and token limits
    fn pack(&self, pending: &[(usize, usize)]) -> Vec<Vec<usize>> {
        let mut batches = Vec::new();
        let mut current: Vec<usize> = Vec::new();
        let mut current_tokens = 0usize;

        for &(index, tokens) in pending {
            if !current.is_empty()
                && (current.len() >= self.batch_size
                    || current_tokens + tokens > self.max_batch_tokens)
            {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current.push(index);
            current_tokens += tokens;
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    async fn request_with_retry(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut rate_limited = 0usize;
        let mut transient = 0usize;

        loop {
            let result = {
                let _permit = self.gate.acquire().await;
                match tokio::time::timeout(self.request_timeout, self.provider.embed_batch(inputs))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(EmbeddingError::Timeout(self.request_timeout.as_secs())),
                }
            };

            let err = match result {
                Ok(vectors) => return Ok(vectors),
                Err(err) => err,
            };

            let delay = match &err {
                EmbeddingError::RateLimited { retry_after } => {
                    if rate_limited >= self.retry.max_rate_limit_retries {
                        return Err(exhausted(rate_limited + transient + 1, err));
                    }
                    let delay = retry_after.unwrap_or_else(|| self.retry.backoff(rate_limited));
                    rate_limited += 1;
                    delay
                }
                e if e.is_retryable() => {
                    if transient >= self.retry.max_transient_retries {
                        return Err(exhausted(rate_limited + transient + 1, err));
                    }
                    let delay = self.retry.backoff(transient);
                    transient += 1;
                    delay
                }
                _ => return Err(err),
            };

            tracing::warn!("Embedding request failed ({}), retrying in {:?}", err, delay);
            self.clock.sleep(delay).await;
        }
    }

    fn check_vector(&self, mut vector: Vec<f32>) -> EmbedSlot {
        let expected = self.provider.dimension();
        if vector.len() != expected {
            return EmbedSlot::Failed(EmbeddingError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return EmbedSlot::Failed(EmbeddingError::InvalidResponse(
                "embedding contains non-finite values".to_string(),
            ));
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            return EmbedSlot::Failed(EmbeddingError::InvalidResponse(
                "embedding has zero norm".to_string(),
            ));
        }
        vector.iter_mut().for_each(|x| *x /= norm);
        EmbedSlot::Vector(vector)
    }
}

fn exhausted(attempts: usize, last: EmbeddingError) -> EmbeddingError {
    EmbeddingError::RetriesExhausted {
        attempts,
        last: Box::new(last),
    }
}
