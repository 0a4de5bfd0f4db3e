//! Token budgets
//!
//! The embedding service measures input in model tokens. Every budget
//! decision in the crate goes through a [`TokenEstimator`]; the default counts
//! BPE tokens with `tiktoken-rs`, and [`CharRatioEstimator`] remains for
//! models without a known encoding.

use crate::config::{ChunkingConfig, TokenizerKind};
use crate::error::ConfigError;
use std::sync::{Arc, OnceLock};
use tiktoken_rs::CoreBPE;

/// Estimates the number of model tokens in a text.
///
/// Implementations must be monotone over prefixes: a prefix of a text never
/// estimates above the text itself.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// `ceil(chars / chars_per_token)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    pub fn chars_per_token(&self) -> usize {
        self.chars_per_token
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(3)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

/// BPE token count of a `tiktoken` encoding
#[derive(Clone)]
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
    kind: TokenizerKind,
}

impl TiktokenEstimator {
    /// Estimator for a BPE encoding; encodings are loaded once per process
    pub fn new(kind: TokenizerKind) -> Result<Self, ConfigError> {
        static CL100K: OnceLock<Arc<CoreBPE>> = OnceLock::new();
        static O200K: OnceLock<Arc<CoreBPE>> = OnceLock::new();

        let cell = match kind {
            TokenizerKind::Cl100kBase => &CL100K,
            TokenizerKind::O200kBase => &O200K,
            TokenizerKind::CharRatio => {
                return Err(ConfigError::InvalidValue {
                    key: "chunking.tokenizer".to_string(),
                    reason: "char_ratio is not a BPE encoding".to_string(),
                });
            }
        };

        let bpe = match cell.get() {
            Some(bpe) => bpe.clone(),
            None => {
                let loaded = match kind {
                    TokenizerKind::O200kBase => tiktoken_rs::o200k_base(),
                    _ => tiktoken_rs::cl100k_base(),
                };
                let bpe = loaded.map_err(|e| ConfigError::InvalidValue {
                    key: "chunking.tokenizer".to_string(),
                    reason: format!("failed to load {:?}: {}", kind, e),
                })?;
                cell.get_or_init(|| Arc::new(bpe)).clone()
            }
        };
        Ok(Self { bpe, kind })
    }
}

impl std::fmt::Debug for TiktokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenEstimator")
            .field("kind", &self.kind)
            .finish()
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_ordinary(text).len()
    }
}

/// The estimator a chunking configuration asks for
pub fn estimator_from_config(
    config: &ChunkingConfig,
) -> Result<Arc<dyn TokenEstimator>, ConfigError> {
    Ok(match config.tokenizer {
        TokenizerKind::CharRatio => Arc::new(CharRatioEstimator::new(config.chars_per_token)),
        kind => Arc::new(TiktokenEstimator::new(kind)?),
    })
}

/// `cl100k_base` token counts, or the character ratio if the encoding cannot
/// be loaded
pub fn default_estimator() -> Arc<dyn TokenEstimator> {
    match TiktokenEstimator::new(TokenizerKind::default()) {
        Ok(estimator) => Arc::new(estimator),
        Err(e) => {
            tracing::warn!("{}, falling back to a character estimate", e);
            Arc::new(CharRatioEstimator::default())
        }
    }
}

/// Longest prefix of `text`, cut at a character boundary, that fits `budget`.
///
/// Returns `text` itself when it already fits.
pub fn hard_cut<'a>(text: &'a str, budget: usize, estimator: &dyn TokenEstimator) -> &'a str {
    if estimator.estimate(text) <= budget {
        return text;
    }

    let boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    // boundaries[0] == 0 always fits, find the last boundary that does
    let (mut lo, mut hi) = (0usize, boundaries.len());
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if estimator.estimate(&text[..boundaries[mid]]) <= budget {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    &text[..boundaries[lo]]
}
