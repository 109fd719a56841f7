//! Token estimation for prompt budgeting and usage accounting.
//!
//! The `<|endoftext|>` control marker is removed before counting and never
//! contributes to an estimate.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tiktoken_rs::CoreBPE;

use crate::error::TokenizerError;

/// Control marker removed from text before counting.
pub const END_OF_TEXT_MARKER: &str = "<|endoftext|>";

/// Estimates how many model tokens a piece of text consumes.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u32;
}

pub type SharedTokenEstimator = Arc<dyn TokenEstimator>;

fn strip_end_of_text(text: &str) -> std::borrow::Cow<'_, str> {
    if text.contains(END_OF_TEXT_MARKER) {
        std::borrow::Cow::Owned(text.replace(END_OF_TEXT_MARKER, ""))
    } else {
        std::borrow::Cow::Borrowed(text)
    }
}

/// Exact BPE count using the `cl100k_base` encoding.
pub struct TiktokenEstimator {
    bpe: CoreBPE,
}

impl TiktokenEstimator {
    pub fn cl100k() -> Result<Self, TokenizerError> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| TokenizerError(e.to_string()))?;
        Ok(Self { bpe })
    }
}

impl std::fmt::Debug for TiktokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenEstimator")
            .field("encoding", &"cl100k_base")
            .finish()
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> u32 {
        let text = strip_end_of_text(text);
        let count = self.bpe.encode_ordinary(&text).len();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

/// Heuristic estimator using character-based estimation.
///
/// Uses tokens ≈ characters / 4 with a 10% safety margin, which errs on the
/// side of overestimating.
#[derive(Debug, Clone)]
pub struct HeuristicTokenEstimator {
    /// Characters per token ratio (default: 4)
    chars_per_token: f64,
    /// Safety margin multiplier (default: 1.1 = 10% extra)
    safety_margin: f64,
}

impl HeuristicTokenEstimator {
    pub fn new(chars_per_token: f64, safety_margin: f64) -> Self {
        Self {
            chars_per_token,
            safety_margin,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(4.0, 1.1)
    }
}

impl Default for HeuristicTokenEstimator {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl TokenEstimator for HeuristicTokenEstimator {
    fn estimate(&self, text: &str) -> u32 {
        let text = strip_end_of_text(text);
        if text.is_empty() {
            return 0;
        }

        let char_count = text.chars().count() as f64;
        let adjusted = char_count / self.chars_per_token * self.safety_margin;
        adjusted.ceil() as u32
    }
}

static DEFAULT_ESTIMATOR: OnceCell<SharedTokenEstimator> = OnceCell::new();

/// Returns the process-wide `cl100k_base` estimator, or the heuristic one when
/// the BPE tables cannot be loaded. The tables are loaded on first use.
pub fn default_estimator() -> SharedTokenEstimator {
    DEFAULT_ESTIMATOR.get_or_init(load_default_estimator).clone()
}

fn load_default_estimator() -> SharedTokenEstimator {
    match TiktokenEstimator::cl100k() {
        Ok(estimator) => Arc::new(estimator),
        Err(err) => {
            log::warn!("{err}; falling back to heuristic token estimation");
            Arc::new(HeuristicTokenEstimator::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_counts_text() {
        let estimator = HeuristicTokenEstimator::default();

        // "Hello, world!" = 13 chars -> 13/4 * 1.1 ≈ 3.57 -> 4 tokens
        assert_eq!(estimator.estimate("Hello, world!"), 4);
    }

    #[test]
    fn heuristic_counts_empty_text() {
        let estimator = HeuristicTokenEstimator::default();
        assert_eq!(estimator.estimate(""), 0);
    }

    #[test]
    fn custom_chars_per_token() {
        let estimator = HeuristicTokenEstimator::new(2.0, 1.0);
        assert_eq!(estimator.estimate("test"), 2);
    }

    #[test]
    fn heuristic_ignores_end_of_text_marker() {
        let estimator = HeuristicTokenEstimator::new(1.0, 1.0);

        assert_eq!(estimator.estimate("ab<|endoftext|>cd"), 4);
        assert_eq!(estimator.estimate(END_OF_TEXT_MARKER), 0);
    }

    #[test]
    fn tiktoken_counts_plain_text() {
        let estimator = TiktokenEstimator::cl100k().unwrap();

        assert_eq!(estimator.estimate(""), 0);
        assert_eq!(estimator.estimate("hello world"), 2);
    }

    #[test]
    fn tiktoken_ignores_end_of_text_marker() {
        let estimator = TiktokenEstimator::cl100k().unwrap();

        let plain = estimator.estimate("hello world");
        let smuggled = estimator.estimate("hello<|endoftext|> world");

        assert_eq!(plain, smuggled);
    }

    #[test]
    fn estimates_are_deterministic() {
        let estimator = default_estimator();
        let text = "The quick brown fox jumps over the lazy dog.";

        assert_eq!(estimator.estimate(text), estimator.estimate(text));
    }

    #[test]
    fn default_estimator_is_loaded_once() {
        let first = default_estimator();
        let second = default_estimator();

        assert!(Arc::ptr_eq(&first, &second));
    }
}
