//! Approximate token cost functions.

/// Characters per token assumed by [`approx_tokens`].
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Pluggable token-cost function injected into the context store.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> u64;
}

/// `ceil(chars / chars_per_token)`; empty text costs nothing.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioTokenCounter {
    chars_per_token: f64,
}

impl CharRatioTokenCounter {
    /// Ratios that are not strictly positive fall back to the default.
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }
}

impl Default for CharRatioTokenCounter {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenCounter for CharRatioTokenCounter {
    fn count(&self, text: &str) -> u64 {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        (chars as f64 / self.chars_per_token).ceil() as u64
    }
}

/// Token estimate with the default character ratio.
pub fn approx_tokens(text: &str) -> u64 {
    CharRatioTokenCounter::default().count(text)
}
