//! Token counting port (§6). Deterministic: the engine calls `count` many
//! times over the same text across a run (budget checks, rerank, trimming)
//! and every call must agree.

use tiktoken_rs::CoreBPE;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> u32;
}

/// Default counter, grounded in the teacher's dependency on `tiktoken-rs`
/// (`orchestrator/Cargo.toml`). Wraps a `cl100k_base` encoder, the
/// teacher's choice for GPT-family token accounting.
pub struct TiktokenCounter {
    bpe: CoreBPE,
}

impl TiktokenCounter {
    pub fn new() -> anyhow::Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> u32 {
        self.bpe.encode_with_special_tokens(text).len() as u32
    }
}

/// Character-based approximation, for embedders that don't want the
/// `tiktoken-rs` model data on hand (tests, or a non-GPT backend). Mirrors
/// the teacher's `CountingMethod::Approximation` (`context::token_counter`):
/// ~4 characters per token.
pub struct ApproxCounter {
    chars_per_token: f32,
}

impl ApproxCounter {
    pub fn new() -> Self {
        Self {
            chars_per_token: 4.0,
        }
    }
}

impl Default for ApproxCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for ApproxCounter {
    fn count(&self, text: &str) -> u32 {
        ((text.chars().count() as f32) / self.chars_per_token).ceil() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_counter_rounds_up() {
        let counter = ApproxCounter::new();
        assert_eq!(counter.count("abc"), 1);
        assert_eq!(counter.count("abcde"), 2);
        assert_eq!(counter.count(""), 0);
    }
}
