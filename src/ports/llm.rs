//! LLM client port (§6): manual prompt and chat-message completion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state::DialogMessage;

/// Generation overrides. Absent fields mean "don't override the backend's
/// default"; `max_output_tokens` wins over `max_tokens` when both are set
/// (§4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenOpts {
    pub max_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_k: Option<u32>,
    pub top_p: Option<f64>,
}

impl GenOpts {
    /// The effective max-tokens value after the `max_output_tokens`
    /// override-wins rule.
    pub fn effective_max_tokens(&self) -> Option<u32> {
        self.max_output_tokens.or(self.max_tokens)
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Manual single-string prompt, already built by the named
    /// `prompt_format` builder.
    async fn ask(&self, prompt: &str, gen_opts: Option<&GenOpts>) -> anyhow::Result<String>;

    /// Chat-native completion: a fixed system prompt, the current user
    /// turn, and optional trimmed history.
    async fn ask_chat(
        &self,
        system: &str,
        user: &str,
        history: Option<&[DialogMessage]>,
        gen_opts: Option<&GenOpts>,
    ) -> anyhow::Result<String>;
}
