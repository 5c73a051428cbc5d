//! Translator port (§6), optional. `translate_in`/`translate_out` treat its
//! absence as "copy through, no translation".

use async_trait::async_trait;

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> anyhow::Result<String>;

    /// Markdown-aware translation, preferred by `translate_out` when
    /// available (§4.13). Default falls back to plain `translate`.
    async fn translate_markdown(&self, text: &str) -> anyhow::Result<String> {
        self.translate(text).await
    }
}
