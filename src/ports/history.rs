//! Conversation history port (§6). Best-effort: `load_conversation_history`
//! and `finalize` degrade to empty/no-op on failure rather than fail the run.

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq)]
pub struct QaPair {
    pub q: String,
    pub a: String,
}

#[async_trait]
pub trait ConversationHistoryService: Send + Sync {
    async fn on_request_started(&self, session_id: &str) -> anyhow::Result<String>;

    async fn on_request_finalized(
        &self,
        session_id: &str,
        turn_id: &str,
        final_answer: &str,
    ) -> anyhow::Result<()>;

    async fn recent_qa_neutral(&self, session_id: &str, limit: u32) -> anyhow::Result<Vec<QaPair>>;
}
