//! `load_conversation_history` (§4.12): best-effort read of recent neutral
//! Q/A pairs from the conversation history service.

use async_trait::async_trait;

use super::{optional_u32, Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::Result;
use crate::state::DialogMessage;

const DEFAULT_LIMIT: u32 = 10;

pub struct LoadConversationHistoryAction {
    limit: u32,
}

impl LoadConversationHistoryAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        Ok(LoadConversationHistoryAction {
            limit: optional_u32(&step.raw, "limit").unwrap_or(DEFAULT_LIMIT),
        })
    }
}

#[async_trait]
impl Action for LoadConversationHistoryAction {
    fn name(&self) -> &'static str {
        "load_conversation_history"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        let Some(history) = ctx.runtime.history.as_ref() else {
            ctx.state.history_qa_neutral.clear();
            ctx.state.history_dialog.clear();
            ctx.state.history_blocks.clear();
            return Ok(ActionOutcome::Next(None));
        };

        let pairs = history
            .recent_qa_neutral(&ctx.state.session_id, self.limit)
            .await
            .unwrap_or_default();

        let mut dialog = Vec::with_capacity(pairs.len() * 2);
        let mut blocks = Vec::with_capacity(pairs.len());
        let mut qa_neutral = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            dialog.push(DialogMessage {
                role: "user".to_string(),
                content: pair.q.clone(),
            });
            dialog.push(DialogMessage {
                role: "assistant".to_string(),
                content: pair.a.clone(),
            });
            blocks.push(format!("Q: {}\nA: {}", pair.q, pair.a));
            qa_neutral.push((pair.q.clone(), pair.a.clone()));
        }

        ctx.state.history_qa_neutral = qa_neutral;
        ctx.state.history_dialog = dialog;
        ctx.state.history_blocks = blocks;

        Ok(ActionOutcome::Next(None))
    }
}
