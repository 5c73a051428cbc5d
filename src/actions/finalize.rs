//! `finalize` (§4.14): deterministically materialize `state.final_answer`
//! from already-computed neutral/translated answer text. Never translates,
//! never falls back to `last_model_response`.

use async_trait::async_trait;

use super::{optional_bool, Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::Result;

pub struct FinalizeAction {
    persist_turn: bool,
}

impl FinalizeAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        Ok(FinalizeAction {
            persist_turn: optional_bool(&step.raw, "persist_turn", true),
        })
    }
}

#[async_trait]
impl Action for FinalizeAction {
    fn name(&self) -> &'static str {
        "finalize"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        let (body, banner) = if ctx.state.translate_chat && !ctx.state.answer_translated.is_empty() {
            (ctx.state.answer_translated.clone(), ctx.state.banner_translated.clone())
        } else {
            (ctx.state.answer_neutral.clone(), ctx.state.banner_neutral.clone())
        };

        ctx.state.final_answer = match banner {
            Some(b) if !b.is_empty() => format!("{b}\n\n{body}"),
            _ => body,
        };

        tracing::info!(
            run_id = %ctx.state.run_id,
            session_id = %ctx.state.session_id,
            turn_id = %ctx.state.turn_id,
            "pipeline run finalized"
        );

        if self.persist_turn {
            if let Some(history) = ctx.runtime.history.as_ref() {
                if let Err(err) = history
                    .on_request_finalized(&ctx.state.session_id, &ctx.state.turn_id, &ctx.state.final_answer)
                    .await
                {
                    tracing::warn!(error = %err, "failed to persist finalized turn");
                }
            }
        }

        Ok(ActionOutcome::Next(None))
    }
}
