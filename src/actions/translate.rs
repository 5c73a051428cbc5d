//! `translate_in_if_needed` / `translate_out_if_needed` (§4.13).

use async_trait::async_trait;
use std::path::Path;

use super::{optional_bool, optional_str, Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::{PipelineError, Result};
use crate::ports::llm::GenOpts;

pub struct TranslateInAction;

impl TranslateInAction {
    pub fn from_step(_step: &StepDef) -> Result<Self> {
        Ok(TranslateInAction)
    }
}

#[async_trait]
impl Action for TranslateInAction {
    fn name(&self) -> &'static str {
        "translate_in_if_needed"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        if ctx.state.translate_chat {
            if let Some(translator) = ctx.runtime.translator.as_ref() {
                ctx.state.user_question_en = translator
                    .translate(&ctx.state.user_query)
                    .await
                    .unwrap_or_else(|_| ctx.state.user_query.clone());
                return Ok(ActionOutcome::Next(None));
            }
        }
        ctx.state.user_question_en = ctx.state.user_query.clone();
        Ok(ActionOutcome::Next(None))
    }
}

pub struct TranslateOutAction {
    step_id: String,
    use_main_model: bool,
    translate_prompt_key: Option<String>,
}

impl TranslateOutAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        let use_main_model = optional_bool(&step.raw, "use_main_model", false);
        let translate_prompt_key = optional_str(&step.raw, "translate_prompt_key");
        if use_main_model && translate_prompt_key.is_none() {
            return Err(PipelineError::InvalidConfig(format!(
                "step '{}': translate_out_if_needed.use_main_model requires 'translate_prompt_key'",
                step.id
            )));
        }
        Ok(TranslateOutAction {
            step_id: step.id.clone(),
            use_main_model,
            translate_prompt_key,
        })
    }

    async fn translate_via_model(&self, ctx: &ActionContext<'_>, text: &str) -> Result<String> {
        let key = self.translate_prompt_key.as_ref().unwrap();
        let path = Path::new(&ctx.settings.prompts_dir).join(key);
        let system = std::fs::read_to_string(&path).map_err(|e| PipelineError::StepFatal {
            step_id: self.step_id.clone(),
            message: format!("translate_out_if_needed: could not read prompt '{}': {e}", path.display()),
        })?;
        ctx.runtime
            .llm
            .ask_chat(&system, text, None, Some(&GenOpts::default()))
            .await
            .map_err(|e| PipelineError::StepFatal {
                step_id: self.step_id.clone(),
                message: format!("translate_out_if_needed: model translation failed: {e}"),
            })
    }
}

#[async_trait]
impl Action for TranslateOutAction {
    fn name(&self) -> &'static str {
        "translate_out_if_needed"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        if !ctx.state.translate_chat || ctx.state.answer_neutral.is_empty() {
            return Ok(ActionOutcome::Next(None));
        }

        if self.use_main_model {
            let translated = self.translate_via_model(ctx, &ctx.state.answer_neutral).await?;
            ctx.state.answer_translated = translated;
            ctx.state.answer_translated_is_fallback = false;
            return Ok(ActionOutcome::Next(None));
        }

        match ctx.runtime.translator.as_ref() {
            Some(translator) => {
                match translator.translate_markdown(&ctx.state.answer_neutral).await {
                    Ok(translated) => {
                        ctx.state.answer_translated = translated;
                        ctx.state.answer_translated_is_fallback = false;
                    }
                    Err(_) => {
                        ctx.state.answer_translated = ctx.state.answer_neutral.clone();
                        ctx.state.answer_translated_is_fallback = true;
                    }
                }
            }
            None => {
                ctx.state.answer_translated = ctx.state.answer_neutral.clone();
                ctx.state.answer_translated_is_fallback = true;
            }
        }

        Ok(ActionOutcome::Next(None))
    }
}
