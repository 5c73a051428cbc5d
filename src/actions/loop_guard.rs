//! `loop_guard` (§4.11): a per-step dispatch counter that caps how many
//! times a cyclic region of the pipeline may be re-entered in one run.

use async_trait::async_trait;

use super::{Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::{PipelineError, Result};

pub struct LoopGuardAction {
    step_id: String,
    on_allow: String,
    on_deny: String,
}

impl LoopGuardAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        let on_allow = step.routes.on_allow.clone().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': loop_guard requires 'on_allow'",
                step.id
            ))
        })?;
        let on_deny = step.routes.on_deny.clone().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': loop_guard requires 'on_deny'",
                step.id
            ))
        })?;
        Ok(LoopGuardAction {
            step_id: step.id.clone(),
            on_allow,
            on_deny,
        })
    }
}

#[async_trait]
impl Action for LoopGuardAction {
    fn name(&self) -> &'static str {
        "loop_guard"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        let max = ctx.settings.max_turn_loops;
        let counter = ctx.state.loop_counters.entry(self.step_id.clone()).or_insert(0);

        if *counter < max {
            *counter += 1;
            Ok(ActionOutcome::Next(Some(self.on_allow.clone())))
        } else {
            Ok(ActionOutcome::Next(Some(self.on_deny.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineSettings;
    use crate::runtime::Runtime;
    use crate::state::{PipelineState, RetrievalFilters};
    use std::sync::Arc;

    fn step(yaml: &str) -> StepDef {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn denies_once_max_reached() {
        let s = step(
            r#"
id: guard
action: loop_guard
on_allow: retry
on_deny: give_up
"#,
        );
        let action = LoopGuardAction::from_step(&s).unwrap();
        let settings = PipelineSettings {
            max_context_tokens: 1000,
            max_history_tokens: 0,
            max_turn_loops: 2,
            budget_safety_margin_tokens: 128,
            graph_max_depth: None,
            graph_max_nodes: None,
            graph_edge_allowlist: None,
            model_context_window: None,
            top_k: None,
            repository: None,
            stages_visibility: None,
            prompts_dir: "prompts".to_string(),
            max_dispatched_steps: 200,
            strict_inbox: false,
        };
        let mut state = PipelineState::new_request("s", "q", "repo", "main", RetrievalFilters::new());

        let runtime = test_runtime();
        let mut ctx = ActionContext {
            state: &mut state,
            runtime: &runtime,
            step: &s,
            settings: &settings,
        };

        assert_eq!(
            action.run(&mut ctx).await.unwrap(),
            ActionOutcome::Next(Some("retry".to_string()))
        );
        assert_eq!(
            action.run(&mut ctx).await.unwrap(),
            ActionOutcome::Next(Some("retry".to_string()))
        );
        assert_eq!(
            action.run(&mut ctx).await.unwrap(),
            ActionOutcome::Next(Some("give_up".to_string()))
        );
    }

    fn test_runtime() -> Runtime {
        use crate::ports::llm::GenOpts;
        use crate::ports::retrieval::{FetchedText, SearchRequest, SearchResponse};
        use crate::ports::token_counter::ApproxCounter;
        use std::collections::HashMap;

        struct NoopLlm;
        #[async_trait]
        impl crate::ports::llm::LlmClient for NoopLlm {
            async fn ask(&self, _prompt: &str, _gen_opts: Option<&GenOpts>) -> anyhow::Result<String> {
                Ok(String::new())
            }
            async fn ask_chat(
                &self,
                _system: &str,
                _user: &str,
                _history: Option<&[crate::state::DialogMessage]>,
                _gen_opts: Option<&GenOpts>,
            ) -> anyhow::Result<String> {
                Ok(String::new())
            }
        }

        struct NoopRetrieval;
        #[async_trait]
        impl crate::ports::retrieval::RetrievalBackend for NoopRetrieval {
            async fn search(&self, _req: &SearchRequest) -> anyhow::Result<SearchResponse> {
                Ok(SearchResponse {
                    hits: Vec::new(),
                    debug: None,
                })
            }
            async fn fetch_texts(
                &self,
                _ids: &[String],
                _repository: &str,
                _branch: &str,
                _retrieval_filters: &RetrievalFilters,
                _active_index: Option<&str>,
            ) -> anyhow::Result<HashMap<String, FetchedText>> {
                Ok(HashMap::new())
            }
        }

        Runtime::new(Arc::new(NoopLlm), Arc::new(NoopRetrieval), Arc::new(ApproxCounter::default()))
    }
}
