//! `repeat_query_guard` (§4.5): refuse to re-run a query already asked
//! this session. Does not itself execute retrieval or record history —
//! `search_nodes` owns `retrieval_queries_asked_norm`.

use async_trait::async_trait;

use crate::actions::{Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::{PipelineError, Result};
use crate::jsonish;

pub struct RepeatQueryGuardAction {
    on_ok: String,
    on_repeat: String,
    query_parser: Option<String>,
}

impl RepeatQueryGuardAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        let on_ok = step.routes.on_ok.clone().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': repeat_query_guard requires 'on_ok'",
                step.id
            ))
        })?;
        let on_repeat = step.routes.on_repeat.clone().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': repeat_query_guard requires 'on_repeat'",
                step.id
            ))
        })?;
        let query_parser = super::super::optional_str(&step.raw, "query_parser");
        Ok(RepeatQueryGuardAction {
            on_ok,
            on_repeat,
            query_parser,
        })
    }

    fn extract_query(&self, payload: &str) -> String {
        if self.query_parser.as_deref() == Some("jsonish") {
            if let Some(parsed) = jsonish::parse_lenient(payload) {
                if let Some(q) = jsonish::extract_string_field(&parsed, &["query"]) {
                    return q;
                }
            }
            return String::new();
        }
        payload.to_string()
    }
}

/// Trim, lowercase, collapse interior whitespace runs to one space.
pub fn normalize_query(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Action for RepeatQueryGuardAction {
    fn name(&self) -> &'static str {
        "repeat_query_guard"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        let raw_query = self.extract_query(&ctx.state.last_model_response);
        let normalized = normalize_query(&raw_query);

        let is_repeat = normalized.is_empty()
            || ctx
                .state
                .retrieval_queries_asked_norm
                .contains(&normalized);

        if is_repeat {
            Ok(ActionOutcome::Next(Some(self.on_repeat.clone())))
        } else {
            Ok(ActionOutcome::Next(Some(self.on_ok.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_whitespace_and_case() {
        assert_eq!(normalize_query("  CLASS   Foo  "), "class foo");
    }
}
