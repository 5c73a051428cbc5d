//! `json_decision_router` (§4.5): best-effort JSON decode of the model's
//! decision, with payload cleanup so downstream parsers see a clean
//! retrieval payload.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::actions::{Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::{PipelineError, Result};
use crate::jsonish;

const DECISION_KEYS: [&str; 3] = ["decision", "route", "mode"];

pub struct JsonDecisionRouterAction {
    routes: HashMap<String, String>,
    on_other: String,
}

impl JsonDecisionRouterAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        let on_other = step.routes.on_other.clone().filter(|s| !s.is_empty()).ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': json_decision_router requires non-empty 'on_other'",
                step.id
            ))
        })?;
        let routes_value = step.routes.routes.as_ref().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': json_decision_router requires 'routes'",
                step.id
            ))
        })?;
        let mapping = routes_value.as_mapping().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': json_decision_router.routes must be a mapping",
                step.id
            ))
        })?;
        let mut routes = HashMap::with_capacity(mapping.len());
        for (k, v) in mapping {
            let decision = k.as_str().ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "step '{}': json_decision_router.routes keys must be strings",
                    step.id
                ))
            })?;
            let next = v.as_str().ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "step '{}': json_decision_router.routes.{decision} must be a step id string",
                    step.id
                ))
            })?;
            routes.insert(decision.trim().to_lowercase(), next.to_string());
        }

        Ok(JsonDecisionRouterAction { routes, on_other })
    }
}

#[async_trait]
impl Action for JsonDecisionRouterAction {
    fn name(&self) -> &'static str {
        "json_decision_router"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        let Some(parsed) = jsonish::parse_lenient(&ctx.state.last_model_response) else {
            return Ok(ActionOutcome::Next(Some(self.on_other.clone())));
        };

        let decision = jsonish::extract_string_field(&parsed, &DECISION_KEYS);

        // Rewrite the payload minus routing keys, compact and sorted, so
        // downstream parsers (search_nodes's query_parser) see a clean
        // retrieval payload (§4.5).
        if let Some(obj) = parsed.as_object() {
            let mut cleaned = obj.clone();
            for key in DECISION_KEYS {
                cleaned.remove(key);
            }
            let cleaned_value = serde_json::Value::Object(cleaned);
            ctx.state.last_model_response = jsonish::to_compact_sorted_json(&cleaned_value);
        }

        let next = decision
            .and_then(|d| self.routes.get(&d).cloned())
            .unwrap_or_else(|| self.on_other.clone());

        Ok(ActionOutcome::Next(Some(next)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(yaml: &str) -> StepDef {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn constructs_with_valid_routes() {
        let s = step(
            r#"
id: decide
action: json_decision_router
on_other: fallback
routes:
  retrieve: search
  answer: call_answer
"#,
        );
        let action = JsonDecisionRouterAction::from_step(&s).unwrap();
        assert_eq!(action.routes.get("retrieve"), Some(&"search".to_string()));
    }
}
