//! `prefix_router` (§4.5): first prefix match wins; byte-exact, applied
//! after trimming the whole response once.

use async_trait::async_trait;

use crate::actions::{Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
struct PrefixRoute {
    kind: String,
    prefix: String,
    next: String,
}

pub struct PrefixRouterAction {
    step_id: String,
    routes: Vec<PrefixRoute>,
    on_other: String,
}

impl PrefixRouterAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        let on_other = step.routes.on_other.clone().filter(|s| !s.is_empty()).ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': prefix_router requires non-empty 'on_other'",
                step.id
            ))
        })?;

        let routes_value = step.routes.routes.as_ref().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': prefix_router requires non-empty 'routes'",
                step.id
            ))
        })?;
        let mapping = routes_value.as_mapping().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': prefix_router.routes must be a mapping",
                step.id
            ))
        })?;
        if mapping.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "step '{}': prefix_router.routes must be non-empty",
                step.id
            )));
        }

        let mut routes = Vec::with_capacity(mapping.len());
        for (k, v) in mapping {
            let kind = k
                .as_str()
                .ok_or_else(|| PipelineError::InvalidConfig(format!(
                    "step '{}': prefix_router.routes keys must be strings",
                    step.id
                )))?
                .to_string();
            let entry = v.as_mapping().ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "step '{}': prefix_router.routes.{kind} must be a mapping",
                    step.id
                ))
            })?;
            let prefix = entry
                .get(serde_yaml::Value::String("prefix".to_string()))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    PipelineError::InvalidConfig(format!(
                        "step '{}': prefix_router.routes.{kind}.prefix must be non-empty",
                        step.id
                    ))
                })?
                .to_string();
            let next = entry
                .get(serde_yaml::Value::String("next".to_string()))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    PipelineError::InvalidConfig(format!(
                        "step '{}': prefix_router.routes.{kind}.next must be non-empty",
                        step.id
                    ))
                })?
                .to_string();
            routes.push(PrefixRoute { kind, prefix, next });
        }

        Ok(PrefixRouterAction {
            step_id: step.id.clone(),
            routes,
            on_other,
        })
    }
}

#[async_trait]
impl Action for PrefixRouterAction {
    fn name(&self) -> &'static str {
        "prefix_router"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        let trimmed = ctx.state.last_model_response.trim().to_string();

        for route in &self.routes {
            if let Some(rest) = trimmed.strip_prefix(route.prefix.as_str()) {
                ctx.state.last_prefix = route.kind.clone();
                ctx.state.last_model_response = rest.trim().to_string();
                return Ok(ActionOutcome::Next(Some(route.next.clone())));
            }
        }

        ctx.state.last_prefix = String::new();
        ctx.state.last_model_response = trimmed;
        Ok(ActionOutcome::Next(Some(self.on_other.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(yaml: &str) -> StepDef {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn first_match_wins_and_strips_prefix() {
        let step = step(
            r#"
id: route
action: prefix_router
on_other: fallback
routes:
  answer:
    prefix: "[Answer:]"
    next: finalize
  followup:
    prefix: "[Requesting data on:]"
    next: decode
"#,
        );
        let action = PrefixRouterAction::from_step(&step).unwrap();
        assert_eq!(action.routes.len(), 2);
        assert_eq!(action.on_other, "fallback");
    }

    #[test]
    fn rejects_empty_routes() {
        let step = step(
            r#"
id: route
action: prefix_router
on_other: fallback
"#,
        );
        assert!(PrefixRouterAction::from_step(&step).is_err());
    }
}
