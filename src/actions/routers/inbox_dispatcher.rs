//! `inbox_dispatcher` (§4.5): read out-of-band directives from the model's
//! payload and enqueue inbox messages for named target steps. Never
//! changes routing itself — the subsequent router does.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};

use crate::actions::{Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::{PipelineError, Result};
use crate::jsonish;
use crate::state::InboxMessage;

const TARGET_KEYS: [&str; 3] = ["target_step_id", "target", "id"];

#[derive(Debug, Clone)]
struct DispatchRule {
    topic: Option<String>,
    allow_keys: Vec<String>,
    rename: HashMap<String, String>,
}

pub struct InboxDispatcherAction {
    rules: HashMap<String, DispatchRule>,
    directives_key: String,
}

impl InboxDispatcherAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        let rules_value = step.raw.get("rules").ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': inbox_dispatcher requires 'rules'",
                step.id
            ))
        })?;
        let mapping = rules_value.as_mapping().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': inbox_dispatcher.rules must be a mapping",
                step.id
            ))
        })?;

        let mut rules = HashMap::with_capacity(mapping.len());
        for (k, v) in mapping {
            let target = k
                .as_str()
                .ok_or_else(|| {
                    PipelineError::InvalidConfig(format!(
                        "step '{}': inbox_dispatcher.rules keys must be strings",
                        step.id
                    ))
                })?
                .to_string();
            let entry = v.as_mapping().ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "step '{}': inbox_dispatcher.rules.{target} must be a mapping",
                    step.id
                ))
            })?;
            let topic = entry
                .get(serde_yaml::Value::String("topic".to_string()))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            let allow_keys_value = entry
                .get(serde_yaml::Value::String("allow_keys".to_string()))
                .ok_or_else(|| {
                    PipelineError::InvalidConfig(format!(
                        "step '{}': inbox_dispatcher.rules.{target}.allow_keys is required",
                        step.id
                    ))
                })?;
            let allow_keys: Vec<String> = allow_keys_value
                .as_sequence()
                .ok_or_else(|| {
                    PipelineError::InvalidConfig(format!(
                        "step '{}': inbox_dispatcher.rules.{target}.allow_keys must be a list",
                        step.id
                    ))
                })?
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
            let rename = entry
                .get(serde_yaml::Value::String("rename".to_string()))
                .and_then(|v| v.as_mapping())
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| {
                            Some((k.as_str()?.to_string(), v.as_str()?.to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default();

            rules.insert(
                target,
                DispatchRule {
                    topic,
                    allow_keys,
                    rename,
                },
            );
        }

        let directives_key = super::super::optional_str(&step.raw, "directives_key")
            .unwrap_or_else(|| "dispatch".to_string());

        Ok(InboxDispatcherAction {
            rules,
            directives_key,
        })
    }
}

#[async_trait]
impl Action for InboxDispatcherAction {
    fn name(&self) -> &'static str {
        "inbox_dispatcher"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        let Some(parsed) = jsonish::parse_lenient(&ctx.state.last_model_response) else {
            return Ok(ActionOutcome::Next(None));
        };
        let Some(obj) = parsed.as_object() else {
            return Ok(ActionOutcome::Next(None));
        };

        let directives: Vec<JsonValue> = match obj.get(&self.directives_key) {
            Some(JsonValue::Array(items)) => items.clone(),
            Some(single @ JsonValue::Object(_)) => vec![single.clone()],
            _ => Vec::new(),
        };

        for directive in directives {
            let Some(directive_obj) = directive.as_object() else {
                continue;
            };

            let Some(target) = TARGET_KEYS
                .iter()
                .find_map(|k| directive_obj.get(*k).and_then(|v| v.as_str()))
            else {
                continue;
            };

            let Some(rule) = self.rules.get(target) else {
                continue;
            };

            let topic = directive_obj
                .get("topic")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or_else(|| rule.topic.clone())
                .unwrap_or_else(|| "config".to_string());

            let candidate: BTreeMap<String, JsonValue> = match directive_obj.get("payload") {
                Some(JsonValue::Object(payload)) => payload.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                _ => directive_obj
                    .iter()
                    .filter(|(k, _)| !TARGET_KEYS.contains(&k.as_str()) && *k != "topic" && *k != "payload")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            };

            let mut filtered: BTreeMap<String, JsonValue> = candidate
                .into_iter()
                .filter(|(k, _)| rule.allow_keys.contains(k))
                .map(|(k, v)| {
                    let renamed = rule.rename.get(&k).cloned().unwrap_or(k);
                    (renamed, v)
                })
                .collect();

            if filtered.is_empty() {
                continue;
            }

            let payload = JsonValue::Object(std::mem::take(&mut filtered).into_iter().collect());

            ctx.state.enqueue_inbox(InboxMessage {
                target_step_id: target.to_string(),
                topic,
                payload,
                sender_step_id: ctx.step.id.clone(),
            });
        }

        Ok(ActionOutcome::Next(None))
    }
}
