//! `set_variables` (§4.14): sequential assignment rules against a fixed,
//! explicit registry of `PipelineState` slots. No dot-paths, no reflection
//! — unknown slot names are fatal at construction time (§9 REDESIGN FLAGS).

use async_trait::async_trait;
use serde_yaml::Value as YamlValue;

use super::{Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::{PipelineError, Result};
use crate::jsonish;
use crate::state::PipelineState;

#[derive(Debug, Clone, PartialEq)]
enum VarValue {
    Str(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transform {
    Copy,
    ToList,
    SplitLines,
    ParseJson,
    ToContextBlocks,
    Clear,
}

#[derive(Debug, Clone)]
enum Source {
    From(String),
    Value(YamlValue),
}

#[derive(Debug, Clone)]
struct Rule {
    set: String,
    source: Source,
    transform: Transform,
}

pub struct SetVariablesAction {
    step_id: String,
    rules: Vec<Rule>,
}

impl SetVariablesAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        let rules_value = step.raw.get("rules").ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': set_variables requires 'rules'",
                step.id
            ))
        })?;
        let items = rules_value.as_sequence().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': set_variables.rules must be a list",
                step.id
            ))
        })?;

        let mut rules = Vec::with_capacity(items.len());
        for item in items {
            let map = item.as_mapping().ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "step '{}': set_variables rule must be a mapping",
                    step.id
                ))
            })?;
            let get = |key: &str| map.get(YamlValue::String(key.to_string()));

            let set = get("set")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    PipelineError::InvalidConfig(format!(
                        "step '{}': set_variables rule requires 'set'",
                        step.id
                    ))
                })?;
            if !is_known_slot(&set) {
                return Err(PipelineError::InvalidConfig(format!(
                    "step '{}': set_variables.set names unknown state slot '{set}'",
                    step.id
                )));
            }

            let from = get("from").and_then(|v| v.as_str()).map(|s| s.to_string());
            let value = get("value").cloned();
            let source = match (from, value) {
                (Some(_), Some(_)) => {
                    return Err(PipelineError::InvalidConfig(format!(
                        "step '{}': set_variables rule cannot set both 'from' and 'value'",
                        step.id
                    )))
                }
                (Some(from), None) => {
                    if !is_known_slot(&from) {
                        return Err(PipelineError::InvalidConfig(format!(
                            "step '{}': set_variables.from names unknown state slot '{from}'",
                            step.id
                        )));
                    }
                    Source::From(from)
                }
                (None, Some(value)) => Source::Value(value),
                (None, None) => {
                    return Err(PipelineError::InvalidConfig(format!(
                        "step '{}': set_variables rule requires 'from' or 'value'",
                        step.id
                    )))
                }
            };

            let transform = match get("transform").and_then(|v| v.as_str()) {
                None | Some("copy") => Transform::Copy,
                Some("to_list") => Transform::ToList,
                Some("split_lines") => Transform::SplitLines,
                Some("parse_json") => Transform::ParseJson,
                Some("to_context_blocks") => Transform::ToContextBlocks,
                Some("clear") => Transform::Clear,
                Some(other) => {
                    return Err(PipelineError::InvalidConfig(format!(
                        "step '{}': unknown set_variables transform '{other}'",
                        step.id
                    )))
                }
            };

            rules.push(Rule { set, source, transform });
        }

        Ok(SetVariablesAction {
            step_id: step.id.clone(),
            rules,
        })
    }

    fn fatal(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::StepFatal {
            step_id: self.step_id.clone(),
            message: message.into(),
        }
    }
}

const STR_SLOTS: &[&str] = &[
    "user_query",
    "user_question_en",
    "last_model_response",
    "last_prefix",
    "session_id",
    "repository",
    "branch",
    "answer_neutral",
    "answer_translated",
    "final_answer",
    "turn_id",
    "banner_neutral",
    "banner_translated",
];
const LIST_SLOTS: &[&str] = &[
    "context_blocks",
    "retrieval_seed_nodes",
    "graph_expanded_nodes",
    "history_blocks",
];

fn is_known_slot(name: &str) -> bool {
    STR_SLOTS.contains(&name) || LIST_SLOTS.contains(&name)
}

fn get_slot(state: &PipelineState, name: &str) -> VarValue {
    match name {
        "user_query" => VarValue::Str(state.user_query.clone()),
        "user_question_en" => VarValue::Str(state.user_question_en.clone()),
        "last_model_response" => VarValue::Str(state.last_model_response.clone()),
        "last_prefix" => VarValue::Str(state.last_prefix.clone()),
        "session_id" => VarValue::Str(state.session_id.clone()),
        "repository" => VarValue::Str(state.repository.clone()),
        "branch" => VarValue::Str(state.branch.clone()),
        "answer_neutral" => VarValue::Str(state.answer_neutral.clone()),
        "answer_translated" => VarValue::Str(state.answer_translated.clone()),
        "final_answer" => VarValue::Str(state.final_answer.clone()),
        "turn_id" => VarValue::Str(state.turn_id.clone()),
        "banner_neutral" => VarValue::Str(state.banner_neutral.clone().unwrap_or_default()),
        "banner_translated" => VarValue::Str(state.banner_translated.clone().unwrap_or_default()),
        "context_blocks" => VarValue::List(state.context_blocks.clone()),
        "retrieval_seed_nodes" => VarValue::List(state.retrieval_seed_nodes.clone()),
        "graph_expanded_nodes" => VarValue::List(state.graph_expanded_nodes.clone()),
        "history_blocks" => VarValue::List(state.history_blocks.clone()),
        _ => unreachable!("is_known_slot guards construction"),
    }
}

fn set_slot(state: &mut PipelineState, name: &str, value: VarValue) -> Result<()> {
    match (name, value) {
        ("user_query", VarValue::Str(v)) => state.user_query = v,
        ("user_question_en", VarValue::Str(v)) => state.user_question_en = v,
        ("last_model_response", VarValue::Str(v)) => state.last_model_response = v,
        ("last_prefix", VarValue::Str(v)) => state.last_prefix = v,
        ("session_id", VarValue::Str(v)) => state.session_id = v,
        ("repository", VarValue::Str(v)) => state.repository = v,
        ("branch", VarValue::Str(v)) => state.branch = v,
        ("answer_neutral", VarValue::Str(v)) => state.answer_neutral = v,
        ("answer_translated", VarValue::Str(v)) => state.answer_translated = v,
        ("final_answer", VarValue::Str(v)) => state.final_answer = v,
        ("turn_id", VarValue::Str(v)) => state.turn_id = v,
        ("banner_neutral", VarValue::Str(v)) => {
            state.banner_neutral = if v.is_empty() { None } else { Some(v) }
        }
        ("banner_translated", VarValue::Str(v)) => {
            state.banner_translated = if v.is_empty() { None } else { Some(v) }
        }
        ("context_blocks", VarValue::List(v)) => state.context_blocks = v,
        ("retrieval_seed_nodes", VarValue::List(v)) => state.retrieval_seed_nodes = v,
        ("graph_expanded_nodes", VarValue::List(v)) => state.graph_expanded_nodes = v,
        ("history_blocks", VarValue::List(v)) => state.history_blocks = v,
        (slot, value) => {
            return Err(PipelineError::InvalidConfig(format!(
                "set_variables: value type for slot '{slot}' mismatches ({value:?})"
            )))
        }
    }
    Ok(())
}

fn yaml_to_value(v: &YamlValue) -> VarValue {
    match v {
        YamlValue::Sequence(items) => VarValue::List(
            items
                .iter()
                .map(|i| i.as_str().map(|s| s.to_string()).unwrap_or_default())
                .collect(),
        ),
        YamlValue::String(s) => VarValue::Str(s.clone()),
        other => VarValue::Str(serde_yaml::to_string(other).unwrap_or_default().trim().to_string()),
    }
}

#[async_trait]
impl Action for SetVariablesAction {
    fn name(&self) -> &'static str {
        "set_variables"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        for rule in &self.rules {
            if rule.transform == Transform::Clear {
                let cleared = if LIST_SLOTS.contains(&rule.set.as_str()) {
                    VarValue::List(Vec::new())
                } else {
                    VarValue::Str(String::new())
                };
                set_slot(ctx.state, &rule.set, cleared)?;
                continue;
            }

            let input = match &rule.source {
                Source::From(name) => get_slot(ctx.state, name),
                Source::Value(v) => yaml_to_value(v),
            };

            let output = match rule.transform {
                Transform::Copy => input,
                Transform::ToList => match input {
                    VarValue::Str(s) => VarValue::List(
                        s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect(),
                    ),
                    VarValue::List(l) => VarValue::List(l),
                },
                Transform::SplitLines => match input {
                    VarValue::Str(s) => VarValue::List(s.lines().map(|l| l.to_string()).collect()),
                    VarValue::List(_) => {
                        return Err(self.fatal("split_lines requires a string source"))
                    }
                },
                Transform::ParseJson => match input {
                    VarValue::Str(s) => {
                        let parsed = jsonish::parse_lenient(&s)
                            .ok_or_else(|| self.fatal("parse_json: could not parse source as JSON"))?;
                        match parsed.as_array() {
                            Some(arr) => VarValue::List(
                                arr.iter().map(|v| v.as_str().unwrap_or_default().to_string()).collect(),
                            ),
                            None => VarValue::Str(jsonish::to_compact_sorted_json(&parsed)),
                        }
                    }
                    VarValue::List(_) => return Err(self.fatal("parse_json requires a string source")),
                },
                Transform::ToContextBlocks => {
                    let blocks = match input {
                        VarValue::Str(s) => vec![s],
                        VarValue::List(l) => l,
                    };
                    ctx.state.context_blocks.extend(blocks.clone());
                    VarValue::List(blocks)
                }
                Transform::Clear => unreachable!("handled above"),
            };

            set_slot(ctx.state, &rule.set, output)?;
        }

        Ok(ActionOutcome::Next(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(yaml: &str) -> StepDef {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn rejects_from_and_value_together() {
        let s = step(
            r#"
id: vars
action: set_variables
rules:
  - set: answer_neutral
    from: last_model_response
    value: "x"
"#,
        );
        assert!(SetVariablesAction::from_step(&s).is_err());
    }

    #[test]
    fn rejects_unknown_slot() {
        let s = step(
            r#"
id: vars
action: set_variables
rules:
  - set: not_a_real_slot
    value: "x"
"#,
        );
        assert!(SetVariablesAction::from_step(&s).is_err());
    }
}
