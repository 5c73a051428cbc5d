//! `manage_context_budget` (§4.9): global prompt-token budget gate with
//! per-language compaction policy and demand-driven retries.

use async_trait::async_trait;

use super::{Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::{PipelineError, Result};
use crate::state::InboxMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    Always,
    Threshold,
    Demand,
}

#[derive(Debug, Clone)]
struct CompactRule {
    language: String,
    policy: Policy,
    threshold: Option<f64>,
    inbox_key: Option<String>,
}

pub struct ManageContextBudgetAction {
    step_id: String,
    on_ok: String,
    on_over: String,
    rules: Vec<CompactRule>,
    divide_new_content: Option<String>,
}

impl ManageContextBudgetAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        let on_ok = step.routes.on_ok.clone().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': manage_context_budget requires 'on_ok'",
                step.id
            ))
        })?;
        let on_over = step.routes.on_over.clone().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': manage_context_budget requires 'on_over'",
                step.id
            ))
        })?;

        let mut rules = Vec::new();
        if let Some(compact_code) = step.raw.get("compact_code") {
            let rules_value = compact_code
                .as_mapping()
                .and_then(|m| m.get(serde_yaml::Value::String("rules".to_string())))
                .and_then(|v| v.as_sequence())
                .ok_or_else(|| {
                    PipelineError::InvalidConfig(format!(
                        "step '{}': compact_code.rules must be a list",
                        step.id
                    ))
                })?;
            for rule_value in rules_value {
                let rule_map = rule_value.as_mapping().ok_or_else(|| {
                    PipelineError::InvalidConfig(format!(
                        "step '{}': compact_code rule must be a mapping",
                        step.id
                    ))
                })?;
                let get = |key: &str| rule_map.get(serde_yaml::Value::String(key.to_string()));
                let language = get("language")
                    .and_then(|v| v.as_str())
                    .filter(|s| *s == "sql" || *s == "dotnet")
                    .ok_or_else(|| {
                        PipelineError::InvalidConfig(format!(
                            "step '{}': compact_code rule.language must be 'sql' or 'dotnet'",
                            step.id
                        ))
                    })?
                    .to_string();
                let policy = match get("policy").and_then(|v| v.as_str()) {
                    Some("always") => Policy::Always,
                    Some("threshold") => Policy::Threshold,
                    Some("demand") => Policy::Demand,
                    _ => {
                        return Err(PipelineError::InvalidConfig(format!(
                            "step '{}': compact_code rule.policy must be always|threshold|demand",
                            step.id
                        )))
                    }
                };
                let threshold = get("threshold").and_then(|v| v.as_f64());
                if policy == Policy::Threshold {
                    let t = threshold.ok_or_else(|| {
                        PipelineError::InvalidConfig(format!(
                            "step '{}': compact_code rule with policy=threshold requires 'threshold'",
                            step.id
                        ))
                    })?;
                    if !(t > 0.0 && t <= 1.0) {
                        return Err(PipelineError::InvalidConfig(format!(
                            "step '{}': compact_code rule.threshold must be in (0,1]",
                            step.id
                        )));
                    }
                }
                let inbox_key = get("inbox_key").and_then(|v| v.as_str()).map(|s| s.to_string());
                if policy == Policy::Demand && inbox_key.is_none() {
                    return Err(PipelineError::InvalidConfig(format!(
                        "step '{}': compact_code rule with policy=demand requires 'inbox_key'",
                        step.id
                    )));
                }
                rules.push(CompactRule {
                    language,
                    policy,
                    threshold,
                    inbox_key,
                });
            }
        }

        let divide_new_content = compact_code_divider(step);

        Ok(ManageContextBudgetAction {
            step_id: step.id.clone(),
            on_ok,
            on_over,
            rules,
            divide_new_content,
        })
    }
}

fn compact_code_divider(step: &StepDef) -> Option<String> {
    step.raw
        .get("compact_code")?
        .as_mapping()?
        .get(serde_yaml::Value::String("divide_new_content".to_string()))?
        .as_str()
        .map(|s| s.to_string())
}

/// Language detection off the node id's extension. Returns `"unknown"`
/// when no rule-relevant extension is present.
fn detect_language(id: &str) -> &'static str {
    if id.ends_with(".sql") {
        "sql"
    } else if id.ends_with(".cs") || id.ends_with(".csproj") || id.ends_with(".sln") {
        "dotnet"
    } else {
        "unknown"
    }
}

/// Deterministic, content-only compaction: collapse runs of blank lines
/// and strip trailing whitespace per line. Produces byte-identical output
/// for identical input (§4.9's determinism requirement).
fn compact_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_blank = false;
    for line in text.lines() {
        let trimmed = line.trim_end();
        let blank = trimmed.is_empty();
        if blank && prev_blank {
            continue;
        }
        out.push_str(trimmed);
        out.push('\n');
        prev_blank = blank;
    }
    out
}

fn format_node_block(id: &str, language: &str, compact: bool, text: &str) -> String {
    format!(
        "id: {id}\npath: {id}\nlanguage: {language}\ncompact: {compact}\n---\ntext:\n{text}"
    )
}

#[async_trait]
impl Action for ManageContextBudgetAction {
    fn name(&self) -> &'static str {
        "manage_context_budget"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        let budget = ctx
            .settings
            .max_context_tokens
            .saturating_sub(ctx.settings.budget_safety_margin_tokens);

        let demand_topics: Vec<String> = ctx
            .state
            .inbox_last_consumed
            .iter()
            .filter(|m| m.target_step_id == self.step_id)
            .map(|m| m.topic.clone())
            .collect();

        // Resolve compaction for every node up front so the fatal whole-buffer
        // check below sees the post-compaction cost, not the raw text cost.
        let mut prepared: Vec<(String, &'static str, bool, String, u32)> = Vec::with_capacity(ctx.state.node_texts.len());
        for node in &ctx.state.node_texts {
            let language = detect_language(&node.id);
            let rule = self.rules.iter().find(|r| r.language == language);

            let should_compact = match rule {
                Some(r) => match r.policy {
                    Policy::Always => true,
                    Policy::Threshold => {
                        let threshold = r.threshold.unwrap_or(1.0);
                        let raw_tokens = ctx.runtime.token_counter.count(&node.text) as f64;
                        (raw_tokens / budget as f64) > threshold
                    }
                    Policy::Demand => r
                        .inbox_key
                        .as_ref()
                        .map(|key| demand_topics.contains(key))
                        .unwrap_or(false),
                },
                None => false,
            };

            let text = if should_compact {
                compact_text(&node.text)
            } else {
                node.text.clone()
            };
            let cost = ctx.runtime.token_counter.count(&text);
            prepared.push((node.id.clone(), language, should_compact, text, cost));
        }

        let buffer_total: u32 = prepared.iter().map(|(_, _, _, _, cost)| *cost).sum();
        if buffer_total > budget {
            return Err(PipelineError::BudgetMisconfig(format!(
                "step '{}': retrieval buffer ({buffer_total} tokens) exceeds max_context_tokens ({budget})",
                self.step_id
            )));
        }

        let mut total: u32 = 0;
        let mut formatted_blocks: Vec<String> = Vec::new();

        for (id, language, should_compact, text, cost) in prepared {
            if total.saturating_add(cost) > budget {
                self.requeue_demand_messages(ctx);
                return Ok(ActionOutcome::Next(Some(self.on_over.clone())));
            }

            total += cost;
            formatted_blocks.push(format_node_block(&id, language, should_compact, &text));
        }

        if !formatted_blocks.is_empty() {
            if let Some(divider) = &self.divide_new_content {
                ctx.state.context_blocks.push(divider.clone());
            }
            ctx.state.context_blocks.extend(formatted_blocks);
        }
        ctx.state.node_texts.clear();

        Ok(ActionOutcome::Next(Some(self.on_ok.clone())))
    }
}

impl ManageContextBudgetAction {
    fn requeue_demand_messages(&self, ctx: &mut ActionContext<'_>) {
        let consumed: Vec<InboxMessage> = ctx
            .state
            .inbox_last_consumed
            .iter()
            .filter(|m| m.target_step_id == self.step_id)
            .cloned()
            .collect();
        for message in consumed {
            ctx.state.enqueue_inbox(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_text_collapses_blank_runs_and_trims_trailing_ws() {
        let input = "a   \n\n\n\nb\n";
        assert_eq!(compact_text(input), "a\n\nb\n");
    }

    #[test]
    fn detect_language_by_extension() {
        assert_eq!(detect_language("db/migrations/001.sql"), "sql");
        assert_eq!(detect_language("Service.cs"), "dotnet");
        assert_eq!(detect_language("src/lib.rs"), "unknown");
    }
}
