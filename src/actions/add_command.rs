//! `add_command_action` (§4.14): append permission-gated command links to
//! whichever answer field currently holds the user-visible text.

use async_trait::async_trait;
use serde_yaml::Value as YamlValue;

use super::{Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
struct CommandLink {
    command_type: String,
    label: String,
    href: String,
}

pub struct AddCommandAction {
    commands: Vec<CommandLink>,
}

impl AddCommandAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        let commands_value = step.raw.get("commands").ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': add_command_action requires 'commands'",
                step.id
            ))
        })?;
        let items = commands_value.as_sequence().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': add_command_action.commands must be a list",
                step.id
            ))
        })?;

        let mut commands = Vec::with_capacity(items.len());
        for item in items {
            let map = item.as_mapping().ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "step '{}': add_command_action command must be a mapping",
                    step.id
                ))
            })?;
            let get = |key: &str| map.get(YamlValue::String(key.to_string())).and_then(|v| v.as_str());
            let command_type = get("type").ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "step '{}': add_command_action command requires 'type'",
                    step.id
                ))
            })?;
            let label = get("label").ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "step '{}': add_command_action command requires 'label'",
                    step.id
                ))
            })?;
            let href = get("href").ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "step '{}': add_command_action command requires 'href'",
                    step.id
                ))
            })?;
            commands.push(CommandLink {
                command_type: command_type.to_string(),
                label: label.to_string(),
                href: href.to_string(),
            });
        }

        Ok(AddCommandAction { commands })
    }
}

#[async_trait]
impl Action for AddCommandAction {
    fn name(&self) -> &'static str {
        "add_command_action"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        let links: Vec<String> = self
            .commands
            .iter()
            .filter(|c| ctx.state.allowed_commands.contains(&c.command_type))
            .map(|c| format!("[{}]({})", c.label, c.href))
            .collect();

        if links.is_empty() {
            return Ok(ActionOutcome::Next(None));
        }
        let appendix = format!("\n\n{}", links.join(" · "));

        if !ctx.state.final_answer.is_empty() {
            ctx.state.final_answer.push_str(&appendix);
        } else if !ctx.state.answer_translated.is_empty() {
            ctx.state.answer_translated.push_str(&appendix);
        } else if !ctx.state.answer_neutral.is_empty() {
            ctx.state.answer_neutral.push_str(&appendix);
        } else if !ctx.state.last_model_response.is_empty() {
            ctx.state.last_model_response.push_str(&appendix);
        }

        Ok(ActionOutcome::Next(None))
    }
}
