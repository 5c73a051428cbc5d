//! Action framework (§4.0, §4.3): a typed step executor identified by
//! `action` name in YAML, constructed by a name-keyed registry that
//! validates `step.raw` fail-fast (grounded in the teacher's
//! deserialize-time config validation, `config::loader`/`config::router`).

pub mod add_command;
pub mod call_model;
pub mod expand_dependency_tree;
pub mod fetch_node_texts;
pub mod finalize;
pub mod fork_merge;
pub mod load_history;
pub mod loop_guard;
pub mod manage_context_budget;
pub mod routers;
pub mod search_nodes;
pub mod set_variables;
pub mod translate;

use async_trait::async_trait;
use serde_yaml::Value as YamlValue;
use std::collections::HashMap;

use crate::config::{PipelineSettings, StepDef};
use crate::error::{PipelineError, Result};
use crate::runtime::Runtime;
use crate::state::PipelineState;

/// Everything an action needs to run one step.
pub struct ActionContext<'a> {
    pub state: &'a mut PipelineState,
    pub runtime: &'a Runtime,
    pub step: &'a StepDef,
    pub settings: &'a PipelineSettings,
}

/// The result of running an action. `Next(Some(id))` overrides
/// `step.next`; `Next(None)` means "use `step.next`" (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Next(Option<String>),
}

#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome>;
}

/// Construct the action for `step`, validating its config fail-fast.
/// Unknown action names are a structured `InvalidConfig` error, not a
/// panic, since pipelines are untrusted-at-load-time data (§4.1).
pub fn build(step: &StepDef, settings: &PipelineSettings) -> Result<Box<dyn Action>> {
    match step.action.as_str() {
        "call_model" => Ok(Box::new(call_model::CallModelAction::from_step(step)?)),
        "prefix_router" => Ok(Box::new(routers::prefix::PrefixRouterAction::from_step(
            step,
        )?)),
        "json_decision_router" => Ok(Box::new(
            routers::json_decision::JsonDecisionRouterAction::from_step(step)?,
        )),
        "repeat_query_guard" => Ok(Box::new(
            routers::repeat_query_guard::RepeatQueryGuardAction::from_step(step)?,
        )),
        "inbox_dispatcher" => Ok(Box::new(
            routers::inbox_dispatcher::InboxDispatcherAction::from_step(step)?,
        )),
        "search_nodes" => Ok(Box::new(search_nodes::SearchNodesAction::from_step(
            step, settings,
        )?)),
        "expand_dependency_tree" => Ok(Box::new(
            expand_dependency_tree::ExpandDependencyTreeAction::from_step(step)?,
        )),
        "fetch_node_texts" => Ok(Box::new(fetch_node_texts::FetchNodeTextsAction::from_step(
            step, settings,
        )?)),
        "manage_context_budget" => Ok(Box::new(
            manage_context_budget::ManageContextBudgetAction::from_step(step)?,
        )),
        "fork_action" => Ok(Box::new(fork_merge::ForkAction::from_step(step)?)),
        "parallel_roads_action" => Ok(Box::new(fork_merge::ParallelRoadsAction::from_step(
            step,
        )?)),
        "merge_action" => Ok(Box::new(fork_merge::MergeAction::from_step(step)?)),
        "loop_guard" => Ok(Box::new(loop_guard::LoopGuardAction::from_step(step)?)),
        "load_conversation_history" => Ok(Box::new(
            load_history::LoadConversationHistoryAction::from_step(step)?,
        )),
        "translate_in_if_needed" => Ok(Box::new(translate::TranslateInAction::from_step(
            step,
        )?)),
        "translate_out_if_needed" => Ok(Box::new(translate::TranslateOutAction::from_step(
            step,
        )?)),
        "finalize" => Ok(Box::new(finalize::FinalizeAction::from_step(step)?)),
        "set_variables" => Ok(Box::new(set_variables::SetVariablesAction::from_step(
            step,
        )?)),
        "add_command_action" => Ok(Box::new(add_command::AddCommandAction::from_step(
            step,
        )?)),
        other => Err(PipelineError::InvalidConfig(format!(
            "step '{}': unknown action '{}'",
            step.id, other
        ))),
    }
}

/// Read a required string field out of `step.raw`, naming the step in the
/// error so a pipeline author can find the bad YAML.
pub(crate) fn require_str(
    raw: &HashMap<String, YamlValue>,
    key: &str,
    step_id: &str,
) -> Result<String> {
    raw.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{step_id}': missing or non-string required field '{key}'"
            ))
        })
}

pub(crate) fn optional_str(raw: &HashMap<String, YamlValue>, key: &str) -> Option<String> {
    raw.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

pub(crate) fn optional_bool(raw: &HashMap<String, YamlValue>, key: &str, default: bool) -> bool {
    raw.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

pub(crate) fn optional_u32(raw: &HashMap<String, YamlValue>, key: &str) -> Option<u32> {
    raw.get(key).and_then(|v| v.as_u64()).map(|n| n as u32)
}

pub(crate) fn optional_f64(raw: &HashMap<String, YamlValue>, key: &str) -> Option<f64> {
    raw.get(key).and_then(|v| v.as_f64())
}
