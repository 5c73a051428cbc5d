//! `parallel_roads_action`, `fork_action`, `merge_action` (§4.10): a
//! cooperative mini-state-machine over `state.parallel_roads` that fans
//! retrieval out across dataset snapshots and merges labeled context back
//! together for comparison answers.

use async_trait::async_trait;
use std::collections::HashMap;

use super::{require_str, Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::{PipelineError, Result};
use crate::state::ParallelRoadsState;

/// Parses a `snapshots` mapping step config into an ordered `(key,
/// template)` list. `serde_yaml::Mapping` preserves declaration order, so
/// this is also the plan's visiting order.
fn parse_snapshots_mapping(step: &StepDef, config_key: &str) -> Result<Vec<(String, String)>> {
    let value = step.raw.get(config_key).ok_or_else(|| {
        PipelineError::InvalidConfig(format!(
            "step '{}': {} requires '{config_key}'",
            step.id, step.action
        ))
    })?;
    let mapping = value.as_mapping().ok_or_else(|| {
        PipelineError::InvalidConfig(format!(
            "step '{}': '{config_key}' must be a mapping",
            step.id
        ))
    })?;
    let mut out = Vec::with_capacity(mapping.len());
    for (k, v) in mapping {
        let key = k.as_str().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': '{config_key}' keys must be strings",
                step.id
            ))
        })?;
        let template = v.as_str().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': '{config_key}.{key}' must be a string",
                step.id
            ))
        })?;
        out.push((key.to_string(), template.to_string()));
    }
    if out.is_empty() {
        return Err(PipelineError::InvalidConfig(format!(
            "step '{}': '{config_key}' must not be empty",
            step.id
        )));
    }
    Ok(out)
}

/// `parallel_roads_action`: initializes `state.parallel_roads` if absent.
/// Never makes a routing decision.
pub struct ParallelRoadsAction;

impl ParallelRoadsAction {
    pub fn from_step(_step: &StepDef) -> Result<Self> {
        Ok(ParallelRoadsAction)
    }
}

#[async_trait]
impl Action for ParallelRoadsAction {
    fn name(&self) -> &'static str {
        "parallel_roads_action"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        if ctx.state.parallel_roads.is_none() {
            ctx.state.parallel_roads = Some(ParallelRoadsState::default());
        }
        Ok(ActionOutcome::Next(None))
    }
}

/// `fork_action`: builds the snapshot plan on first entry, resolving each
/// template's `${snapshot_id}`/`${snapshot_id_b}` placeholders against the
/// request's original snapshot ids. Returns `search_action` while the plan
/// still has unvisited entries, `on_done` once exhausted.
pub struct ForkAction {
    snapshots: Vec<(String, String)>,
    search_action: String,
    on_done: String,
}

impl ForkAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        let snapshots = parse_snapshots_mapping(step, "snapshots")?;
        let search_action = require_str(&step.raw, "search_action", &step.id)?;
        let on_done = step.routes.on_done.clone().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "step '{}': fork_action requires 'on_done'",
                step.id
            ))
        })?;
        Ok(ForkAction {
            snapshots,
            search_action,
            on_done,
        })
    }

    fn resolve_placeholder(template: &str, snapshot_id: &Option<String>, snapshot_id_b: &Option<String>) -> String {
        template
            .replace("${snapshot_id}", snapshot_id.as_deref().unwrap_or(""))
            .replace("${snapshot_id_b}", snapshot_id_b.as_deref().unwrap_or(""))
    }
}

#[async_trait]
impl Action for ForkAction {
    fn name(&self) -> &'static str {
        "fork_action"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        if ctx.state.parallel_roads.is_none() {
            ctx.state.parallel_roads = Some(ParallelRoadsState::default());
        }

        let original_ids = (ctx.state.snapshot_id.clone(), ctx.state.snapshot_id_b.clone());
        let pr = ctx.state.parallel_roads.as_mut().unwrap();

        if pr.plan.is_empty() && pr.index == 0 && pr.results.is_empty() {
            pr.original_ids = original_ids.clone();
            pr.plan = self
                .snapshots
                .iter()
                .map(|(key, _)| key.clone())
                .collect();
        }

        if pr.index >= pr.plan.len() {
            return Ok(ActionOutcome::Next(Some(self.on_done.clone())));
        }

        let current_key = pr.plan[pr.index].clone();
        let template = self
            .snapshots
            .iter()
            .find(|(k, _)| k == &current_key)
            .map(|(_, t)| t.clone())
            .unwrap_or_else(|| current_key.clone());
        let resolved = Self::resolve_placeholder(&template, &pr.original_ids.0, &pr.original_ids.1);

        ctx.state.snapshot_id = Some(resolved);
        Ok(ActionOutcome::Next(Some(self.search_action.clone())))
    }
}

/// `merge_action`: after each snapshot iteration, labels the blocks
/// produced this round, stashes them under `parallel_roads.results`, clears
/// per-iteration retrieval/context scratch, and jumps back to `fork_action`.
/// On the final iteration, flattens every branch's blocks into
/// `context_blocks` in visiting order and restores the original snapshot
/// ids.
pub struct MergeAction {
    labels: HashMap<String, String>,
    fork_step: String,
}

impl MergeAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        let labels: HashMap<String, String> = if step.raw.contains_key("labels") {
            parse_snapshots_mapping(step, "labels")?.into_iter().collect()
        } else {
            HashMap::new()
        };
        let fork_step = require_str(&step.raw, "fork_step", &step.id)?;
        Ok(MergeAction { labels, fork_step })
    }

    /// Label lookup order (§4.10): caller-supplied friendly name, then this
    /// step's `labels` template (`{}` substituted with the snapshot key),
    /// then the raw key itself.
    fn label_for(&self, state: &crate::state::PipelineState, key: &str) -> String {
        if let Some(name) = state.snapshot_friendly_names.get(key) {
            return name.clone();
        }
        if let Some(template) = self.labels.get(key) {
            if template.contains("{}") {
                return template.replacen("{}", key, 1);
            }
            return template.clone();
        }
        key.to_string()
    }
}

#[async_trait]
impl Action for MergeAction {
    fn name(&self) -> &'static str {
        "merge_action"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        let current_key = ctx
            .state
            .parallel_roads
            .as_ref()
            .and_then(|pr| pr.plan.get(pr.index).cloned())
            .ok_or_else(|| {
                PipelineError::InvalidConfig(
                    "merge_action ran with no active fork plan".to_string(),
                )
            })?;

        let label = self.label_for(ctx.state, &current_key);
        let mut labeled_blocks = vec![format!("## {label}")];
        labeled_blocks.extend(ctx.state.context_blocks.clone());

        let pr = ctx.state.parallel_roads.as_mut().unwrap();
        pr.results.push((current_key, labeled_blocks));
        pr.index += 1;

        let exhausted = pr.index >= pr.plan.len();
        let (orig_snapshot_id, orig_snapshot_id_b) = pr.original_ids.clone();
        let results = pr.results.clone();

        ctx.state.clear_retrieval_scratch();

        if exhausted {
            for (_, blocks) in results {
                ctx.state.context_blocks.extend(blocks);
            }
            ctx.state.snapshot_id = orig_snapshot_id;
            ctx.state.snapshot_id_b = orig_snapshot_id_b;
            // Leave `parallel_roads` in its finished state (index == plan.len())
            // rather than clearing it: routing back to `fork_step` below must
            // still see the exhausted plan so fork_action takes its `on_done`
            // branch instead of mistaking this for a fresh run and restarting
            // the whole snapshot loop.
        }

        Ok(ActionOutcome::Next(Some(self.fork_step.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(yaml: &str) -> StepDef {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn fork_resolves_placeholders_in_declared_order() {
        let s = step(
            r#"
id: fork
action: fork_action
on_done: merged
search_action: do_search
snapshots:
  a: "${snapshot_id}"
  b: "${snapshot_id_b}"
"#,
        );
        let action = ForkAction::from_step(&s).unwrap();
        assert_eq!(action.snapshots, vec![
            ("a".to_string(), "${snapshot_id}".to_string()),
            ("b".to_string(), "${snapshot_id_b}".to_string()),
        ]);
        assert_eq!(
            ForkAction::resolve_placeholder("${snapshot_id}", &Some("release-4.60.0".to_string()), &None),
            "release-4.60.0"
        );
    }

    #[test]
    fn merge_labels_fall_back_to_raw_key() {
        let s = step(
            r#"
id: merge
action: merge_action
fork_step: fork
"#,
        );
        let action = MergeAction::from_step(&s).unwrap();
        let state = crate::state::PipelineState::new_request(
            "s",
            "q",
            "repo",
            "main",
            crate::state::RetrievalFilters::new(),
        );
        assert_eq!(action.label_for(&state, "release-4.60.0"), "release-4.60.0");
    }
}
