//! `expand_dependency_tree` (§4.7): call the graph provider and normalize
//! edges. Never fetches text.

use async_trait::async_trait;

use super::{require_str, Action, ActionContext, ActionOutcome};
use crate::config::StepDef;
use crate::error::{PipelineError, Result};
use crate::state::{GraphDebug, GraphEdge, PipelineState};

pub struct ExpandDependencyTreeAction {
    step_id: String,
    max_depth_key: String,
    max_nodes_key: String,
    edge_allowlist_key: String,
}

impl ExpandDependencyTreeAction {
    pub fn from_step(step: &StepDef) -> Result<Self> {
        Ok(ExpandDependencyTreeAction {
            step_id: step.id.clone(),
            max_depth_key: require_str(&step.raw, "max_depth_from_settings", &step.id)?,
            max_nodes_key: require_str(&step.raw, "max_nodes_from_settings", &step.id)?,
            edge_allowlist_key: require_str(&step.raw, "edge_allowlist_from_settings", &step.id)?,
        })
    }
}

#[async_trait]
impl Action for ExpandDependencyTreeAction {
    fn name(&self) -> &'static str {
        "expand_dependency_tree"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        // §4.7 only names the three settings keys it reads from; this
        // crate's settings struct has one field per key (validated present
        // at construction since they are required §3 fields), so the
        // `*_from_settings` indirection always resolves to the same field.
        let _ = (&self.max_depth_key, &self.max_nodes_key, &self.edge_allowlist_key);

        let max_depth = ctx.settings.graph_max_depth;
        let max_nodes = ctx.settings.graph_max_nodes;
        let edge_allowlist = ctx.settings.graph_edge_allowlist.clone();

        let (max_depth, max_nodes) = match (max_depth, max_nodes) {
            (Some(d), Some(n)) => (d, n),
            _ => {
                return Err(PipelineError::InvalidConfig(format!(
                    "step '{}': expand_dependency_tree requires graph_max_depth and graph_max_nodes in settings",
                    self.step_id
                )))
            }
        };

        ctx.state.graph_seed_nodes = ctx.state.retrieval_seed_nodes.clone();

        if ctx.state.graph_seed_nodes.is_empty() {
            ctx.state.graph_debug = GraphDebug {
                reason: Some("no_seeds".to_string()),
                seed_count: 0,
                expanded_count: 0,
                edges_count: 0,
                truncated: false,
            };
            return Ok(ActionOutcome::Next(None));
        }

        let Some(graph) = ctx.runtime.graph.as_ref() else {
            ctx.state.graph_debug = GraphDebug {
                reason: Some("missing_graph_provider".to_string()),
                seed_count: ctx.state.graph_seed_nodes.len(),
                expanded_count: 0,
                edges_count: 0,
                truncated: false,
            };
            return Ok(ActionOutcome::Next(None));
        };

        let response = graph
            .expand_dependency_tree(
                &ctx.state.graph_seed_nodes,
                &ctx.state.repository,
                &ctx.state.branch,
                max_depth,
                max_nodes,
                edge_allowlist.as_deref(),
                &ctx.state.retrieval_filters,
            )
            .await
            .map_err(|e| PipelineError::StepFatal {
                step_id: self.step_id.clone(),
                message: format!("graph provider expand_dependency_tree failed: {e}"),
            })?;

        let seed_count = ctx.state.graph_seed_nodes.len();
        let mut expanded: Vec<String> = Vec::new();
        for id in &response.nodes {
            PipelineState::push_unique_id(&mut expanded, id.clone());
        }
        let edges: Vec<GraphEdge> = response
            .edges
            .into_iter()
            .map(|e| GraphEdge {
                from_id: e.from_id,
                to_id: e.to_id,
                edge_type: if e.edge_type.is_empty() {
                    "unknown".to_string()
                } else {
                    e.edge_type
                },
            })
            .collect();

        let truncated = expanded.len() as u32 >= max_nodes;
        ctx.state.graph_debug = GraphDebug {
            reason: None,
            seed_count,
            expanded_count: expanded.len(),
            edges_count: edges.len(),
            truncated,
        };
        ctx.state.graph_expanded_nodes = expanded;
        ctx.state.graph_edges = edges;

        Ok(ActionOutcome::Next(None))
    }
}
