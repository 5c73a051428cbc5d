//! `PipelineSettings` — §3 of the specification.

use serde::{Deserialize, Serialize};

fn default_max_turn_loops() -> u32 {
    4
}

fn default_budget_safety_margin_tokens() -> u32 {
    128
}

fn default_prompts_dir() -> String {
    "prompts".to_string()
}

/// Pipeline-wide settings, deep-merged across an `extends` chain.
///
/// Only `max_context_tokens` is required; everything else has a default
/// matching the teacher's `WorkflowSettings` convention of
/// `#[serde(default = "...")]` per field rather than one `Default` impl for
/// the whole struct (so YAML authors see exactly which fields they can
/// omit).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSettings {
    /// Global prompt-token budget. Must be > 0; enforced at validation time.
    pub max_context_tokens: u32,

    /// Token budget reserved for `call_model(use_history: true)` trimming.
    #[serde(default)]
    pub max_history_tokens: u32,

    /// `loop_guard` default cap per step id.
    #[serde(default = "default_max_turn_loops")]
    pub max_turn_loops: u32,

    /// Safety margin subtracted from `max_context_tokens` before a node is
    /// considered to fit in `manage_context_budget`.
    #[serde(default = "default_budget_safety_margin_tokens")]
    pub budget_safety_margin_tokens: u32,

    /// `expand_dependency_tree` depth limit. Must be >= 1 when present.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub graph_max_depth: Option<u32>,

    /// `expand_dependency_tree` node limit. Must be >= 1 when present.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub graph_max_nodes: Option<u32>,

    /// `null` (no restriction) or an explicit edge-type allowlist. An empty
    /// list disables traversal entirely (§8 boundary behavior).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub graph_edge_allowlist: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model_context_window: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub top_k: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub repository: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stages_visibility: Option<StagesVisibility>,

    /// Directory `call_model.prompt_key` files are resolved against.
    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: String,

    /// Hard cap on total dispatched steps per run (§4.2 deadlock bounding).
    #[serde(default = "default_max_dispatched_steps")]
    pub max_dispatched_steps: u32,

    /// §9 Open Question 2: whether a nonempty inbox at run end is fatal.
    #[serde(default)]
    pub strict_inbox: bool,
}

fn default_max_dispatched_steps() -> u32 {
    200
}

/// Trace visibility policy (§6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StagesVisibility {
    Allowed,
    Forbidden,
    Explicit,
    PipelineDriven,
}

impl Default for StagesVisibility {
    fn default() -> Self {
        StagesVisibility::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_when_omitted() {
        let yaml = "max_context_tokens: 4096\n";
        let settings: PipelineSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.max_context_tokens, 4096);
        assert_eq!(settings.max_turn_loops, 4);
        assert_eq!(settings.budget_safety_margin_tokens, 128);
        assert_eq!(settings.prompts_dir, "prompts");
        assert!(!settings.strict_inbox);
    }

    #[test]
    fn empty_edge_allowlist_is_distinct_from_absent() {
        let yaml = "max_context_tokens: 100\ngraph_edge_allowlist: []\n";
        let settings: PipelineSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.graph_edge_allowlist, Some(vec![]));

        let yaml_absent = "max_context_tokens: 100\n";
        let settings_absent: PipelineSettings = serde_yaml::from_str(yaml_absent).unwrap();
        assert_eq!(settings_absent.graph_edge_allowlist, None);
    }
}
