//! `StepDef` — one node in the pipeline transition graph (§3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One step in a `PipelineDefinition`.
///
/// `raw` holds the action-specific configuration verbatim as YAML; actions
/// deserialize their own typed config out of it at construction time
/// (§4.3's "validates its step config fail-fast"), the same way
/// `orchestrator::pattern::factory` builds a typed pattern out of a
/// `serde_json::Value` config blob per pattern kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    pub action: String,

    #[serde(default)]
    pub next: Option<String>,

    #[serde(flatten)]
    pub routes: RoutingKeys,

    #[serde(default)]
    pub end: bool,

    /// Action-specific configuration, deserialized lazily by the action
    /// factory. Stored separately from the named routing keys above so
    /// `PipelineLoader` can validate routing without knowing every action's
    /// config schema.
    #[serde(flatten)]
    pub raw: HashMap<String, serde_yaml::Value>,
}

/// Named routing keys an action may return control to. Not every action
/// uses every key; `PipelineLoader::validate` only requires the keys a
/// given action name declares (see `config::validator::required_routes`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingKeys {
    #[serde(default)]
    pub on_ok: Option<String>,
    #[serde(default)]
    pub on_over: Option<String>,
    #[serde(default)]
    pub on_allow: Option<String>,
    #[serde(default)]
    pub on_deny: Option<String>,
    #[serde(default)]
    pub on_repeat: Option<String>,
    #[serde(default)]
    pub on_other: Option<String>,
    #[serde(default)]
    pub on_done: Option<String>,
    /// `prefix_router`/`json_decision_router` style `kind -> next` map.
    /// `routes.<k>.next` for `prefix_router`, `routes.<k> = next_step_id`
    /// for `json_decision_router` — each router's factory interprets the
    /// shape it expects out of this raw value.
    #[serde(default)]
    pub routes: Option<serde_yaml::Value>,
}

impl StepDef {
    /// Every step id this step can transition to, used by the reachability
    /// and id-resolution validators (§4.1).
    pub fn referenced_step_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in [
            &self.next,
            &self.routes.on_ok,
            &self.routes.on_over,
            &self.routes.on_allow,
            &self.routes.on_deny,
            &self.routes.on_repeat,
            &self.routes.on_other,
            &self.routes.on_done,
        ] {
            if let Some(id) = id {
                ids.push(id.clone());
            }
        }
        if let Some(routes) = &self.routes.routes {
            collect_route_targets(routes, &mut ids);
        }
        // `fork_action`/`merge_action` name their non-linear transition
        // targets in `raw` rather than a named routing key (the fork loop
        // jumps to `search_action` on every iteration, merge jumps back to
        // `fork_step`); both must count as real edges for reachability.
        for key in ["search_action", "fork_step"] {
            if let Some(id) = self.raw.get(key).and_then(|v| v.as_str()) {
                ids.push(id.to_string());
            }
        }
        ids
    }

    pub fn raw_value(&self) -> serde_yaml::Value {
        serde_yaml::Value::Mapping(
            self.raw
                .iter()
                .map(|(k, v)| (serde_yaml::Value::String(k.clone()), v.clone()))
                .collect(),
        )
    }
}

fn collect_route_targets(value: &serde_yaml::Value, out: &mut Vec<String>) {
    match value {
        serde_yaml::Value::String(s) => out.push(s.clone()),
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                if k.as_str() == Some("next") {
                    if let Some(s) = v.as_str() {
                        out.push(s.to_string());
                    }
                } else {
                    collect_route_targets(v, out);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referenced_ids_from_prefix_router_routes() {
        let yaml = r#"
id: route_answer
action: prefix_router
on_other: fallback
routes:
  answer:
    prefix: "[Answer:]"
    next: finalize
  followup:
    prefix: "[Requesting data on:]"
    next: decode_decision
"#;
        let step: StepDef = serde_yaml::from_str(yaml).unwrap();
        let mut ids = step.referenced_step_ids();
        ids.sort();
        assert_eq!(ids, vec!["decode_decision", "fallback", "finalize"]);
    }
}
