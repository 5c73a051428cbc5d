//! `PipelineDefinition::to_dot` — Graphviz DOT rendering of a pipeline's
//! step transition graph, grounded in `langgraph-core::visualization`'s DOT
//! renderer from the same example pack. Debugging aid only: no rendering,
//! just text generation, and no UI concern.

use crate::config::{PipelineDefinition, StepDef};

impl PipelineDefinition {
    /// Render this pipeline's steps and transitions as Graphviz DOT source.
    /// Edges carry a label when they come from a named routing key
    /// (`on_ok`, `on_deny`, a router's `routes` map, ...); plain `next`
    /// transitions are unlabeled.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        out.push_str("digraph pipeline {\n");
        out.push_str("    rankdir=LR;\n");
        out.push_str(&format!("    label=\"{}\";\n", escape_dot(&self.name)));
        out.push_str("    labelloc=\"t\";\n");
        out.push_str("    node [shape=box, style=rounded];\n");
        out.push_str(&format!(
            "    \"{}\" [shape=circle, style=filled, fillcolor=green];\n",
            escape_dot(&self.entry_step_id)
        ));

        for id in &self.step_order {
            let Some(step) = self.steps.get(id) else {
                continue;
            };
            let style = if step.end {
                ", fillcolor=lightgrey, style=\"rounded,filled\""
            } else {
                ""
            };
            out.push_str(&format!(
                "    \"{}\" [label=\"{}\\n({})\"{}];\n",
                escape_dot(id),
                escape_dot(id),
                escape_dot(&step.action),
                style
            ));
        }

        for id in &self.step_order {
            let Some(step) = self.steps.get(id) else {
                continue;
            };
            for (label, target) in labeled_edges(step) {
                if label.is_empty() {
                    out.push_str(&format!(
                        "    \"{}\" -> \"{}\";\n",
                        escape_dot(id),
                        escape_dot(&target)
                    ));
                } else {
                    out.push_str(&format!(
                        "    \"{}\" -> \"{}\" [label=\"{}\", style=dashed];\n",
                        escape_dot(id),
                        escape_dot(&target),
                        escape_dot(&label)
                    ));
                }
            }
        }

        out.push_str("}\n");
        out
    }
}

/// Every outgoing transition of `step`, paired with the routing key it came
/// from (empty string for plain `next`). Mirrors `StepDef::referenced_step_ids`
/// but keeps the key name instead of discarding it, since a DOT edge label
/// is the whole point here.
fn labeled_edges(step: &StepDef) -> Vec<(String, String)> {
    let mut edges = Vec::new();

    if let Some(next) = &step.next {
        edges.push((String::new(), next.clone()));
    }

    for (label, target) in [
        ("on_ok", &step.routes.on_ok),
        ("on_over", &step.routes.on_over),
        ("on_allow", &step.routes.on_allow),
        ("on_deny", &step.routes.on_deny),
        ("on_repeat", &step.routes.on_repeat),
        ("on_other", &step.routes.on_other),
        ("on_done", &step.routes.on_done),
    ] {
        if let Some(target) = target {
            edges.push((label.to_string(), target.clone()));
        }
    }

    if let Some(routes) = &step.routes.routes {
        collect_labeled_route_targets(routes, String::new(), &mut edges);
    }

    edges
}

fn collect_labeled_route_targets(value: &serde_yaml::Value, prefix: String, out: &mut Vec<(String, String)>) {
    match value {
        serde_yaml::Value::String(s) => out.push((prefix, s.clone())),
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                let key = k.as_str().unwrap_or_default();
                if key == "next" {
                    if let Some(s) = v.as_str() {
                        out.push((prefix.clone(), s.to_string()));
                    }
                } else {
                    let nested = if prefix.is_empty() {
                        key.to_string()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    collect_labeled_route_targets(v, nested, out);
                }
            }
        }
        _ => {}
    }
}

fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn def(yaml: &str) -> PipelineDefinition {
        PipelineDefinition::load_from_str(yaml, Path::new("/tmp")).unwrap()
    }

    #[test]
    fn renders_every_step_and_plain_next_edge() {
        let d = def(
            r#"
pipeline:
  name: demo
  entry_step_id: start
  settings:
    max_context_tokens: 1000
    max_turn_loops: 4
  steps:
    - id: start
      action: loop_guard
      on_allow: finish
      on_deny: finish
    - id: finish
      action: finalize
      end: true
"#,
        );
        let dot = d.to_dot();
        assert!(dot.starts_with("digraph pipeline {"));
        assert!(dot.contains("\"start\""));
        assert!(dot.contains("\"finish\""));
        assert!(dot.contains("label=\"on_allow\""));
        assert!(dot.contains("label=\"on_deny\""));
    }

    #[test]
    fn router_routes_map_yields_labeled_edges() {
        let d = def(
            r#"
pipeline:
  name: demo
  entry_step_id: route
  settings:
    max_context_tokens: 1000
    max_turn_loops: 4
  steps:
    - id: route
      action: prefix_router
      on_other: fallback
      routes:
        answer:
          prefix: "[Answer:]"
          next: finalize
        followup:
          prefix: "[Requesting data on:]"
          next: decode
    - id: finalize
      action: finalize
      end: true
    - id: decode
      action: finalize
      end: true
    - id: fallback
      action: finalize
      end: true
"#,
        );
        let dot = d.to_dot();
        assert!(dot.contains("\"route\" -> \"finalize\""));
        assert!(dot.contains("\"route\" -> \"decode\""));
        assert!(dot.contains("label=\"answer\""));
        assert!(dot.contains("label=\"followup\""));
        assert!(dot.contains("label=\"on_other\""));
    }
}
