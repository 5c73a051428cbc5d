//! Static validation: id resolution, reachability, required routing keys,
//! terminal conditions, and settings sanity checks (§4.1).

use super::definition::PipelineDefinition;
use crate::error::{PipelineError, Result};
use std::collections::{HashSet, VecDeque};

pub fn validate(def: &PipelineDefinition) -> Result<()> {
    validate_settings(def)?;
    validate_entry_reachable(def)?;
    validate_referenced_ids(def)?;
    validate_required_routes(def)?;
    validate_reachability(def)?;
    validate_terminal_conditions(def)?;
    Ok(())
}

fn validate_settings(def: &PipelineDefinition) -> Result<()> {
    if def.settings.max_context_tokens == 0 {
        return Err(PipelineError::InvalidConfig(
            "settings.max_context_tokens must be > 0".to_string(),
        ));
    }
    if let Some(depth) = def.settings.graph_max_depth {
        if depth == 0 {
            return Err(PipelineError::InvalidConfig(
                "settings.graph_max_depth must be >= 1".to_string(),
            ));
        }
    }
    if let Some(nodes) = def.settings.graph_max_nodes {
        if nodes == 0 {
            return Err(PipelineError::InvalidConfig(
                "settings.graph_max_nodes must be >= 1".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_entry_reachable(def: &PipelineDefinition) -> Result<()> {
    if !def.steps.contains_key(&def.entry_step_id) {
        return Err(PipelineError::InvalidConfig(format!(
            "entry_step_id '{}' does not resolve to a step",
            def.entry_step_id
        )));
    }
    Ok(())
}

fn validate_referenced_ids(def: &PipelineDefinition) -> Result<()> {
    for step in def.steps.values() {
        for ref_id in step.referenced_step_ids() {
            if !def.steps.contains_key(&ref_id) {
                return Err(PipelineError::InvalidConfig(format!(
                    "step '{}' references unknown step id '{}'",
                    step.id, ref_id
                )));
            }
        }
    }
    Ok(())
}

fn validate_required_routes(def: &PipelineDefinition) -> Result<()> {
    for step in def.steps.values() {
        let required: &[&str] = match step.action.as_str() {
            "prefix_router" => &["on_other"],
            "json_decision_router" => &["on_other"],
            "loop_guard" => &["on_allow", "on_deny"],
            "manage_context_budget" => &["on_ok", "on_over"],
            "repeat_query_guard" => &["on_ok", "on_repeat"],
            "fork_action" => &["on_done"],
            _ => &[],
        };
        for key in required {
            let present = match *key {
                "on_ok" => step.routes.on_ok.is_some(),
                "on_over" => step.routes.on_over.is_some(),
                "on_allow" => step.routes.on_allow.is_some(),
                "on_deny" => step.routes.on_deny.is_some(),
                "on_repeat" => step.routes.on_repeat.is_some(),
                "on_other" => step.routes.on_other.is_some(),
                "on_done" => step.routes.on_done.is_some(),
                _ => false,
            };
            if !present {
                return Err(PipelineError::InvalidConfig(format!(
                    "step '{}' (action '{}') is missing required routing key '{}'",
                    step.id, step.action, key
                )));
            }
        }
    }
    Ok(())
}

fn validate_reachability(def: &PipelineDefinition) -> Result<()> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(def.entry_step_id.clone());
    visited.insert(def.entry_step_id.clone());

    while let Some(id) = queue.pop_front() {
        let Some(step) = def.steps.get(&id) else { continue };
        for next_id in step.referenced_step_ids() {
            if visited.insert(next_id.clone()) {
                queue.push_back(next_id);
            }
        }
    }

    let unreachable: Vec<&String> = def
        .steps
        .keys()
        .filter(|id| !visited.contains(*id))
        .collect();

    if !unreachable.is_empty() {
        let mut ids: Vec<String> = unreachable.into_iter().cloned().collect();
        ids.sort();
        return Err(PipelineError::InvalidConfig(format!(
            "unreachable step(s): {}",
            ids.join(", ")
        )));
    }
    Ok(())
}

fn validate_terminal_conditions(def: &PipelineDefinition) -> Result<()> {
    let has_terminal = def.steps.values().any(|s| {
        s.end
            || (s.next.is_none()
                && s.routes.on_ok.is_none()
                && s.routes.on_over.is_none()
                && s.routes.on_allow.is_none()
                && s.routes.on_deny.is_none()
                && s.routes.on_repeat.is_none()
                && s.routes.on_other.is_none()
                && s.routes.on_done.is_none()
                && s.routes.routes.is_none())
    });
    if !has_terminal {
        return Err(PipelineError::InvalidConfig(
            "pipeline has no terminal step (no `end: true` and no step with an unconditional null-returning path)"
                .to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::definition::PipelineDefinition;
    use std::path::Path;

    fn load(yaml: &str) -> Result<PipelineDefinition> {
        PipelineDefinition::load_from_str(yaml, Path::new("."))
    }

    #[test]
    fn rejects_dangling_next_reference() {
        let yaml = r#"
pipeline:
  name: p
  entry_step_id: a
  settings: { max_context_tokens: 100 }
  steps:
    - id: a
      action: finalize
      next: nonexistent
"#;
        let err = load(yaml).unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn rejects_missing_required_routing_key() {
        let yaml = r#"
pipeline:
  name: p
  entry_step_id: a
  settings: { max_context_tokens: 100 }
  steps:
    - id: a
      action: loop_guard
      on_allow: a
"#;
        let err = load(yaml).unwrap_err();
        assert!(err.to_string().contains("on_deny"));
    }

    #[test]
    fn rejects_unreachable_step() {
        let yaml = r#"
pipeline:
  name: p
  entry_step_id: a
  settings: { max_context_tokens: 100 }
  steps:
    - id: a
      action: finalize
      end: true
    - id: orphan
      action: finalize
      end: true
"#;
        let err = load(yaml).unwrap_err();
        assert!(err.to_string().contains("orphan"));
    }

    #[test]
    fn accepts_minimal_valid_pipeline() {
        let yaml = r#"
pipeline:
  name: p
  entry_step_id: a
  settings: { max_context_tokens: 100 }
  steps:
    - id: a
      action: finalize
      end: true
"#;
        assert!(load(yaml).is_ok());
    }
}
