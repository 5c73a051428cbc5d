//! `PipelineDefinition` and `extends` resolution (§4.1).

use super::loader::{deep_merge, fingerprint};
use super::settings::PipelineSettings;
use super::step::StepDef;
use super::validator;
use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A fully resolved, validated pipeline graph. Immutable after load.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: String,
    pub settings: PipelineSettings,
    pub entry_step_id: String,
    /// Keyed by step id; authoring order is not execution order (§4.1).
    pub steps: HashMap<String, StepDef>,
    /// Authoring order, retained only for `visualization::to_dot` and
    /// error messages that want to cite "step 3 of N".
    pub step_order: Vec<String>,
    pub fingerprint: String,
}

/// Raw `pipeline:` document shape, one per YAML file before `extends` is
/// resolved.
#[derive(Debug, Clone, Deserialize)]
struct RawPipelineFile {
    pipeline: RawPipeline,
}

#[derive(Debug, Clone, Deserialize)]
struct RawPipeline {
    name: String,
    #[serde(default)]
    extends: Option<String>,
    #[serde(default)]
    settings: serde_yaml::Value,
    #[serde(default)]
    entry_step_id: Option<String>,
    #[serde(default)]
    steps: Vec<StepDef>,
}

impl PipelineDefinition {
    /// Load a pipeline from `path`, walking its `extends` chain
    /// root-first, deep-merging settings and merging steps by id (child
    /// replaces parent wholesale on a matching id), then validating the
    /// result.
    pub fn load_from_path(path: &Path) -> Result<PipelineDefinition> {
        let chain = Self::resolve_extends_chain(path)?;
        Self::merge_chain(chain, path)
    }

    /// Parse a pipeline already held as a string (tests, embedders that
    /// keep pipelines in a non-filesystem store). `extends` is resolved
    /// relative to `base_dir`.
    pub fn load_from_str(yaml: &str, base_dir: &Path) -> Result<PipelineDefinition> {
        let raw: RawPipelineFile = serde_yaml::from_str(yaml)
            .map_err(|e| PipelineError::InvalidConfig(format!("invalid pipeline YAML: {e}")))?;
        let mut chain = vec![raw.pipeline.clone()];
        let mut extends = raw.pipeline.extends.clone();
        while let Some(parent_name) = extends {
            let parent_path = base_dir.join(format!("{parent_name}.yaml"));
            let parent_yaml = std::fs::read_to_string(&parent_path).map_err(|e| {
                PipelineError::InvalidConfig(format!(
                    "extends target {} not found: {e}",
                    parent_path.display()
                ))
            })?;
            let parent_raw: RawPipelineFile = serde_yaml::from_str(&parent_yaml).map_err(|e| {
                PipelineError::InvalidConfig(format!("invalid pipeline YAML in extends chain: {e}"))
            })?;
            extends = parent_raw.pipeline.extends.clone();
            chain.push(parent_raw.pipeline);
        }
        chain.reverse(); // root -> ... -> child
        Self::build(chain, yaml)
    }

    fn resolve_extends_chain(path: &Path) -> Result<Vec<RawPipeline>> {
        let mut chain = Vec::new();
        let mut current_path: PathBuf = path.to_path_buf();
        loop {
            let content = std::fs::read_to_string(&current_path).map_err(|e| {
                PipelineError::InvalidConfig(format!(
                    "failed to read {}: {e}",
                    current_path.display()
                ))
            })?;
            let raw: RawPipelineFile = serde_yaml::from_str(&content).map_err(|e| {
                PipelineError::InvalidConfig(format!(
                    "invalid pipeline YAML in {}: {e}",
                    current_path.display()
                ))
            })?;
            let extends = raw.pipeline.extends.clone();
            chain.push(raw.pipeline);
            match extends {
                Some(parent_name) => {
                    let dir = current_path.parent().unwrap_or_else(|| Path::new("."));
                    current_path = dir.join(format!("{parent_name}.yaml"));
                }
                None => break,
            }
        }
        chain.reverse(); // root first
        Ok(chain)
    }

    fn merge_chain(chain: Vec<RawPipeline>, path: &Path) -> Result<PipelineDefinition> {
        let source = std::fs::read_to_string(path).unwrap_or_default();
        Self::build(chain, &source)
    }

    /// Merge a root-to-child `extends` chain into one `PipelineDefinition`
    /// and validate it. `source_for_fingerprint` is whatever raw text
    /// should seed the content hash (the leaf file's own source is enough
    /// since its ancestors are reachable only through its own `extends`
    /// key, and any ancestor content change flows through here too since
    /// `fingerprint` is recomputed from the *merged* graph below).
    fn build(chain: Vec<RawPipeline>, _source_for_fingerprint: &str) -> Result<PipelineDefinition> {
        if chain.is_empty() {
            return Err(PipelineError::InvalidConfig("empty extends chain".into()));
        }

        let mut name = String::new();
        let mut merged_settings = serde_yaml::Value::Mapping(Default::default());
        let mut entry_step_id: Option<String> = None;
        let mut steps_by_id: HashMap<String, StepDef> = HashMap::new();
        let mut step_order: Vec<String> = Vec::new();

        for link in &chain {
            name = link.name.clone();
            deep_merge(&mut merged_settings, &link.settings);
            if link.entry_step_id.is_some() {
                entry_step_id = link.entry_step_id.clone();
            }
            for step in &link.steps {
                if !steps_by_id.contains_key(&step.id) {
                    step_order.push(step.id.clone());
                }
                // Child replaces parent wholesale on matching id (§4.1).
                steps_by_id.insert(step.id.clone(), step.clone());
            }
        }

        let settings: PipelineSettings = serde_yaml::from_value(merged_settings)
            .map_err(|e| PipelineError::InvalidConfig(format!("invalid settings: {e}")))?;

        let entry_step_id = entry_step_id
            .ok_or_else(|| PipelineError::InvalidConfig("missing entry_step_id".to_string()))?;

        let expanded_yaml = serde_yaml::to_string(&steps_by_id)
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        let fp = fingerprint(&expanded_yaml, &[]);

        let definition = PipelineDefinition {
            name,
            settings,
            entry_step_id,
            steps: steps_by_id,
            step_order,
            fingerprint: fp,
        };

        validator::validate(&definition)?;
        Ok(definition)
    }

    pub fn step(&self, id: &str) -> Option<&StepDef> {
        self.steps.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn extends_merges_settings_and_overrides_steps_by_id() {
        let dir = tempfile::tempdir().unwrap();
        write_temp(
            dir.path(),
            "base.yaml",
            r#"
pipeline:
  name: base
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
        let child_path = write_temp(
            dir.path(),
            "child.yaml",
            r#"
pipeline:
  name: child
  extends: base
  settings:
    max_context_tokens: 2000
  steps:
    - id: finish
      action: finalize
      persist_turn: false
      end: true
"#,
        );

        let def = PipelineDefinition::load_from_path(&child_path).unwrap();
        assert_eq!(def.settings.max_context_tokens, 2000);
        assert_eq!(def.settings.max_turn_loops, 4); // inherited from base
        assert_eq!(def.steps.len(), 2);
        assert_eq!(
            def.steps["finish"].raw.get("persist_turn"),
            Some(&serde_yaml::Value::Bool(false))
        );
    }

    #[test]
    fn missing_entry_step_id_is_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(
            dir.path(),
            "bad.yaml",
            r#"
pipeline:
  name: bad
  settings:
    max_context_tokens: 100
  steps:
    - id: only
      action: finalize
      end: true
"#,
        );
        let err = PipelineDefinition::load_from_path(&path).unwrap_err();
        assert_eq!(err.code(), "PIPELINE_INVALID_CONFIG");
    }
}
