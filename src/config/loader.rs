//! YAML loading primitives: parsing, env-var expansion, deep merge and
//! content fingerprinting.
//!
//! Ported from the teacher's `orchestrator::config::loader`, generalized
//! from `$include`-based composition (not needed here — a pipeline's only
//! form of reuse is `extends`, handled in `config::definition`) down to the
//! three primitives this crate actually needs: env expansion, deep merge
//! and fingerprinting.

use sha2::{Digest, Sha256};
use std::env;
use std::path::Path;

/// Read and parse a YAML file, expanding `${VAR:default}` placeholders in
/// every string scalar.
pub fn load_yaml_file(path: &Path) -> Result<serde_yaml::Value, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let mut value: serde_yaml::Value = serde_yaml::from_str(&content)
        .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
    expand_variables(&mut value);
    Ok(value)
}

fn expand_variables(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) => {
            if let Some(expanded) = expand_env_in_string(s) {
                *s = expanded;
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_variables(v);
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq.iter_mut() {
                expand_variables(item);
            }
        }
        _ => {}
    }
}

/// Expand `${VAR}` / `${VAR:default}` occurrences in a string. Returns
/// `None` when the string contains no placeholder (so callers can skip the
/// allocation in the common case).
fn expand_env_in_string(s: &str) -> Option<String> {
    if !s.contains("${") {
        return None;
    }
    let re = regex::Regex::new(r"\$\{([^:}]+)(?::([^}]*))?\}").ok()?;
    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        let full_match = cap.get(0)?.as_str();
        let var_name = cap.get(1)?.as_str();
        let default_value = cap.get(2).map(|m| m.as_str()).unwrap_or("");
        let value = env::var(var_name).unwrap_or_else(|_| default_value.to_string());
        result = result.replace(full_match, &value);
    }
    Some(result)
}

/// Deep-merge `other` into `base` in place: mappings merge key-by-key
/// recursively, everything else in `other` overrides `base` wholesale.
/// This is the single primitive behind both settings merge and step-by-id
/// override in `config::definition::PipelineDefinition::resolve_extends`.
pub fn deep_merge(base: &mut serde_yaml::Value, other: &serde_yaml::Value) {
    match (base, other) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(other_map)) => {
            for (key, other_value) in other_map {
                if let Some(base_value) = base_map.get_mut(key) {
                    deep_merge(base_value, other_value);
                } else {
                    base_map.insert(key.clone(), other_value.clone());
                }
            }
        }
        (base, other) => {
            *base = other.clone();
        }
    }
}

/// Content fingerprint of an expanded pipeline graph plus any referenced
/// prompt files, used to key the definition cache (§3 lifecycle) and to
/// invalidate it when a prompt file on disk changes.
pub fn fingerprint(expanded_yaml: &str, prompt_file_contents: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(expanded_yaml.as_bytes());
    for content in prompt_file_contents {
        hasher.update(b"\0");
        hasher.update(content.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_with_value() {
        env::set_var("CC_TEST_VAR", "hello");
        assert_eq!(
            expand_env_in_string("prefix ${CC_TEST_VAR} suffix"),
            Some("prefix hello suffix".to_string())
        );
        env::remove_var("CC_TEST_VAR");
    }

    #[test]
    fn expand_env_falls_back_to_default() {
        assert_eq!(
            expand_env_in_string("${CC_MISSING_VAR:fallback}"),
            Some("fallback".to_string())
        );
    }

    #[test]
    fn deep_merge_overrides_nested_keys_only() {
        let mut base: serde_yaml::Value = serde_yaml::from_str(
            "a: 1\nb:\n  c: 2\n  d: 3\n",
        )
        .unwrap();
        let other: serde_yaml::Value = serde_yaml::from_str(
            "b:\n  c: 20\n  e: 4\nf: 5\n",
        )
        .unwrap();
        deep_merge(&mut base, &other);

        assert_eq!(base["a"], serde_yaml::Value::from(1));
        assert_eq!(base["b"]["c"], serde_yaml::Value::from(20));
        assert_eq!(base["b"]["d"], serde_yaml::Value::from(3));
        assert_eq!(base["b"]["e"], serde_yaml::Value::from(4));
        assert_eq!(base["f"], serde_yaml::Value::from(5));
    }

    #[test]
    fn fingerprint_changes_with_prompt_file_content() {
        let a = fingerprint("yaml", &["prompt v1".to_string()]);
        let b = fingerprint("yaml", &["prompt v2".to_string()]);
        assert_ne!(a, b);
    }
}
