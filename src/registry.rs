//! `PipelineRegistry` — fingerprint-keyed cache of compiled
//! `PipelineDefinition`s, so a long-lived embedder doesn't reparse YAML
//! per request (SPEC_FULL §9 supplemental features). Grounded in the
//! teacher's read-mostly `DashMap` caches (`api::ws::pool::ConnectionPool`).

use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::PipelineDefinition;
use crate::error::Result;

pub struct PipelineRegistry {
    by_fingerprint: DashMap<String, Arc<PipelineDefinition>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            by_fingerprint: DashMap::new(),
        }
    }

    /// Load `path`, returning the cached definition if one with a
    /// matching fingerprint is already resident. A changed pipeline file
    /// (or a changed referenced prompt file, once folded into the
    /// fingerprint per §4.15) produces a different fingerprint and is
    /// loaded fresh.
    pub fn load_cached(&self, path: &Path) -> Result<Arc<PipelineDefinition>> {
        let def = PipelineDefinition::load_from_path(path)?;
        if let Some(cached) = self.by_fingerprint.get(&def.fingerprint) {
            return Ok(Arc::clone(&cached));
        }
        let def = Arc::new(def);
        self.by_fingerprint
            .insert(def.fingerprint.clone(), Arc::clone(&def));
        Ok(def)
    }

    /// One-shot load with no caching (tests, CLIs).
    pub fn load(path: &Path) -> Result<PipelineDefinition> {
        PipelineDefinition::load_from_path(path)
    }

    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_cached_reuses_same_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(
            br#"
pipeline:
  name: p
  entry_step_id: a
  settings: { max_context_tokens: 100 }
  steps:
    - id: a
      action: finalize
      end: true
"#,
        )
        .unwrap();

        let registry = PipelineRegistry::new();
        let first = registry.load_cached(&path).unwrap();
        let second = registry.load_cached(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }
}
