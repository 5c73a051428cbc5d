//! `fetch_node_texts` (§4.8): ordered selection plus atomic budget
//! enforcement. An entry is either fully present or entirely skipped —
//! no partial snippets.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};

use super::{optional_str, optional_u32, Action, ActionContext, ActionOutcome};
use crate::config::{PipelineSettings, StepDef};
use crate::error::{PipelineError, Result};
use crate::state::NodeText;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prioritization {
    SeedFirst,
    GraphFirst,
    Balanced,
}

#[derive(Debug, Clone)]
enum Budget {
    Chars(u32),
    Tokens(u32),
}

pub struct FetchNodeTextsAction {
    step_id: String,
    prioritization: Prioritization,
    budget_tokens_from_settings: Option<String>,
    configured_budget: Option<Budget>,
}

impl FetchNodeTextsAction {
    pub fn from_step(step: &StepDef, _settings: &PipelineSettings) -> Result<Self> {
        let prioritization = match optional_str(&step.raw, "prioritization_mode").as_deref() {
            None | Some("balanced") => Prioritization::Balanced,
            Some("seed_first") => Prioritization::SeedFirst,
            Some("graph_first") => Prioritization::GraphFirst,
            Some(other) => {
                return Err(PipelineError::InvalidConfig(format!(
                    "step '{}': unknown prioritization_mode '{other}'",
                    step.id
                )))
            }
        };

        let max_chars = optional_u32(&step.raw, "max_chars");
        let budget_tokens = optional_u32(&step.raw, "budget_tokens");
        let budget_tokens_from_settings = optional_str(&step.raw, "budget_tokens_from_settings");

        let token_budget_configured = budget_tokens.is_some() || budget_tokens_from_settings.is_some();
        if max_chars.is_some() && token_budget_configured {
            return Err(PipelineError::InvalidConfig(format!(
                "step '{}': fetch_node_texts cannot set max_chars together with a token budget",
                step.id
            )));
        }

        let configured_budget = if let Some(chars) = max_chars {
            Some(Budget::Chars(chars))
        } else {
            budget_tokens.map(Budget::Tokens)
        };

        Ok(FetchNodeTextsAction {
            step_id: step.id.clone(),
            prioritization,
            budget_tokens_from_settings,
            configured_budget,
        })
    }

    fn resolve_budget(&self, settings: &PipelineSettings) -> Result<Budget> {
        if let Some(b) = &self.configured_budget {
            return Ok(b.clone());
        }
        if let Some(key) = &self.budget_tokens_from_settings {
            let value = match key.as_str() {
                "max_context_tokens" => Some(settings.max_context_tokens),
                "max_history_tokens" => Some(settings.max_history_tokens),
                _ => None,
            };
            return value.map(Budget::Tokens).ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "step '{}': budget_tokens_from_settings names unknown settings key '{key}'",
                    self.step_id
                ))
            });
        }
        // Implicit default: 70% of the global prompt-token budget (§4.8).
        let implicit = (settings.max_context_tokens as f64 * 0.7).floor() as u32;
        Ok(Budget::Tokens(implicit))
    }
}

/// Multi-source BFS from `seeds` over `graph_edges`, returning the minimum
/// depth and a best-effort first-discovered parent for every reachable
/// node beyond the seeds themselves.
fn bfs_depth_and_parent(
    seeds: &[String],
    edges: &[crate::state::GraphEdge],
) -> (HashMap<String, u32>, HashMap<String, String>) {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for e in edges {
        adjacency
            .entry(e.from_id.as_str())
            .or_default()
            .push(e.to_id.as_str());
    }

    let mut depth: HashMap<String, u32> = HashMap::new();
    let mut parent: HashMap<String, String> = HashMap::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for s in seeds {
        depth.insert(s.clone(), 0);
        queue.push_back(s.clone());
    }
    while let Some(current) = queue.pop_front() {
        let current_depth = depth[&current];
        if let Some(next_ids) = adjacency.get(current.as_str()) {
            for next in next_ids {
                if !depth.contains_key(*next) {
                    depth.insert(next.to_string(), current_depth + 1);
                    parent.insert(next.to_string(), current.clone());
                    queue.push_back(next.to_string());
                }
            }
        }
    }
    (depth, parent)
}

struct Candidate {
    id: String,
    is_seed: bool,
    depth: u32,
    parent_id: Option<String>,
}

fn build_ordering(
    mode: Prioritization,
    seeds: &[String],
    expanded: &[String],
    depth: &HashMap<String, u32>,
    parent: &HashMap<String, String>,
) -> Vec<Candidate> {
    let seed_set: HashSet<&str> = seeds.iter().map(|s| s.as_str()).collect();
    let mut graph_only: Vec<&String> = expanded.iter().filter(|id| !seed_set.contains(id.as_str())).collect();
    graph_only.sort_by(|a, b| {
        let da = depth.get(a.as_str()).copied().unwrap_or(u32::MAX);
        let db = depth.get(b.as_str()).copied().unwrap_or(u32::MAX);
        da.cmp(&db).then_with(|| a.cmp(b))
    });

    let to_candidate = |id: &str, is_seed: bool| Candidate {
        id: id.to_string(),
        is_seed,
        depth: if is_seed { 0 } else { depth.get(id).copied().unwrap_or(1) },
        parent_id: parent.get(id).cloned(),
    };

    match mode {
        Prioritization::SeedFirst => {
            let mut out: Vec<Candidate> = seeds.iter().map(|id| to_candidate(id, true)).collect();
            out.extend(graph_only.iter().map(|id| to_candidate(id, false)));
            out
        }
        Prioritization::GraphFirst => {
            let mut out = Vec::new();
            for seed in seeds {
                out.push(to_candidate(seed, true));
                let mut descendants: Vec<&String> = graph_only
                    .iter()
                    .filter(|id| is_descendant_of(id, seed, parent))
                    .cloned()
                    .collect();
                descendants.sort_by(|a, b| {
                    let da = depth.get(a.as_str()).copied().unwrap_or(u32::MAX);
                    let db = depth.get(b.as_str()).copied().unwrap_or(u32::MAX);
                    da.cmp(&db).then_with(|| a.cmp(b))
                });
                out.extend(descendants.into_iter().map(|id| to_candidate(id, false)));
            }
            out
        }
        Prioritization::Balanced => {
            let mut out = Vec::new();
            let mut si = 0;
            let mut gi = 0;
            while si < seeds.len() || gi < graph_only.len() {
                if si < seeds.len() {
                    out.push(to_candidate(&seeds[si], true));
                    si += 1;
                }
                if gi < graph_only.len() {
                    out.push(to_candidate(graph_only[gi], false));
                    gi += 1;
                }
            }
            out
        }
    }
}

fn is_descendant_of(id: &str, seed: &str, parent: &HashMap<String, String>) -> bool {
    let mut current = id;
    loop {
        match parent.get(current) {
            Some(p) if p == seed => return true,
            Some(p) => current = p.as_str(),
            None => return false,
        }
    }
}

#[async_trait]
impl Action for FetchNodeTextsAction {
    fn name(&self) -> &'static str {
        "fetch_node_texts"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        let budget = self.resolve_budget(ctx.settings)?;

        let (depth, parent) =
            bfs_depth_and_parent(&ctx.state.retrieval_seed_nodes, &ctx.state.graph_edges);
        let ordering = build_ordering(
            self.prioritization,
            &ctx.state.retrieval_seed_nodes,
            &ctx.state.graph_expanded_nodes,
            &depth,
            &parent,
        );

        if ordering.is_empty() {
            ctx.state.node_texts.clear();
            return Ok(ActionOutcome::Next(None));
        }

        let all_ids: Vec<String> = ordering.iter().map(|c| c.id.clone()).collect();
        let fetched = ctx
            .runtime
            .retrieval
            .fetch_texts(
                &all_ids,
                &ctx.state.repository,
                &ctx.state.branch,
                &ctx.state.retrieval_filters,
                None,
            )
            .await
            .map_err(|e| PipelineError::StepFatal {
                step_id: self.step_id.clone(),
                message: format!("retrieval backend fetch_texts failed: {e}"),
            })?;

        let mut accumulated: u32 = 0;
        let mut node_texts = Vec::new();
        let mut classification_labels_union: HashSet<String> = HashSet::new();
        let mut acl_labels_union: HashSet<String> = HashSet::new();
        let mut doc_level_max: u32 = 0;

        for candidate in &ordering {
            let Some(fetched_text) = fetched.get(&candidate.id) else {
                continue;
            };
            let cost = match budget {
                Budget::Chars(_) => fetched_text.text.chars().count() as u32,
                Budget::Tokens(_) => ctx.runtime.token_counter.count(&fetched_text.text),
            };
            let limit = match budget {
                Budget::Chars(c) => c,
                Budget::Tokens(t) => t,
            };
            if accumulated.saturating_add(cost) > limit {
                continue;
            }
            accumulated += cost;

            classification_labels_union.extend(fetched_text.classification_labels.iter().cloned());
            acl_labels_union.extend(fetched_text.acl_labels.iter().cloned());
            doc_level_max = doc_level_max.max(fetched_text.doc_level);

            node_texts.push(NodeText {
                id: candidate.id.clone(),
                text: fetched_text.text.clone(),
                is_seed: candidate.is_seed,
                depth: candidate.depth,
                parent_id: candidate.parent_id.clone(),
                classification_labels: fetched_text.classification_labels.clone(),
                acl_labels: fetched_text.acl_labels.clone(),
                doc_level: fetched_text.doc_level,
            });
        }

        ctx.state.node_texts = node_texts;
        ctx.state
            .classification_labels_union
            .extend(classification_labels_union);
        ctx.state.acl_labels_union.extend(acl_labels_union);
        ctx.state.doc_level_max = ctx.state.doc_level_max.max(doc_level_max);

        Ok(ActionOutcome::Next(None))
    }
}
