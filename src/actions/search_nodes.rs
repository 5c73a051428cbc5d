//! `search_nodes` (§4.6): parse the query payload, merge retrieval filters
//! security-first, call the backend, and optionally rerank.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::{optional_str, optional_u32, Action, ActionContext, ActionOutcome};
use crate::actions::routers::repeat_query_guard::normalize_query;
use crate::config::{PipelineSettings, StepDef};
use crate::error::{PipelineError, Result};
use crate::jsonish;
use crate::ports::retrieval::{SearchHit, SearchRequest, SearchType, SnapshotSource};
use crate::state::RetrievalHit;

const DEFAULT_WIDEN_FACTOR: u32 = 6;
const DEFAULT_RRF_K: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rerank {
    None,
    KeywordRerank,
    CodebertRerank,
}

pub struct SearchNodesAction {
    step_id: String,
    search_type: SearchType,
    top_k: u32,
    query_parser: Option<String>,
    rerank: Rerank,
    snapshot_source: SnapshotSource,
    rrf_k: u32,
}

impl SearchNodesAction {
    pub fn from_step(step: &StepDef, settings: &PipelineSettings) -> Result<Self> {
        let search_type = match optional_str(&step.raw, "search_type").as_deref() {
            Some("semantic") => SearchType::Semantic,
            Some("bm25") => SearchType::Bm25,
            Some("hybrid") => SearchType::Hybrid,
            Some(other) => {
                return Err(PipelineError::InvalidConfig(format!(
                    "step '{}': unknown search_type '{other}'",
                    step.id
                )))
            }
            None => {
                return Err(PipelineError::InvalidConfig(format!(
                    "step '{}': search_nodes requires 'search_type'",
                    step.id
                )))
            }
        };

        let top_k = optional_u32(&step.raw, "top_k")
            .or(settings.top_k)
            .ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "step '{}': search_nodes requires 'top_k' (step or settings)",
                    step.id
                ))
            })?;

        let rerank = match optional_str(&step.raw, "rerank").as_deref() {
            None | Some("none") => Rerank::None,
            Some("keyword_rerank") => Rerank::KeywordRerank,
            Some("codebert_rerank") => Rerank::CodebertRerank,
            Some(other) => {
                return Err(PipelineError::InvalidConfig(format!(
                    "step '{}': unknown rerank '{other}'",
                    step.id
                )))
            }
        };
        if rerank != Rerank::None && search_type != SearchType::Semantic {
            return Err(PipelineError::InvalidConfig(format!(
                "step '{}': rerank is only valid when search_type == semantic",
                step.id
            )));
        }

        let snapshot_source = match optional_str(&step.raw, "snapshot_source").as_deref() {
            None | Some("primary") => SnapshotSource::Primary,
            Some("secondary") => SnapshotSource::Secondary,
            Some(other) => {
                return Err(PipelineError::InvalidConfig(format!(
                    "step '{}': unknown snapshot_source '{other}'",
                    step.id
                )))
            }
        };

        let rrf_k = optional_u32(&step.raw, "rrf_k").unwrap_or(DEFAULT_RRF_K);
        if rrf_k < 1 {
            return Err(PipelineError::InvalidConfig(format!(
                "step '{}': rrf_k must be >= 1",
                step.id
            )));
        }

        Ok(SearchNodesAction {
            step_id: step.id.clone(),
            search_type,
            top_k,
            query_parser: optional_str(&step.raw, "query_parser"),
            rerank,
            snapshot_source,
            rrf_k,
        })
    }

    fn parse_query(&self, payload: &str) -> Result<(String, BTreeMap<String, JsonValue>)> {
        if self.query_parser.is_none() {
            let query = payload.trim().to_string();
            if query.is_empty() {
                return Err(PipelineError::StepFatal {
                    step_id: self.step_id.clone(),
                    message: "search_nodes: empty query".to_string(),
                });
            }
            return Ok((query, BTreeMap::new()));
        }

        let Some(parsed) = jsonish::parse_lenient(payload) else {
            return Err(PipelineError::StepFatal {
                step_id: self.step_id.clone(),
                message: "search_nodes: could not parse query payload".to_string(),
            });
        };
        let obj = parsed.as_object().cloned().unwrap_or_default();
        let query = obj
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if query.is_empty() {
            return Err(PipelineError::StepFatal {
                step_id: self.step_id.clone(),
                message: "search_nodes: empty query after parsing".to_string(),
            });
        }
        let mut parsed_filters = BTreeMap::new();
        for (k, v) in obj {
            if k != "query" {
                parsed_filters.insert(k, v);
            }
        }
        Ok((query, parsed_filters))
    }

    async fn search_one(
        &self,
        ctx: &ActionContext<'_>,
        search_type: SearchType,
        query: &str,
        top_k: u32,
        filters: &crate::state::RetrievalFilters,
    ) -> Result<Vec<SearchHit>> {
        let req = SearchRequest {
            search_type,
            query: query.to_string(),
            top_k,
            repository: ctx.state.repository.clone(),
            branch: ctx.state.branch.clone(),
            retrieval_filters: filters.clone(),
            active_index: match self.snapshot_source {
                SnapshotSource::Primary => None,
                SnapshotSource::Secondary => Some("secondary".to_string()),
            },
        };
        ctx.runtime
            .retrieval
            .search(&req)
            .await
            .map(|r| r.hits)
            .map_err(|e| PipelineError::StepFatal {
                step_id: self.step_id.clone(),
                message: format!("retrieval backend search failed: {e}"),
            })
    }
}

/// Reciprocal rank fusion (§4.6, E4): `score(id) = Σ 1/(rrf_k + rank)`,
/// ties broken by lower semantic rank, then lower bm25 rank, then stable
/// string compare.
pub fn rrf_fuse(
    semantic: &[SearchHit],
    bm25: &[SearchHit],
    rrf_k: u32,
    top_k: u32,
) -> Vec<String> {
    let sem_rank: BTreeMap<&str, usize> = semantic
        .iter()
        .enumerate()
        .map(|(i, h)| (h.id.as_str(), i))
        .collect();
    let bm25_rank: BTreeMap<&str, usize> = bm25
        .iter()
        .enumerate()
        .map(|(i, h)| (h.id.as_str(), i))
        .collect();

    let mut ids: Vec<String> = Vec::new();
    for h in semantic.iter().chain(bm25.iter()) {
        if !ids.contains(&h.id) {
            ids.push(h.id.clone());
        }
    }

    let score = |id: &str| -> f64 {
        let mut s = 0.0;
        if let Some(r) = sem_rank.get(id) {
            s += 1.0 / (rrf_k as f64 + *r as f64 + 1.0);
        }
        if let Some(r) = bm25_rank.get(id) {
            s += 1.0 / (rrf_k as f64 + *r as f64 + 1.0);
        }
        s
    };

    ids.sort_by(|a, b| {
        let sa = score(a);
        let sb = score(b);
        sb.partial_cmp(&sa)
            .unwrap()
            .then_with(|| {
                let ra = sem_rank.get(a.as_str()).copied().unwrap_or(usize::MAX);
                let rb = sem_rank.get(b.as_str()).copied().unwrap_or(usize::MAX);
                ra.cmp(&rb)
            })
            .then_with(|| {
                let ra = bm25_rank.get(a.as_str()).copied().unwrap_or(usize::MAX);
                let rb = bm25_rank.get(b.as_str()).copied().unwrap_or(usize::MAX);
                ra.cmp(&rb)
            })
            .then_with(|| a.cmp(b))
    });

    ids.truncate(top_k as usize);
    ids
}

/// Deterministic keyword overlap score against the query, used for
/// `keyword_rerank`/`codebert_rerank` (no neural reranker port is
/// specified, so both names share this algorithm) without fetching node
/// text — `search_nodes` never leaks text into retrieval (§4.1).
fn keyword_score(id: &str, query_tokens: &[String]) -> usize {
    let id_lower = id.to_lowercase();
    query_tokens
        .iter()
        .filter(|t| id_lower.contains(t.as_str()))
        .count()
}

#[async_trait]
impl Action for SearchNodesAction {
    fn name(&self) -> &'static str {
        "search_nodes"
    }

    async fn run(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome> {
        ctx.state.clear_retrieval_scratch();

        let payload = ctx.state.last_model_response.clone();
        let (query, parsed_filters) = self.parse_query(&payload)?;

        let mut scope_additions = BTreeMap::new();
        scope_additions.insert(
            "repo".to_string(),
            JsonValue::String(ctx.state.repository.clone()),
        );
        scope_additions.insert(
            "branch".to_string(),
            JsonValue::String(ctx.state.branch.clone()),
        );
        if let Some(snapshot) = &ctx.state.snapshot_id {
            scope_additions.insert("snapshot".to_string(), JsonValue::String(snapshot.clone()));
        }
        let filters_base = ctx.state.retrieval_filters.union_extend(&scope_additions);
        let filters_effective = filters_base.merge_base_over(&parsed_filters);

        let ordered_ids: Vec<String> = match self.search_type {
            SearchType::Hybrid => {
                let semantic = self
                    .search_one(ctx, SearchType::Semantic, &query, self.top_k, &filters_effective)
                    .await?;
                let bm25 = self
                    .search_one(ctx, SearchType::Bm25, &query, self.top_k, &filters_effective)
                    .await?;
                rrf_fuse(&semantic, &bm25, self.rrf_k, self.top_k)
            }
            other => {
                let widened_top_k = if self.rerank != Rerank::None {
                    self.top_k * DEFAULT_WIDEN_FACTOR
                } else {
                    self.top_k
                };
                let mut hits = self
                    .search_one(ctx, other, &query, widened_top_k, &filters_effective)
                    .await?;

                if self.rerank != Rerank::None {
                    let query_tokens: Vec<String> = query
                        .split_whitespace()
                        .map(|s| s.to_lowercase())
                        .collect();
                    hits.sort_by(|a, b| {
                        let sa = keyword_score(&a.id, &query_tokens);
                        let sb = keyword_score(&b.id, &query_tokens);
                        sb.cmp(&sa)
                            .then_with(|| a.rank.cmp(&b.rank))
                            .then_with(|| a.id.cmp(&b.id))
                    });
                }
                hits.truncate(self.top_k as usize);
                hits.into_iter().map(|h| h.id).collect()
            }
        };

        for (rank, id) in ordered_ids.iter().enumerate() {
            crate::state::PipelineState::push_unique_id(
                &mut ctx.state.retrieval_seed_nodes,
                id.clone(),
            );
            ctx.state.retrieval_hits.push(RetrievalHit {
                id: id.clone(),
                score: 1.0 / (rank as f64 + 1.0),
                rank,
            });
        }

        ctx.state
            .retrieval_queries_asked_norm
            .insert(normalize_query(&query));

        Ok(ActionOutcome::Next(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, rank: usize) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            score: 1.0,
            rank,
        }
    }

    #[test]
    fn rrf_fuse_matches_e4_tie_break() {
        let semantic = vec![hit("A", 0), hit("B", 1), hit("C", 2)];
        let bm25 = vec![hit("B", 0), hit("A", 1), hit("D", 2)];
        let fused = rrf_fuse(&semantic, &bm25, 60, 3);
        assert_eq!(fused, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
    }
}
