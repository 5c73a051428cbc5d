//! Retrieval backend port (§6): `search` and `fetch_texts`. The backend
//! alone enforces ACL — the engine only ever sees ids and texts already
//! filtered to what the caller's `retrieval_filters` permits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::state::RetrievalFilters;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Semantic,
    Bm25,
    Hybrid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Primary,
    Secondary,
}

impl Default for SnapshotSource {
    fn default() -> Self {
        SnapshotSource::Primary
    }
}

/// One search request. `active_index` lets a backend that maintains
/// separate primary/secondary indices pick the right one for fork/merge
/// snapshot comparisons.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub search_type: SearchType,
    pub query: String,
    pub top_k: u32,
    pub repository: String,
    pub branch: String,
    pub retrieval_filters: RetrievalFilters,
    pub active_index: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub rank: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<BTreeMap<String, serde_json::Value>>,
}

/// One fetched node's text plus the security metadata that must be
/// aggregated into `PipelineState`'s `*_union` fields (§3, §4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FetchedText {
    pub text: String,
    #[serde(default)]
    pub classification_labels: Vec<String>,
    #[serde(default)]
    pub acl_labels: Vec<String>,
    #[serde(default)]
    pub doc_level: u32,
}

#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    async fn search(&self, req: &SearchRequest) -> anyhow::Result<SearchResponse>;

    async fn fetch_texts(
        &self,
        ids: &[String],
        repository: &str,
        branch: &str,
        retrieval_filters: &RetrievalFilters,
        active_index: Option<&str>,
    ) -> anyhow::Result<HashMap<String, FetchedText>>;
}
