//! Graph provider port (§6): dependency-tree expansion from seed nodes.

use async_trait::async_trait;

use crate::state::{GraphEdge, RetrievalFilters};

#[derive(Debug, Clone, Default)]
pub struct ExpandResponse {
    pub nodes: Vec<String>,
    pub edges: Vec<GraphEdge>,
}

#[async_trait]
pub trait GraphProvider: Send + Sync {
    async fn expand_dependency_tree(
        &self,
        seed_nodes: &[String],
        repository: &str,
        branch: &str,
        max_depth: u32,
        max_nodes: u32,
        edge_allowlist: Option<&[String]>,
        retrieval_filters: &RetrievalFilters,
    ) -> anyhow::Result<ExpandResponse>;
}
