//! `PipelineState` — the per-run mutable record (§3).
//!
//! One instance per request; created by the engine, mutated by actions,
//! discarded at turn end. Never shared across runs (§5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Security-scoped retrieval constraints. "Sacred": no action may remove or
/// override a key already present; parsed query payloads may only *extend*
/// non-security constraints (§3, §9).
///
/// Modeled as a newtype rather than a bare map so the two legal mutation
/// modes are the only public entry points — there is no `get_mut`/`insert`
/// that would let an action quietly clobber an ACL key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrievalFilters(BTreeMap<String, JsonValue>);

impl RetrievalFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: BTreeMap<String, JsonValue>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &BTreeMap<String, JsonValue> {
        &self.0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Union `self` with `parsed`, where `parsed` may only add keys `self`
    /// does not already define. Used by `search_nodes` to build
    /// `filters_base` from `state.retrieval_filters ∪ {repo, branch, snapshot}`
    /// — keys supplied here are new scope keys, not attacker-controlled
    /// payload, so no conflict resolution preference is needed beyond
    /// "self wins if both set it".
    pub fn union_extend(&self, additions: &BTreeMap<String, JsonValue>) -> Self {
        let mut merged = self.0.clone();
        for (k, v) in additions {
            merged.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Self(merged)
    }

    /// Merge `self` (the sacred base) over `parsed` (attacker-controlled
    /// query payload): `parsed` may extend with new keys, but any key also
    /// present in `self` keeps `self`'s value. This is the filter-merge
    /// rule in §4.6: "filters_effective = parsed_filters ∪ filters_base
    /// with base overriding parsed on conflict".
    pub fn merge_base_over(&self, parsed: &BTreeMap<String, JsonValue>) -> Self {
        let mut merged = parsed.clone();
        for (k, v) in &self.0 {
            merged.insert(k.clone(), v.clone());
        }
        Self(merged)
    }

    /// True iff every key in `self` is present with an identical value in
    /// `other` — the invariant checked at step exit (§8: "retrieval_filters
    /// at step entry ⊆ retrieval_filters at step exit").
    pub fn is_subset_of(&self, other: &RetrievalFilters) -> bool {
        self.0.iter().all(|(k, v)| other.0.get(k) == Some(v))
    }
}

/// One retrieval hit, ordered diagnostic output of `search_nodes`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalHit {
    pub id: String,
    pub score: f64,
    pub rank: usize,
}

/// One normalized graph edge (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub from_id: String,
    pub to_id: String,
    pub edge_type: String,
}

/// `expand_dependency_tree` diagnostic record (§4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphDebug {
    pub reason: Option<String>,
    pub seed_count: usize,
    pub expanded_count: usize,
    pub edges_count: usize,
    pub truncated: bool,
}

/// One materialized node of context (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeText {
    pub id: String,
    pub text: String,
    pub is_seed: bool,
    pub depth: u32,
    pub parent_id: Option<String>,
    /// Security metadata carried alongside the text so
    /// `manage_context_budget`/`fetch_node_texts` can aggregate it into
    /// `classification_labels_union`/`acl_labels_union`/`doc_level_max`
    /// without a second backend round trip.
    #[serde(default)]
    pub classification_labels: Vec<String>,
    #[serde(default)]
    pub acl_labels: Vec<String>,
    #[serde(default)]
    pub doc_level: u32,
}

/// One conversation turn (§3, §4.12).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DialogMessage {
    pub role: String, // "user" | "assistant"
    pub content: String,
}

/// An out-of-band directive enqueued for a named target step (§3).
/// Addressed purely by `target_step_id`; `topic` is a label for the
/// consumer, not used for delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboxMessage {
    pub target_step_id: String,
    pub topic: String,
    pub payload: JsonValue,
    pub sender_step_id: String,
}

/// Fork/merge scratchpad (§4.10). `None` until `parallel_roads_action` or
/// `fork_action` first initializes it for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParallelRoadsState {
    /// Ordered list of snapshot ids to visit.
    pub plan: Vec<String>,
    /// Index of the next unvisited entry in `plan`.
    pub index: usize,
    /// `(snapshot_id, snapshot_id_b)` captured before the first fork, so
    /// `merge_action` can restore it once the plan is exhausted.
    pub original_ids: (Option<String>, Option<String>),
    /// Labeled context blocks produced per snapshot, keyed by snapshot id,
    /// in the order snapshots were visited.
    pub results: Vec<(String, Vec<String>)>,
}

/// Per-run mutable record. One instance per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    // --- run identity, added for trace correlation (SPEC_FULL §3) ---
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,

    // --- request ---
    pub user_query: String,
    pub user_question_en: String,
    pub translate_chat: bool,
    pub session_id: String,
    pub repository: String,
    pub branch: String,
    pub snapshot_id: Option<String>,
    pub snapshot_id_b: Option<String>,
    pub retrieval_filters: RetrievalFilters,
    /// Caller-supplied display names for snapshot ids, consulted first by
    /// `merge_action`'s branch-label lookup (§4.10).
    pub snapshot_friendly_names: HashMap<String, String>,

    // --- router / response ---
    pub last_model_response: String,
    pub last_prefix: String,

    // --- retrieval ---
    pub retrieval_seed_nodes: Vec<String>,
    pub retrieval_hits: Vec<RetrievalHit>,
    pub retrieval_queries_asked_norm: HashSet<String>,
    pub last_search_bm25_operator: Option<String>,

    // --- graph ---
    pub graph_seed_nodes: Vec<String>,
    pub graph_expanded_nodes: Vec<String>,
    pub graph_edges: Vec<GraphEdge>,
    pub graph_debug: GraphDebug,

    // --- context materialization ---
    pub node_texts: Vec<NodeText>,
    pub context_blocks: Vec<String>,
    pub classification_labels_union: HashSet<String>,
    pub acl_labels_union: HashSet<String>,
    pub doc_level_max: u32,

    // --- conversation ---
    pub history_dialog: Vec<DialogMessage>,
    pub history_qa_neutral: Vec<(String, String)>,
    pub history_blocks: Vec<String>,

    // --- control ---
    pub loop_counters: HashMap<String, u32>,
    pub inbox: Vec<InboxMessage>,
    pub inbox_last_consumed: Vec<InboxMessage>,
    pub parallel_roads: Option<ParallelRoadsState>,
    pub turn_id: String,

    // --- answer ---
    pub answer_neutral: String,
    pub answer_translated: String,
    pub answer_translated_is_fallback: bool,
    pub banner_neutral: Option<String>,
    pub banner_translated: Option<String>,
    pub final_answer: String,

    // --- gated command links (§4.14 add_command_action) ---
    pub allowed_commands: HashSet<String>,
}

impl PipelineState {
    /// Construct the initial state for one request. All derived fields
    /// start empty; `call_model`/`search_nodes`/etc. populate them as the
    /// run progresses.
    pub fn new_request(
        session_id: impl Into<String>,
        user_query: impl Into<String>,
        repository: impl Into<String>,
        branch: impl Into<String>,
        retrieval_filters: RetrievalFilters,
    ) -> Self {
        let user_query = user_query.into();
        PipelineState {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            user_question_en: user_query.clone(),
            user_query,
            translate_chat: false,
            session_id: session_id.into(),
            repository: repository.into(),
            branch: branch.into(),
            snapshot_id: None,
            snapshot_id_b: None,
            retrieval_filters,
            snapshot_friendly_names: HashMap::new(),
            last_model_response: String::new(),
            last_prefix: String::new(),
            retrieval_seed_nodes: Vec::new(),
            retrieval_hits: Vec::new(),
            retrieval_queries_asked_norm: HashSet::new(),
            last_search_bm25_operator: None,
            graph_seed_nodes: Vec::new(),
            graph_expanded_nodes: Vec::new(),
            graph_edges: Vec::new(),
            graph_debug: GraphDebug::default(),
            node_texts: Vec::new(),
            context_blocks: Vec::new(),
            classification_labels_union: HashSet::new(),
            acl_labels_union: HashSet::new(),
            doc_level_max: 0,
            history_dialog: Vec::new(),
            history_qa_neutral: Vec::new(),
            history_blocks: Vec::new(),
            loop_counters: HashMap::new(),
            inbox: Vec::new(),
            inbox_last_consumed: Vec::new(),
            parallel_roads: None,
            turn_id: Uuid::new_v4().to_string(),
            answer_neutral: String::new(),
            answer_translated: String::new(),
            answer_translated_is_fallback: false,
            banner_neutral: None,
            banner_translated: None,
            final_answer: String::new(),
            allowed_commands: HashSet::new(),
        }
    }

    /// Append-unique: push `id` onto `vec` if not already present,
    /// preserving first-seen order. Every id list in `PipelineState` is
    /// order-preserving and deduplicated at its producing step (§3).
    pub fn push_unique_id(vec: &mut Vec<String>, id: String) {
        if !vec.contains(&id) {
            vec.push(id);
        }
    }

    /// Clear the retrieval/graph/context scratch fields. Mandatory
    /// step-entry cleanup for `search_nodes` (§4.6) and for each snapshot
    /// iteration in fork/merge (§4.10 isolation invariant).
    pub fn clear_retrieval_scratch(&mut self) {
        self.retrieval_seed_nodes.clear();
        self.retrieval_hits.clear();
        self.graph_seed_nodes.clear();
        self.graph_expanded_nodes.clear();
        self.graph_edges.clear();
        self.graph_debug = GraphDebug::default();
        self.node_texts.clear();
        self.context_blocks.clear();
    }

    /// Enqueue an inbox message. The inbox is a single-owner,
    /// append-by-step-entry, consume-at-entry structure (§5).
    pub fn enqueue_inbox(&mut self, message: InboxMessage) {
        self.inbox.push(message);
    }

    /// Consume every message addressed to `step_id`, in enqueue order,
    /// removing them from the shared inbox and recording them as
    /// `inbox_last_consumed` for this step's entry (§4.2, §4.3).
    pub fn consume_inbox_for(&mut self, step_id: &str) {
        let (consumed, remaining): (Vec<_>, Vec<_>) = self
            .inbox
            .drain(..)
            .partition(|m| m.target_step_id == step_id);
        self.inbox = remaining;
        self.inbox_last_consumed = consumed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retrieval_filters_merge_base_over_keeps_base_on_conflict() {
        let mut base_map = BTreeMap::new();
        base_map.insert("tenant".to_string(), json!("acme"));
        let base = RetrievalFilters::from_map(base_map);

        let mut parsed = BTreeMap::new();
        parsed.insert("tenant".to_string(), json!("attacker-controlled"));
        parsed.insert("language".to_string(), json!("rust"));

        let effective = base.merge_base_over(&parsed);
        assert_eq!(effective.get("tenant"), Some(&json!("acme")));
        assert_eq!(effective.get("language"), Some(&json!("rust")));
    }

    #[test]
    fn is_subset_of_detects_tampering() {
        let mut map = BTreeMap::new();
        map.insert("acl".to_string(), json!(["team-a"]));
        let entry = RetrievalFilters::from_map(map.clone());

        let exit_ok = entry.clone();
        assert!(entry.is_subset_of(&exit_ok));

        let mut tampered_map = map;
        tampered_map.insert("acl".to_string(), json!(["team-b"]));
        let exit_tampered = RetrievalFilters::from_map(tampered_map);
        assert!(!entry.is_subset_of(&exit_tampered));
    }

    #[test]
    fn push_unique_id_deduplicates() {
        let mut ids = vec!["a".to_string()];
        PipelineState::push_unique_id(&mut ids, "a".to_string());
        PipelineState::push_unique_id(&mut ids, "b".to_string());
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn consume_inbox_for_only_removes_matching_target() {
        let mut state = PipelineState::new_request("s1", "q", "repo", "main", RetrievalFilters::new());
        state.enqueue_inbox(InboxMessage {
            target_step_id: "search".to_string(),
            topic: "config".to_string(),
            payload: json!({}),
            sender_step_id: "router".to_string(),
        });
        state.enqueue_inbox(InboxMessage {
            target_step_id: "other".to_string(),
            topic: "config".to_string(),
            payload: json!({}),
            sender_step_id: "router".to_string(),
        });

        state.consume_inbox_for("search");
        assert_eq!(state.inbox_last_consumed.len(), 1);
        assert_eq!(state.inbox.len(), 1);
        assert_eq!(state.inbox[0].target_step_id, "other");
    }
}
