//! End-to-end runs of the dispatch loop against fake ports, one per
//! documented example scenario: direct answer, repeat-query dedupe,
//! budget misconfig, hybrid RRF fusion, snapshot comparison fork/merge,
//! and mid-run cancellation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use codecorpus_pipeline::config::PipelineDefinition;
use codecorpus_pipeline::ports::history::{ConversationHistoryService, QaPair};
use codecorpus_pipeline::ports::llm::{GenOpts, LlmClient};
use codecorpus_pipeline::ports::retrieval::{
    FetchedText, RetrievalBackend, SearchHit, SearchRequest, SearchResponse, SearchType,
};
use codecorpus_pipeline::ports::token_counter::ApproxCounter;
use codecorpus_pipeline::ports::trace::Cancellation;
use codecorpus_pipeline::state::{DialogMessage, PipelineState, RetrievalFilters};
use codecorpus_pipeline::{Engine, PipelineError, Runtime};

struct ScriptedLlm {
    responses: Mutex<Vec<String>>,
    cancel_after_call: Option<Arc<AtomicBool>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<&str>) -> Self {
        ScriptedLlm {
            responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
            cancel_after_call: None,
        }
    }

    fn with_cancel_flag(responses: Vec<&str>, flag: Arc<AtomicBool>) -> Self {
        ScriptedLlm {
            responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
            cancel_after_call: Some(flag),
        }
    }

    fn pop(&self) -> String {
        let mut q = self.responses.lock().unwrap();
        let next = q.pop().expect("ScriptedLlm exhausted its script");
        if let Some(flag) = &self.cancel_after_call {
            flag.store(true, Ordering::SeqCst);
        }
        next
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn ask(&self, _prompt: &str, _gen_opts: Option<&GenOpts>) -> anyhow::Result<String> {
        Ok(self.pop())
    }

    async fn ask_chat(
        &self,
        _system: &str,
        _user: &str,
        _history: Option<&[DialogMessage]>,
        _gen_opts: Option<&GenOpts>,
    ) -> anyhow::Result<String> {
        Ok(self.pop())
    }
}

#[derive(Default)]
struct FakeRetrieval {
    search_calls: AtomicUsize,
    hits: Mutex<HashMap<String, Vec<SearchHit>>>,
    texts: Mutex<HashMap<String, FetchedText>>,
}

impl FakeRetrieval {
    fn new() -> Self {
        FakeRetrieval::default()
    }

    fn key(search_type: SearchType, snapshot: &str, query: &str) -> String {
        format!("{search_type:?}|{snapshot}|{query}")
    }

    fn with_hits(self, search_type: SearchType, snapshot: &str, query: &str, hits: Vec<SearchHit>) -> Self {
        self.hits
            .lock()
            .unwrap()
            .insert(Self::key(search_type, snapshot, query), hits);
        self
    }

    fn with_text(self, id: &str, text: FetchedText) -> Self {
        self.texts.lock().unwrap().insert(id.to_string(), text);
        self
    }
}

#[async_trait]
impl RetrievalBackend for FakeRetrieval {
    async fn search(&self, req: &SearchRequest) -> anyhow::Result<SearchResponse> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let snapshot = req
            .retrieval_filters
            .get("snapshot")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let key = Self::key(req.search_type, &snapshot, &req.query);
        let hits = self.hits.lock().unwrap().get(&key).cloned().unwrap_or_default();
        Ok(SearchResponse { hits, debug: None })
    }

    async fn fetch_texts(
        &self,
        ids: &[String],
        _repository: &str,
        _branch: &str,
        _retrieval_filters: &RetrievalFilters,
        _active_index: Option<&str>,
    ) -> anyhow::Result<HashMap<String, FetchedText>> {
        let texts = self.texts.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| texts.get(id).map(|t| (id.clone(), t.clone())))
            .collect())
    }
}

#[derive(Default)]
struct FakeHistory {
    finalized_calls: AtomicUsize,
}

#[async_trait]
impl ConversationHistoryService for FakeHistory {
    async fn on_request_started(&self, _session_id: &str) -> anyhow::Result<String> {
        Ok("turn-fixed".to_string())
    }

    async fn on_request_finalized(
        &self,
        _session_id: &str,
        _turn_id: &str,
        _final_answer: &str,
    ) -> anyhow::Result<()> {
        self.finalized_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn recent_qa_neutral(&self, _session_id: &str, _limit: u32) -> anyhow::Result<Vec<QaPair>> {
        Ok(Vec::new())
    }
}

struct FlagCancellation(Arc<AtomicBool>);

impl Cancellation for FlagCancellation {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn write_prompt(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

fn load(yaml: &str) -> PipelineDefinition {
    PipelineDefinition::load_from_str(yaml, Path::new("/tmp")).unwrap()
}

// --- E1: direct answer, no retrieval -----------------------------------

#[tokio::test]
async fn e1_direct_answer_bypasses_retrieval() {
    let prompts = tempfile::tempdir().unwrap();
    write_prompt(prompts.path(), "answer.txt", "You answer questions about code.");

    let yaml = format!(
        r#"
pipeline:
  name: direct_answer
  entry_step_id: call_answer
  settings:
    max_context_tokens: 4000
    prompts_dir: "{prompts_dir}"
  steps:
    - id: call_answer
      action: call_model
      native_chat: true
      prompt_key: answer.txt
      user_parts:
        question:
          source: user_query
          template: "{{}}"
      next: route_answer
    - id: route_answer
      action: prefix_router
      on_other: copy_answer
      routes:
        direct:
          prefix: "[DIRECT:]"
          next: copy_answer
    - id: copy_answer
      action: set_variables
      rules:
        - set: answer_neutral
          from: last_model_response
      next: finish
    - id: finish
      action: finalize
      end: true
"#,
        prompts_dir = prompts.path().display()
    );
    let def = load(&yaml);

    let llm = Arc::new(ScriptedLlm::new(vec!["[DIRECT:] This is the answer."]));
    let retrieval = Arc::new(FakeRetrieval::new());
    let runtime = Runtime::new(llm, retrieval.clone(), Arc::new(ApproxCounter::new()));

    let engine = Engine::new(&def, &runtime).unwrap();
    let state = PipelineState::new_request("s1", "what does this do?", "repo", "main", RetrievalFilters::new());
    let result = engine.run(state).await.unwrap();

    assert_eq!(result.final_answer, "This is the answer.");
    assert!(result.context_blocks.is_empty());
    assert_eq!(retrieval.search_calls.load(Ordering::SeqCst), 0);
}

// --- E2: repeat query guard dedupes across turns ------------------------

#[tokio::test]
async fn e2_repeat_query_guard_skips_second_identical_search() {
    let prompts = tempfile::tempdir().unwrap();
    write_prompt(prompts.path(), "decide.txt", "Decide whether to retrieve.");

    let yaml = format!(
        r#"
pipeline:
  name: retrieve_or_repeat
  entry_step_id: call_decide
  settings:
    max_context_tokens: 4000
    prompts_dir: "{prompts_dir}"
  steps:
    - id: call_decide
      action: call_model
      native_chat: true
      prompt_key: decide.txt
      user_parts:
        question:
          source: user_query
          template: "{{}}"
      next: decide
    - id: decide
      action: json_decision_router
      on_other: fallback
      routes:
        retrieve: check_repeat
    - id: check_repeat
      action: repeat_query_guard
      query_parser: jsonish
      on_ok: search
      on_repeat: fallback
    - id: search
      action: search_nodes
      search_type: bm25
      top_k: 5
      query_parser: jsonish
      next: fallback
    - id: fallback
      action: finalize
      end: true
"#,
        prompts_dir = prompts.path().display()
    );
    let def = load(&yaml);

    let llm = Arc::new(ScriptedLlm::new(vec![r#"{"decision":"retrieve","query":"class Foo"}"#]));
    let retrieval = Arc::new(
        FakeRetrieval::new().with_hits(SearchType::Bm25, "", "class Foo", vec![SearchHit { id: "a".into(), score: 1.0, rank: 0 }]),
    );
    let runtime = Runtime::new(llm, retrieval.clone(), Arc::new(ApproxCounter::new()));
    let engine = Engine::new(&def, &runtime).unwrap();

    let first = engine
        .run(PipelineState::new_request("s2", "q1", "repo", "main", RetrievalFilters::new()))
        .await
        .unwrap();
    assert_eq!(retrieval.search_calls.load(Ordering::SeqCst), 1);
    assert!(first.retrieval_queries_asked_norm.contains("class foo"));

    let llm2 = Arc::new(ScriptedLlm::new(vec![r#"{"decision":"retrieve","query":"  CLASS   Foo  "}"#]));
    let runtime2 = Runtime::new(llm2, retrieval.clone(), Arc::new(ApproxCounter::new()));
    let engine2 = Engine::new(&def, &runtime2).unwrap();

    let mut second_request = PipelineState::new_request("s2", "q2", "repo", "main", RetrievalFilters::new());
    second_request.retrieval_queries_asked_norm = first.retrieval_queries_asked_norm.clone();
    engine2.run(second_request).await.unwrap();

    assert_eq!(retrieval.search_calls.load(Ordering::SeqCst), 1);
}

// --- E3: a single oversized node trips budget misconfig -----------------

#[tokio::test]
async fn e3_oversized_node_raises_budget_misconfig() {
    let yaml = r#"
pipeline:
  name: budget_misconfig
  entry_step_id: search
  settings:
    max_context_tokens: 200
    prompts_dir: "/tmp"
  steps:
    - id: search
      action: search_nodes
      search_type: bm25
      top_k: 5
      next: fetch
    - id: fetch
      action: fetch_node_texts
      budget_tokens: 500
      next: budget
    - id: budget
      action: manage_context_budget
      on_ok: finish
      on_over: finish
    - id: finish
      action: finalize
      end: true
"#;
    let def = load(yaml);

    let big_text = "x".repeat(1600); // 400 tokens under ApproxCounter
    let retrieval = Arc::new(
        FakeRetrieval::new()
            .with_hits(SearchType::Bm25, "", "find the thing", vec![SearchHit { id: "big_file.rs".into(), score: 1.0, rank: 0 }])
            .with_text("big_file.rs", FetchedText { text: big_text, ..Default::default() }),
    );
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let runtime = Runtime::new(llm, retrieval, Arc::new(ApproxCounter::new()));
    let engine = Engine::new(&def, &runtime).unwrap();

    let mut state = PipelineState::new_request("s3", "q", "repo", "main", RetrievalFilters::new());
    state.last_model_response = "find the thing".to_string();

    let err = engine.run(state).await.unwrap_err();
    assert_eq!(err.code(), "PIPELINE_BUDGET_MISCONFIG");
}

// --- E4: hybrid search fuses semantic + bm25 via RRF --------------------

#[tokio::test]
async fn e4_hybrid_search_fuses_with_rrf_tie_break() {
    let yaml = r#"
pipeline:
  name: hybrid_fusion
  entry_step_id: search
  settings:
    max_context_tokens: 4000
    prompts_dir: "/tmp"
  steps:
    - id: search
      action: search_nodes
      search_type: hybrid
      top_k: 3
      rrf_k: 60
      end: true
"#;
    let def = load(yaml);

    let retrieval = Arc::new(
        FakeRetrieval::new()
            .with_hits(SearchType::Semantic, "", "find foo", vec![
                SearchHit { id: "A".into(), score: 1.0, rank: 0 },
                SearchHit { id: "B".into(), score: 0.9, rank: 1 },
                SearchHit { id: "C".into(), score: 0.8, rank: 2 },
            ])
            .with_hits(SearchType::Bm25, "", "find foo", vec![
                SearchHit { id: "B".into(), score: 1.0, rank: 0 },
                SearchHit { id: "A".into(), score: 0.9, rank: 1 },
                SearchHit { id: "D".into(), score: 0.8, rank: 2 },
            ]),
    );
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let runtime = Runtime::new(llm, retrieval, Arc::new(ApproxCounter::new()));
    let engine = Engine::new(&def, &runtime).unwrap();

    let mut state = PipelineState::new_request("s4", "q", "repo", "main", RetrievalFilters::new());
    state.last_model_response = "find foo".to_string();

    let result = engine.run(state).await.unwrap();
    assert_eq!(result.retrieval_seed_nodes, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
}

// --- E5: snapshot compare fork/merge labels each branch -----------------

#[tokio::test]
async fn e5_snapshot_compare_forks_and_merges_labeled_blocks() {
    let prompts = tempfile::tempdir().unwrap();
    write_prompt(prompts.path(), "compare.txt", "Compare the two branches.");

    let yaml = format!(
        r#"
pipeline:
  name: snapshot_compare
  entry_step_id: init
  settings:
    max_context_tokens: 5000
    prompts_dir: "{prompts_dir}"
  steps:
    - id: init
      action: parallel_roads_action
      next: fork
    - id: fork
      action: fork_action
      search_action: branch_search
      on_done: answer
      snapshots:
        snapshot_a: "${{snapshot_id}}"
        snapshot_b: "${{snapshot_id_b}}"
    - id: branch_search
      action: search_nodes
      search_type: bm25
      top_k: 5
      next: branch_fetch
    - id: branch_fetch
      action: fetch_node_texts
      budget_tokens: 2000
      next: branch_budget
    - id: branch_budget
      action: manage_context_budget
      on_ok: merge
      on_over: merge
    - id: merge
      action: merge_action
      fork_step: fork
    - id: answer
      action: call_model
      native_chat: true
      prompt_key: compare.txt
      user_parts:
        context:
          source: context_blocks
          template: "{{}}"
      next: copy_answer
    - id: copy_answer
      action: set_variables
      rules:
        - set: answer_neutral
          from: last_model_response
      next: finish
    - id: finish
      action: finalize
      end: true
"#,
        prompts_dir = prompts.path().display()
    );
    let def = load(&yaml);

    let retrieval = Arc::new(
        FakeRetrieval::new()
            .with_hits(SearchType::Bm25, "release-4.60.0", "find related code", vec![SearchHit { id: "node_a".into(), score: 1.0, rank: 0 }])
            .with_hits(SearchType::Bm25, "release-4.90.0", "find related code", vec![SearchHit { id: "node_b".into(), score: 1.0, rank: 0 }])
            .with_text("node_a", FetchedText { text: "Code from branch A".to_string(), ..Default::default() })
            .with_text("node_b", FetchedText { text: "Code from branch B".to_string(), ..Default::default() }),
    );
    let llm = Arc::new(ScriptedLlm::new(vec![
        "Branch release-4.60.0 differs from branch release-4.90.0 in the retry path.",
    ]));
    let runtime = Runtime::new(llm, retrieval.clone(), Arc::new(ApproxCounter::new()));
    let engine = Engine::new(&def, &runtime).unwrap();

    let mut state = PipelineState::new_request("s5", "compare these branches", "repo", "main", RetrievalFilters::new());
    state.snapshot_id = Some("release-4.60.0".to_string());
    state.snapshot_id_b = Some("release-4.90.0".to_string());
    state.last_model_response = "find related code".to_string();
    state
        .snapshot_friendly_names
        .insert("snapshot_a".to_string(), "Branch release-4.60.0".to_string());
    state
        .snapshot_friendly_names
        .insert("snapshot_b".to_string(), "Branch release-4.90.0".to_string());

    let result = engine.run(state).await.unwrap();

    assert_eq!(retrieval.search_calls.load(Ordering::SeqCst), 2);
    let a_pos = result.context_blocks.iter().position(|b| b == "## Branch release-4.60.0").unwrap();
    let b_pos = result.context_blocks.iter().position(|b| b == "## Branch release-4.90.0").unwrap();
    assert!(a_pos < b_pos, "branches must appear in visiting order");
    assert!(result.context_blocks.iter().any(|b| b.contains("Code from branch A")));
    assert!(result.context_blocks.iter().any(|b| b.contains("Code from branch B")));
    assert_eq!(result.snapshot_id, Some("release-4.60.0".to_string()));
    assert_eq!(result.snapshot_id_b, Some("release-4.90.0".to_string()));
}

// --- E6: cancellation observed at the next step boundary ----------------

#[tokio::test]
async fn e6_cancellation_stops_before_finalize() {
    let prompts = tempfile::tempdir().unwrap();
    write_prompt(prompts.path(), "answer.txt", "You answer questions about code.");

    let yaml = format!(
        r#"
pipeline:
  name: cancel_mid_run
  entry_step_id: call_answer
  settings:
    max_context_tokens: 4000
    prompts_dir: "{prompts_dir}"
  steps:
    - id: call_answer
      action: call_model
      native_chat: true
      prompt_key: answer.txt
      user_parts:
        question:
          source: user_query
          template: "{{}}"
      next: finish
    - id: finish
      action: finalize
      end: true
"#,
        prompts_dir = prompts.path().display()
    );
    let def = load(&yaml);

    let cancel_flag = Arc::new(AtomicBool::new(false));
    let llm = Arc::new(ScriptedLlm::with_cancel_flag(vec!["partial answer"], cancel_flag.clone()));
    let retrieval = Arc::new(FakeRetrieval::new());
    let history = Arc::new(FakeHistory::default());
    let runtime = Runtime::new(llm, retrieval, Arc::new(ApproxCounter::new()))
        .with_history(history.clone())
        .with_cancellation(Arc::new(FlagCancellation(cancel_flag)));

    let engine = Engine::new(&def, &runtime).unwrap();
    let state = PipelineState::new_request("s6", "q", "repo", "main", RetrievalFilters::new());
    let err = engine.run(state).await.unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(history.finalized_calls.load(Ordering::SeqCst), 0);
}
