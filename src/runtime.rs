//! `Runtime` — the bundle of pluggable collaborators the engine threads
//! through every action (§1, §6). Required ports are `Arc<dyn _>`;
//! best-effort ports (history, translator, graph, trace, cancellation)
//! are optional or carry a no-op default so an embedder that doesn't need
//! them doesn't have to stub one out.

use std::sync::Arc;

use crate::ports::{
    Cancellation, ConversationHistoryService, GraphProvider, LlmClient, NeverCancel,
    NullTraceSink, RetrievalBackend, TokenCounter, TraceSink, Translator,
};

pub struct Runtime {
    pub llm: Arc<dyn LlmClient>,
    pub retrieval: Arc<dyn RetrievalBackend>,
    pub token_counter: Arc<dyn TokenCounter>,
    pub graph: Option<Arc<dyn GraphProvider>>,
    pub history: Option<Arc<dyn ConversationHistoryService>>,
    pub translator: Option<Arc<dyn Translator>>,
    pub trace: Arc<dyn TraceSink>,
    pub cancellation: Arc<dyn Cancellation>,
}

impl Runtime {
    /// Build a runtime with the two required ports and every optional
    /// port at its no-op default. Use the builder-style `with_*` methods
    /// to wire in real graph/history/translator/trace/cancellation
    /// implementations.
    pub fn new(
        llm: Arc<dyn LlmClient>,
        retrieval: Arc<dyn RetrievalBackend>,
        token_counter: Arc<dyn TokenCounter>,
    ) -> Self {
        Runtime {
            llm,
            retrieval,
            token_counter,
            graph: None,
            history: None,
            translator: None,
            trace: Arc::new(NullTraceSink),
            cancellation: Arc::new(NeverCancel),
        }
    }

    pub fn with_graph(mut self, graph: Arc<dyn GraphProvider>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn ConversationHistoryService>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_cancellation(mut self, cancellation: Arc<dyn Cancellation>) -> Self {
        self.cancellation = cancellation;
        self
    }
}
