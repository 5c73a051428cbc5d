//! Runtime collaborator ports (§6): one trait per pluggable backend, one
//! file per port, matching the teacher's module-per-concern split
//! (`llm`/`context`/`router`).

pub mod graph;
pub mod history;
pub mod llm;
pub mod retrieval;
pub mod token_counter;
pub mod trace;
pub mod translator;

pub use graph::GraphProvider;
pub use history::ConversationHistoryService;
pub use llm::{GenOpts, LlmClient};
pub use retrieval::RetrievalBackend;
pub use token_counter::TokenCounter;
pub use trace::{Cancellation, NeverCancel, NullTraceSink, TraceSink};
pub use translator::Translator;
