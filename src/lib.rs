//! Declarative pipeline engine for retrieval-augmented code question
//! answering.
//!
//! A [`config::PipelineDefinition`] describes a graph of [`actions::Action`]s
//! connected by step ids. [`engine::Engine`] dispatches one
//! [`state::PipelineState`] through that graph per request, consulting the
//! pluggable collaborators in [`runtime::Runtime`] for everything that
//! touches the outside world (LLM calls, retrieval, graph expansion,
//! conversation history, translation, tracing).
//!
//! This crate ships no server, no retrieval backend and no LLM client: it is
//! the engine and the contracts the engine demands of its ports. Embedders
//! implement the traits in [`ports`] and drive [`engine::Engine::run`].

pub mod actions;
pub mod config;
pub mod engine;
pub mod error;
pub mod jsonish;
pub mod ports;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod visualization;

pub use engine::Engine;
pub use error::{PipelineError, Result};
pub use runtime::Runtime;
pub use state::PipelineState;
