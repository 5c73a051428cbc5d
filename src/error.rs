//! Crate-wide error type.
//!
//! One variant per `PIPELINE_*` error code in the specification's external
//! interface section. `code()` returns the bare code for callers that need
//! to match on it without parsing the `Display` string.

use thiserror::Error;

/// Errors surfaced by pipeline loading and execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The retrieval buffer alone (after compaction) exceeds
    /// `settings.max_context_tokens`. A pipeline-author error, not a
    /// recoverable runtime condition.
    #[error("PIPELINE_BUDGET_MISCONFIG: {0}")]
    BudgetMisconfig(String),

    /// Messages remained in the inbox at run end under strict inbox mode.
    #[error("PIPELINE_INBOX_NOT_EMPTY: {0}")]
    InboxNotEmpty(String),

    /// Static configuration error: missing field, bad enum, unreachable
    /// step, unresolved id, impossible budget combination.
    #[error("PIPELINE_INVALID_CONFIG: {0}")]
    InvalidConfig(String),

    /// A step raised during execution: missing required state, invalid
    /// payload, ACL tampering, or a propagated collaborator failure.
    #[error("PIPELINE_STEP_FATAL: step {step_id}: {message}")]
    StepFatal { step_id: String, message: String },

    /// The run was cancelled before or during a step dispatch.
    #[error("PIPELINE_CANCELLED")]
    Cancelled,

    /// The engine's hard step-dispatch cap was exceeded.
    #[error("PIPELINE_LOOP_LIMIT: exceeded {0} dispatched steps")]
    LoopLimit(usize),
}

impl PipelineError {
    /// Bare `PIPELINE_*` code, stable across message wording changes.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::BudgetMisconfig(_) => "PIPELINE_BUDGET_MISCONFIG",
            PipelineError::InboxNotEmpty(_) => "PIPELINE_INBOX_NOT_EMPTY",
            PipelineError::InvalidConfig(_) => "PIPELINE_INVALID_CONFIG",
            PipelineError::StepFatal { .. } => "PIPELINE_STEP_FATAL",
            PipelineError::Cancelled => "PIPELINE_CANCELLED",
            PipelineError::LoopLimit(_) => "PIPELINE_LOOP_LIMIT",
        }
    }

    pub fn step_fatal(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::StepFatal {
            step_id: step_id.into(),
            message: message.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
