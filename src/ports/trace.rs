//! Trace sink and cancellation ports (§5, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// One trace event, emitted per dispatched step and a final `done`.
/// `summary_translated` and `docs` are best-effort embellishments a
/// pipeline author can skip; `details` carries action-specific diagnostics
/// (e.g. `manage_context_budget`'s per-node decisions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "type")]
    pub event_type: TraceEventType,
    pub ts: DateTime<Utc>,
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_translated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DoneReason>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    Step,
    Done,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Done,
    Cancelled,
}

impl TraceEvent {
    pub fn step(
        run_id: Uuid,
        ts: DateTime<Utc>,
        step_id: impl Into<String>,
        action_id: impl Into<String>,
        summary: impl Into<String>,
        details: Option<JsonValue>,
    ) -> Self {
        TraceEvent {
            event_type: TraceEventType::Step,
            ts,
            run_id,
            step_id: Some(step_id.into()),
            action_id: Some(action_id.into()),
            summary: Some(summary.into()),
            summary_translated: None,
            details,
            docs: None,
            reason: None,
        }
    }

    pub fn done(run_id: Uuid, ts: DateTime<Utc>, reason: DoneReason) -> Self {
        TraceEvent {
            event_type: TraceEventType::Done,
            ts,
            run_id,
            step_id: None,
            action_id: None,
            summary: None,
            summary_translated: None,
            details: None,
            docs: None,
            reason: Some(reason),
        }
    }
}

pub trait TraceSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// A `TraceSink` that drops every event, for embedders that don't stream
/// progress and for tests that don't assert on it.
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn emit(&self, _event: TraceEvent) {}
}

/// Cancellation port. The engine checks this before dispatching each step
/// and after every action call (§5).
pub trait Cancellation: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// Default for embedders with no mid-run cancellation support.
pub struct NeverCancel;

impl Cancellation for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}
