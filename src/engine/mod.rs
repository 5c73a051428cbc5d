//! The dispatch loop (§4.2): deterministic, single-threaded-per-run
//! traversal of a `PipelineDefinition`'s transition graph.

mod inbox;

use chrono::Utc;

use crate::actions::{self, Action, ActionContext};
use crate::config::PipelineDefinition;
use crate::error::{PipelineError, Result};
use crate::ports::trace::{DoneReason, TraceEvent};
use crate::runtime::Runtime;
use crate::state::PipelineState;

/// Built once per `PipelineDefinition`: every step's action, constructed
/// and config-validated ahead of time so a run never discovers a bad step
/// config mid-traversal (§4.1's "validate at load time" extended to the
/// action layer).
pub struct Engine<'a> {
    def: &'a PipelineDefinition,
    runtime: &'a Runtime,
    actions: std::collections::HashMap<String, Box<dyn Action>>,
}

impl<'a> Engine<'a> {
    pub fn new(def: &'a PipelineDefinition, runtime: &'a Runtime) -> Result<Self> {
        let mut built = std::collections::HashMap::with_capacity(def.steps.len());
        for (id, step) in &def.steps {
            built.insert(id.clone(), actions::build(step, &def.settings)?);
        }
        Ok(Engine {
            def,
            runtime,
            actions: built,
        })
    }

    /// Run one request to completion (or to a fatal error/cancellation).
    pub async fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        let mut current_id = self.def.entry_step_id.clone();
        let mut dispatched: u32 = 0;

        loop {
            if self.runtime.cancellation.is_cancelled() {
                restore_snapshot_ids(&mut state);
                self.emit_done(&state, DoneReason::Cancelled);
                return Err(PipelineError::Cancelled);
            }

            dispatched += 1;
            if dispatched > self.def.settings.max_dispatched_steps {
                return Err(PipelineError::LoopLimit(
                    self.def.settings.max_dispatched_steps as usize,
                ));
            }

            let step = self.def.steps.get(&current_id).ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "engine: dispatch target '{current_id}' does not resolve to a step"
                ))
            })?;
            let action = self.actions.get(&current_id).ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "engine: no built action for step '{current_id}'"
                ))
            })?;

            inbox::consume_for_step(&mut state, &step.id);

            let outcome = {
                let mut ctx = ActionContext {
                    state: &mut state,
                    runtime: self.runtime,
                    step,
                    settings: &self.def.settings,
                };
                action.run(&mut ctx).await?
            };

            if self.runtime.cancellation.is_cancelled() {
                restore_snapshot_ids(&mut state);
                self.emit_done(&state, DoneReason::Cancelled);
                return Err(PipelineError::Cancelled);
            }

            self.emit_step(&state, step, action.name());

            let crate::actions::ActionOutcome::Next(explicit_next) = outcome;
            let next = explicit_next.or_else(|| step.next.clone());

            if step.end || next.is_none() {
                self.emit_done(&state, DoneReason::Done);
                return self.finish(state);
            }

            current_id = next.unwrap();
        }
    }

    fn finish(&self, state: PipelineState) -> Result<PipelineState> {
        if !state.inbox.is_empty() {
            if self.def.settings.strict_inbox {
                return Err(PipelineError::InboxNotEmpty(format!(
                    "{} message(s) pending at run end",
                    state.inbox.len()
                )));
            }
            tracing::warn!(
                run_id = %state.run_id,
                pending = state.inbox.len(),
                "run ended with unconsumed inbox messages"
            );
        }
        Ok(state)
    }

    fn should_emit(&self, step: &crate::config::StepDef) -> bool {
        use crate::config::StagesVisibility::*;
        match self.def.settings.stages_visibility.unwrap_or(Allowed) {
            Allowed => true,
            Forbidden => false,
            PipelineDriven => true,
            Explicit => step
                .raw
                .get("stages_visible")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }
    }

    fn emit_step(&self, state: &PipelineState, step: &crate::config::StepDef, action_name: &str) {
        if !self.should_emit(step) {
            return;
        }
        let event = TraceEvent::step(
            state.run_id,
            Utc::now(),
            step.id.clone(),
            action_name.to_string(),
            format!("{} ({})", step.id, action_name),
            None,
        );
        self.runtime.trace.emit(event);
    }

    fn emit_done(&self, state: &PipelineState, reason: DoneReason) {
        self.runtime.trace.emit(TraceEvent::done(state.run_id, Utc::now(), reason));
    }
}

/// Cancellation mid-fork must not leave `snapshot_id`/`snapshot_id_b`
/// pointed at a branch snapshot: restore the pre-fork ids the same way
/// `merge_action` does on normal exhaustion.
fn restore_snapshot_ids(state: &mut PipelineState) {
    if let Some(pr) = &state.parallel_roads {
        // `original_ids` is only meaningful once `fork_action` has built its
        // plan on first entry; an empty plan means no fork is in flight, so
        // there's nothing to restore.
        if pr.plan.is_empty() {
            return;
        }
        let (orig_snapshot_id, orig_snapshot_id_b) = pr.original_ids.clone();
        state.snapshot_id = orig_snapshot_id;
        state.snapshot_id_b = orig_snapshot_id_b;
    }
}
