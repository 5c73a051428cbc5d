//! Step-entry inbox consumption (§4.2 step 1, §4.3).
//!
//! A thin wrapper kept separate from `PipelineState` so the engine's
//! dispatch loop reads as a sequence of named phases rather than a single
//! block; the actual FIFO partition lives on the state itself (§5, single
//! owner).

use crate::state::PipelineState;

pub fn consume_for_step(state: &mut PipelineState, step_id: &str) {
    state.consume_inbox_for(step_id);
}
