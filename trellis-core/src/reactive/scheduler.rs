//! Recalculation scheduler.
//!
//! The scheduler turns buffered writes into a consistent new state by
//! running discrete sweeps until nothing is pending. Each sweep:
//!
//! 1. Bumps the pulse and wakes polled cells.
//!
//! 2. Drains the ready queues in ascending layer order. Because every cell's
//!    layer is strictly above its subjects' layers, a rule never observes a
//!    partially updated graph, and observer cells (pinned at the top layer)
//!    only fire once everything below is quiescent.
//!
//! 3. Applies writes deferred by rules. From a rule's perspective its own
//!    writes land in the future: the values it read reflected the state at
//!    the start of its sweep.
//!
//! 4. Snaps discrete cells back to their defaults, notifying listeners of
//!    the reset as a distinct change.
//!
//! 5. Requeues cells that called `repeat()`.
//!
//! Steps 3 through 5 typically leave new work pending, in which case the
//! loop runs a follow-up sweep. A section that fails to quiesce within the
//! convergence budget is treated as divergent and aborted.

use tracing::{debug, trace};

use crate::error::TrellisError;
use crate::reactive::cell::AnyCell;
use crate::reactive::context::EngineState;
use crate::reactive::link;

/// Drive sweeps until the engine is quiescent, or fail and leave the
/// rollback to the caller.
pub(crate) fn settle(e: &EngineState) -> Result<(), TrellisError> {
    // Misuse of in-rule APIs may have been recorded before any sweep ran.
    if let Some(err) = e.take_failure() {
        return Err(err);
    }
    e.set_sweeping(true);
    let result = run_sweeps(e);
    e.set_sweeping(false);
    result
}

fn run_sweeps(e: &EngineState) -> Result<(), TrellisError> {
    while e.has_pending() {
        let limit = e.max_recalcs();
        if e.sweeps_this_section() >= limit {
            debug!(limit, "sweep budget exhausted");
            return Err(TrellisError::Conflict {
                first: "divergent recalculation".to_owned(),
                second: format!("no quiescence after {limit} sweeps"),
            });
        }
        e.begin_sweep();
        drain_layers(e)?;
        apply_deferred(e)?;
        apply_resets(e)?;
        apply_repeats(e);
    }
    trace!("engine quiescent");
    Ok(())
}

/// Drain the ready queues, lowest layer first.
fn drain_layers(e: &EngineState) -> Result<(), TrellisError> {
    while let Some((queued_at, cell)) = e.pop_ready() {
        if cell.meta().layer.get() != queued_at {
            // The cell was promoted after it was queued; put it back at its
            // new layer so ordering stays correct.
            e.enqueue(cell);
            continue;
        }
        cell.bring_current()?;
        if let Some(err) = e.take_failure() {
            return Err(err);
        }
    }
    Ok(())
}

/// Apply writes that rules deferred during this sweep. Each lands in the
/// target cell's write buffer, where the dual-write conflict check runs.
fn apply_deferred(e: &EngineState) -> Result<(), TrellisError> {
    while let Some(write) = e.pop_deferred() {
        write()?;
    }
    Ok(())
}

/// Snap discrete cells that held a non-default value back to their default.
fn apply_resets(e: &EngineState) -> Result<(), TrellisError> {
    for cell in e.take_resets() {
        cell.snap_reset()?;
    }
    Ok(())
}

/// Requeue rules that asked to run again via `repeat()`.
fn apply_repeats(e: &EngineState) {
    for cell in e.take_repeats() {
        cell.meta().bump_needs(e.next_stamp());
        e.enqueue(cell);
    }
}

/// End-of-section housekeeping: disconnect sensors that lost their last
/// listener during this section.
pub(crate) fn end_of_section(e: &EngineState) {
    for sensor in e.live_sensors() {
        if link::live_listeners(sensor.meta()).is_empty() {
            sensor.on_no_listeners();
        }
    }
}
