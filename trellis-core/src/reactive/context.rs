//! Engine context.
//!
//! The context tracks everything one thread's engine needs between and
//! during recalculation sweeps: the sweep counter, the stack of currently
//! computing cells, the layered ready queues, and the STM history for the
//! open atomic section.
//!
//! # How It Works
//!
//! We use a thread-local singleton. Each thread gets an independent engine;
//! cells created on one thread are never visible to another. This keeps the
//! hot path free of synchronization and makes "the currently computing
//! cell" a plain stack push/pop.
//!
//! All public entry points of the crate (`atomically`, `modifier`,
//! `on_undo`, `repeat`, `poll`, ...) are thin wrappers over this state.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::error::TrellisError;
use crate::reactive::cell::{AnyCell, CellId};
use crate::reactive::scheduler;
use crate::stm::{Savepoint, ScopeManager, StmHistory};

/// Default bound on how many times a single cell may recalculate within one
/// sweep, and on how many sweeps one atomic section may take to quiesce.
pub(crate) const DEFAULT_MAX_RECALCS: u32 = 100;

thread_local! {
    static ENGINE: Rc<EngineState> = Rc::new(EngineState::new());
}

/// Get this thread's engine.
pub(crate) fn engine() -> Rc<EngineState> {
    ENGINE.with(Rc::clone)
}

/// A buffered write produced inside a rule, applied between sweeps.
pub(crate) type DeferredWrite = Box<dyn FnOnce() -> Result<(), TrellisError>>;

/// Per-thread engine state.
pub(crate) struct EngineState {
    pub(crate) history: StmHistory,

    /// Sweep counter. Bumped at the start of every sweep.
    pulse: Cell<u64>,
    /// Change stamp counter. Bumped on every value change; cells compare
    /// their `needs` stamp against their `version` stamp to decide dirtiness.
    stamp: Cell<u64>,
    /// How many sweeps the current atomic section has run so far.
    sweeps_this_section: Cell<u32>,
    /// Nesting depth of modifier bodies (future views are legal inside).
    modifier_depth: Cell<u32>,
    /// Convergence budget. See [`set_max_recalcs`].
    max_recalcs: Cell<u32>,
    /// True while the scheduler is draining sweeps. Reads recompute dirty
    /// cells only during sweeps (and on lazy first activation).
    sweeping: Cell<bool>,

    /// Stack of cells whose rules are currently executing.
    computing: RefCell<Vec<Rc<dyn AnyCell>>>,
    /// Ready queues, keyed by layer, drained lowest first.
    ready: RefCell<BTreeMap<u32, VecDeque<Rc<dyn AnyCell>>>>,
    /// Discrete cells that must snap back to their default at sweep end.
    resets: RefCell<Vec<Rc<dyn AnyCell>>>,
    /// Writes issued from inside rules, applied after the layers drain.
    deferred: RefCell<VecDeque<DeferredWrite>>,
    /// Cells that asked to re-run at the end of the current sweep.
    repeats: RefCell<Vec<Rc<dyn AnyCell>>>,
    /// Cells that asked to re-run in every future sweep.
    polled: RefCell<Vec<Weak<dyn AnyCell>>>,
    /// Sensor cells to check for listener loss at section end.
    sensors: RefCell<Vec<Weak<dyn AnyCell>>>,

    /// First error raised from an infallible call path (e.g. a read inside a
    /// rule); picked up by the scheduler to abort the sweep.
    failure: RefCell<Option<TrellisError>>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            history: StmHistory::new(),
            pulse: Cell::new(1),
            stamp: Cell::new(1),
            sweeps_this_section: Cell::new(0),
            modifier_depth: Cell::new(0),
            max_recalcs: Cell::new(DEFAULT_MAX_RECALCS),
            sweeping: Cell::new(false),
            computing: RefCell::new(Vec::new()),
            ready: RefCell::new(BTreeMap::new()),
            resets: RefCell::new(Vec::new()),
            deferred: RefCell::new(VecDeque::new()),
            repeats: RefCell::new(Vec::new()),
            polled: RefCell::new(Vec::new()),
            sensors: RefCell::new(Vec::new()),
            failure: RefCell::new(None),
        }
    }

    // ── sweep bookkeeping ──────────────────────────────────────────────

    pub(crate) fn pulse(&self) -> u64 {
        self.pulse.get()
    }

    /// Issue a fresh change stamp.
    pub(crate) fn next_stamp(&self) -> u64 {
        let s = self.stamp.get() + 1;
        self.stamp.set(s);
        s
    }

    pub(crate) fn max_recalcs(&self) -> u32 {
        self.max_recalcs.get()
    }

    pub(crate) fn sweeping(&self) -> bool {
        self.sweeping.get()
    }

    pub(crate) fn set_sweeping(&self, on: bool) {
        self.sweeping.set(on);
    }

    /// Open the next sweep: bump the pulse and wake every polled cell.
    pub(crate) fn begin_sweep(&self) {
        self.pulse.set(self.pulse.get() + 1);
        self.sweeps_this_section
            .set(self.sweeps_this_section.get() + 1);
        trace!(pulse = self.pulse.get(), "sweep begins");

        let polled: Vec<Rc<dyn AnyCell>> = {
            let mut polled = self.polled.borrow_mut();
            polled.retain(|w| w.upgrade().is_some());
            polled.iter().filter_map(Weak::upgrade).collect()
        };
        let stamp = self.next_stamp();
        for cell in polled {
            cell.meta().bump_needs(stamp);
            self.enqueue(cell);
        }
    }

    pub(crate) fn begin_section(&self) {
        self.sweeps_this_section.set(0);
    }

    pub(crate) fn sweeps_this_section(&self) -> u32 {
        self.sweeps_this_section.get()
    }

    /// Anything left for another sweep to do?
    pub(crate) fn has_pending(&self) -> bool {
        !self.ready.borrow().is_empty()
            || !self.deferred.borrow().is_empty()
            || !self.resets.borrow().is_empty()
            || !self.repeats.borrow().is_empty()
    }

    // ── compute stack ──────────────────────────────────────────────────

    /// The cell whose rule is currently executing, if any.
    pub(crate) fn current(&self) -> Option<Rc<dyn AnyCell>> {
        self.computing.borrow().last().cloned()
    }

    pub(crate) fn push_current(&self, cell: Rc<dyn AnyCell>) {
        self.computing.borrow_mut().push(cell);
    }

    pub(crate) fn pop_current(&self) {
        self.computing.borrow_mut().pop();
    }

    /// Run `f` with dependency tracking suppressed. Used by sensor
    /// connectors and other callbacks that must not become subjects.
    pub(crate) fn without_tracking<R>(&self, f: impl FnOnce() -> R) -> R {
        let saved = std::mem::take(&mut *self.computing.borrow_mut());
        let r = f();
        *self.computing.borrow_mut() = saved;
        r
    }

    // ── queues ─────────────────────────────────────────────────────────

    /// Put a cell on the ready queue for its layer. Idempotent while the
    /// cell is already queued.
    pub(crate) fn enqueue(&self, cell: Rc<dyn AnyCell>) {
        let meta = cell.meta();
        if meta.queued.get() {
            return;
        }
        meta.queued.set(true);
        let layer = meta.layer.get();
        self.ready
            .borrow_mut()
            .entry(layer)
            .or_default()
            .push_back(cell);
    }

    /// Pop the next ready cell from the lowest populated layer.
    pub(crate) fn pop_ready(&self) -> Option<(u32, Rc<dyn AnyCell>)> {
        let mut ready = self.ready.borrow_mut();
        let layer = *ready.keys().next()?;
        let cell = {
            let queue = ready.get_mut(&layer)?;
            queue.pop_front()
        };
        if ready.get(&layer).is_some_and(VecDeque::is_empty) {
            ready.remove(&layer);
        }
        let cell = cell?;
        cell.meta().queued.set(false);
        Some((layer, cell))
    }

    pub(crate) fn schedule_reset(&self, cell: Rc<dyn AnyCell>) {
        let mut resets = self.resets.borrow_mut();
        if !resets.iter().any(|c| c.meta().id == cell.meta().id) {
            resets.push(cell);
        }
    }

    pub(crate) fn take_resets(&self) -> Vec<Rc<dyn AnyCell>> {
        std::mem::take(&mut *self.resets.borrow_mut())
    }

    pub(crate) fn defer_write(&self, write: DeferredWrite) {
        self.deferred.borrow_mut().push_back(write);
    }

    pub(crate) fn pop_deferred(&self) -> Option<DeferredWrite> {
        self.deferred.borrow_mut().pop_front()
    }

    pub(crate) fn request_repeat(&self, cell: Rc<dyn AnyCell>) {
        let mut repeats = self.repeats.borrow_mut();
        if !repeats.iter().any(|c| c.meta().id == cell.meta().id) {
            repeats.push(cell);
        }
    }

    pub(crate) fn take_repeats(&self) -> Vec<Rc<dyn AnyCell>> {
        std::mem::take(&mut *self.repeats.borrow_mut())
    }

    pub(crate) fn register_poll(&self, cell: &Rc<dyn AnyCell>) {
        let id = cell.meta().id;
        let mut polled = self.polled.borrow_mut();
        let already = polled
            .iter()
            .filter_map(Weak::upgrade)
            .any(|c| c.meta().id == id);
        if !already {
            polled.push(Rc::downgrade(cell));
        }
    }

    pub(crate) fn register_sensor(&self, cell: &Rc<dyn AnyCell>) {
        self.sensors.borrow_mut().push(Rc::downgrade(cell));
    }

    pub(crate) fn live_sensors(&self) -> Vec<Rc<dyn AnyCell>> {
        let mut sensors = self.sensors.borrow_mut();
        sensors.retain(|w| w.upgrade().is_some());
        sensors.iter().filter_map(Weak::upgrade).collect()
    }

    // ── failure channel ────────────────────────────────────────────────

    /// Record an error raised on a call path that cannot return `Result`
    /// (reads inside rules). The scheduler aborts the sweep when it sees it.
    pub(crate) fn record_failure(&self, err: TrellisError) {
        let mut failure = self.failure.borrow_mut();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    pub(crate) fn take_failure(&self) -> Option<TrellisError> {
        self.failure.borrow_mut().take()
    }

    /// Drop all queued work. Called when a section aborts; the undo log has
    /// already restored per-cell state.
    pub(crate) fn clear_transient(&self) {
        for (_, queue) in std::mem::take(&mut *self.ready.borrow_mut()) {
            for cell in queue {
                cell.meta().queued.set(false);
            }
        }
        self.resets.borrow_mut().clear();
        self.deferred.borrow_mut().clear();
        self.repeats.borrow_mut().clear();
        self.failure.borrow_mut().take();
    }

    // ── modifier tracking ──────────────────────────────────────────────

    pub(crate) fn enter_modifier(&self) {
        self.modifier_depth.set(self.modifier_depth.get() + 1);
    }

    pub(crate) fn exit_modifier(&self) {
        self.modifier_depth.set(self.modifier_depth.get() - 1);
    }

    pub(crate) fn in_modifier(&self) -> bool {
        self.modifier_depth.get() > 0
    }
}

// ── public API ─────────────────────────────────────────────────────────

/// Run `f` within an atomic section.
///
/// If a section is already open on this thread, `f` simply joins it. The
/// outermost call opens the section, and when `f` returns `Ok` drives
/// recalculation sweeps to quiescence before committing. On `Err` (from `f`
/// itself or from the sweeps) the undo log is replayed, scope managers exit
/// with the error, and the error is returned with every cell restored to its
/// pre-section state.
pub fn atomically<R>(f: impl FnOnce() -> Result<R, TrellisError>) -> Result<R, TrellisError> {
    let e = engine();
    if e.history.is_active() {
        return f();
    }
    e.history.begin();
    e.begin_section();
    let result = f()
        .and_then(|r| scheduler::settle(&e).map(|()| r))
        .and_then(|r| {
            // Section housekeeping (sensor disconnects) may buffer writes
            // of its own; settle those too before committing.
            scheduler::end_of_section(&e);
            scheduler::settle(&e).map(|()| r)
        });
    match result {
        Ok(value) => {
            e.history.cleanup(None)?;
            Ok(value)
        }
        Err(err) => {
            e.clear_transient();
            match e.history.cleanup(Some(err)) {
                Ok(()) => unreachable!("cleanup with an error cannot commit"),
                Err(final_err) => Err(final_err),
            }
        }
    }
}

/// Wrap a one-argument function so that every call runs atomically and may
/// use future views on discrete cells.
pub fn modifier<A, R>(
    f: impl Fn(A) -> Result<R, TrellisError>,
) -> impl Fn(A) -> Result<R, TrellisError> {
    move |arg| modify(|| f(arg))
}

/// Run `f` as a modifier body: atomic, with future views legal.
pub fn modify<R>(f: impl FnOnce() -> Result<R, TrellisError>) -> Result<R, TrellisError> {
    let e = engine();
    e.enter_modifier();
    let result = atomically(f);
    e.exit_modifier();
    result
}

/// Append an entry to the current section's undo log.
///
/// The entry runs only if the section aborts (or is rolled back to an
/// earlier savepoint). Undo entries must not fail.
pub fn on_undo(f: impl FnOnce() + 'static) -> Result<(), TrellisError> {
    engine().history.on_undo(f)
}

/// Capture the current undo-log depth for [`rollback_to`].
pub fn savepoint() -> Result<Savepoint, TrellisError> {
    engine().history.savepoint()
}

/// Replay and truncate the undo log back to `sp`.
pub fn rollback_to(sp: Savepoint) -> Result<(), TrellisError> {
    engine().history.rollback_to(sp)
}

/// Register a scope manager with the current atomic section.
pub fn manage(mgr: Rc<dyn ScopeManager>) -> Result<(), TrellisError> {
    engine().history.manage(mgr)
}

/// Record the prior contents of `slot` as an undo action, then store
/// `value` into it.
pub fn log_set<T: 'static>(slot: &Rc<RefCell<T>>, value: T) -> Result<(), TrellisError> {
    let e = engine();
    let old = slot.replace(value);
    let undo_slot = Rc::clone(slot);
    e.history.on_undo(move || {
        *undo_slot.borrow_mut() = old;
    })
}

/// True while commit or abort processing is executing.
pub fn in_cleanup() -> bool {
    engine().history.in_cleanup()
}

/// True while a rule is executing on this thread.
pub fn in_rule() -> bool {
    engine().current().is_some()
}

/// Identity of the cell whose rule is currently executing, if any.
pub fn current_cell() -> Option<CellId> {
    engine().current().map(|c| c.meta().id)
}

/// Set the convergence budget: the maximum number of recalculations of one
/// cell per sweep, and of sweeps per atomic section, before the engine
/// treats the graph as divergent and raises a conflict.
pub fn set_max_recalcs(limit: u32) {
    engine().max_recalcs.set(limit.max(1));
}

/// Ask for the currently executing rule to be re-run at the end of the
/// current sweep.
///
/// # Panics
///
/// Panics if called while no atomic section is open. Called from outside a
/// rule but inside a section, the section aborts with
/// [`TrellisError::InvalidOperation`].
pub fn repeat() {
    let e = engine();
    assert!(e.history.is_active(), "repeat() called outside a rule");
    match e.current() {
        Some(cell) => e.request_repeat(cell),
        None => e.record_failure(TrellisError::InvalidOperation(
            "repeat() called outside a rule",
        )),
    }
}

/// Ask for the currently executing rule to be re-run in every future sweep,
/// whether or not its subjects changed.
///
/// # Panics
///
/// Panics if called while no atomic section is open.
pub fn poll() {
    let e = engine();
    assert!(e.history.is_active(), "poll() called outside a rule");
    match e.current() {
        Some(cell) => e.register_poll(&cell),
        None => e.record_failure(TrellisError::InvalidOperation(
            "poll() called outside a rule",
        )),
    }
}

/// Force the currently executing rule's result to count as changed even if
/// it compares equal to the previous value. Needed when a rule mutates and
/// returns the same container.
///
/// # Panics
///
/// Panics if called while no atomic section is open.
pub fn mark_dirty() {
    let e = engine();
    assert!(e.history.is_active(), "mark_dirty() called outside a rule");
    match e.current() {
        Some(cell) => cell.meta().force_changed.set(true),
        None => e.record_failure(TrellisError::InvalidOperation(
            "mark_dirty() called outside a rule",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomically_joins_an_open_section() {
        let depth_seen = atomically(|| {
            // The inner call must not try to reopen the section.
            atomically(|| Ok(engine().history.is_active()))
        })
        .unwrap();
        assert!(depth_seen);
        assert!(!engine().history.is_active());
    }

    #[test]
    fn atomically_propagates_user_errors() {
        let err = atomically::<()>(|| Err(TrellisError::user("nope"))).unwrap_err();
        assert_eq!(err, TrellisError::user("nope"));
        assert!(!engine().history.is_active());
    }

    #[test]
    fn modify_tracks_modifier_depth() {
        assert!(!engine().in_modifier());
        modify(|| {
            assert!(engine().in_modifier());
            Ok(())
        })
        .unwrap();
        assert!(!engine().in_modifier());
    }

    #[test]
    fn modifier_wraps_a_function() {
        let double = modifier(|x: i32| Ok(x * 2));
        assert_eq!(double(21).unwrap(), 42);
    }

    #[test]
    fn log_set_is_undone_on_abort() {
        let slot = Rc::new(RefCell::new(1));
        let s = slot.clone();
        let err = atomically::<()>(move || {
            log_set(&s, 2)?;
            assert_eq!(*s.borrow(), 2);
            Err(TrellisError::user("abort"))
        })
        .unwrap_err();
        assert_eq!(err, TrellisError::user("abort"));
        assert_eq!(*slot.borrow(), 1);
    }

    #[test]
    fn log_set_survives_commit() {
        let slot = Rc::new(RefCell::new(1));
        let s = slot.clone();
        atomically(move || log_set(&s, 2)).unwrap();
        assert_eq!(*slot.borrow(), 2);
    }

    #[test]
    fn in_rule_is_false_at_top_level() {
        assert!(!in_rule());
        assert!(current_cell().is_none());
    }

    #[test]
    #[should_panic(expected = "repeat() called outside a rule")]
    fn repeat_outside_any_section_panics() {
        repeat();
    }

    #[test]
    fn repeat_outside_a_rule_aborts_the_section() {
        let err = atomically(|| {
            repeat();
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, TrellisError::InvalidOperation(_)));
    }

    #[test]
    fn savepoint_requires_a_section() {
        assert!(savepoint().is_err());
    }
}
