//! Cell kernel.
//!
//! A cell is the primitive reactive variable: a value, optionally a rule
//! that computes the value, and the bookkeeping the scheduler needs to keep
//! the dependent graph consistent.
//!
//! # How Cells Work
//!
//! 1. Reading a cell inside a rule subscribes the running rule to it. The
//!    subscription is recorded only after the cell's own value has settled,
//!    so a reader always observes a converged value.
//!
//! 2. Writing a cell buffers the value. Buffered writes are applied at the
//!    start of the next sweep; two unequal writes buffered for the same cell
//!    within one atomic section are a conflict.
//!
//! 3. When a cell's value changes, its listeners are stamped dirty and
//!    queued at their layers. A cell's layer is always greater than every
//!    subject's layer, which is what makes ascending-layer draining
//!    glitch-free.
//!
//! 4. A computed cell whose rule finishes without reading anything is frozen
//!    into a constant; constants never link, never notify, and reject
//!    writes.
//!
//! A rule that reads its own cell observes the value from before the
//! current recomputation (the previous sweep's value) and records no
//! self-link.

use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::error::TrellisError;
use crate::reactive::context::{self, engine};
use crate::reactive::link;

/// Bound on value types stored in cells.
///
/// `PartialEq` drives change detection; `Debug` renders values into
/// conflict reports.
pub trait Value: Clone + PartialEq + Debug + 'static {}

impl<T: Clone + PartialEq + Debug + 'static> Value for T {}

/// Stable identity of a cell within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    /// Generate a new unique cell ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The kind of a cell. The set is closed; the scheduler matches on it
/// exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// A plain input value with no rule.
    Value,
    /// A rule-backed cell, recomputed when its subjects change.
    Computed,
    /// A terminal side-effect cell. Never a subject, never writable.
    Observer,
    /// A cell that snaps back to a default at sweep end.
    Discrete,
    /// A cell fed by an external source, connected while it has listeners.
    Sensor,
    /// A sensor with a writable side that forwards writes to an external
    /// sink.
    Effector,
    /// A frozen value. No subjects, no listeners, no writes.
    Constant,
}

/// The layer observers are pinned to. Nothing user-visible sits above it.
pub(crate) const OBSERVER_LAYER: u32 = u32::MAX;

/// What a discrete cell settles back to at sweep end.
pub(crate) enum ResetPolicy<T> {
    /// Not a discrete cell.
    None,
    /// A fixed default value.
    Value(T),
    /// A fresh default produced per sweep (the todo pattern).
    Produce(Rc<dyn Fn() -> T>),
}

/// Scheduler-facing bookkeeping shared by every cell kind.
pub(crate) struct Meta {
    pub(crate) id: CellId,
    pub(crate) kind: std::cell::Cell<CellKind>,
    /// Upper bound on producer depth; orders recomputation.
    pub(crate) layer: std::cell::Cell<u32>,
    /// Change stamp of the latest notification affecting this cell.
    pub(crate) needs: std::cell::Cell<u64>,
    /// Change stamp as of which this cell was last brought current.
    pub(crate) version: std::cell::Cell<u64>,
    /// Pulse in which the value last changed.
    pub(crate) changed_as_of: std::cell::Cell<u64>,
    /// Pulse of the latest recalculation, for budget accounting.
    pub(crate) ran_in: std::cell::Cell<u64>,
    /// Recalculations so far in `ran_in`.
    pub(crate) runs: std::cell::Cell<u32>,
    /// True while this cell's rule is on the compute stack.
    pub(crate) computing: std::cell::Cell<bool>,
    /// True while this cell sits in a ready queue.
    pub(crate) queued: std::cell::Cell<bool>,
    /// One-shot flag set by `mark_dirty()`.
    pub(crate) force_changed: std::cell::Cell<bool>,
    /// Cells read during the most recent rule run, in read order.
    pub(crate) subjects: RefCell<Vec<Weak<dyn AnyCell>>>,
    /// Cells currently subscribed, in subscription order.
    pub(crate) listeners: RefCell<Vec<Weak<dyn AnyCell>>>,
}

impl Meta {
    fn new(kind: CellKind, layer: u32, dirty: bool) -> Self {
        Self {
            id: CellId::new(),
            kind: std::cell::Cell::new(kind),
            layer: std::cell::Cell::new(layer),
            needs: std::cell::Cell::new(u64::from(dirty)),
            version: std::cell::Cell::new(0),
            changed_as_of: std::cell::Cell::new(0),
            ran_in: std::cell::Cell::new(0),
            runs: std::cell::Cell::new(0),
            computing: std::cell::Cell::new(false),
            queued: std::cell::Cell::new(false),
            force_changed: std::cell::Cell::new(false),
            subjects: RefCell::new(Vec::new()),
            listeners: RefCell::new(Vec::new()),
        }
    }

    /// A recomputation is pending.
    pub(crate) fn is_dirty(&self) -> bool {
        self.needs.get() > self.version.get()
    }

    /// Raise the pending-notification stamp.
    pub(crate) fn bump_needs(&self, stamp: u64) {
        if stamp > self.needs.get() {
            self.needs.set(stamp);
        }
    }
}

/// Type-erased view of a cell, as the scheduler sees it.
pub(crate) trait AnyCell {
    fn meta(&self) -> &Meta;

    /// Bring the cell up to date for the current sweep. Returns whether its
    /// value changed in this sweep.
    fn bring_current(&self) -> Result<bool, TrellisError>;

    /// Snap a discrete cell back to its default, notifying listeners if
    /// that is itself a change.
    fn snap_reset(&self) -> Result<(), TrellisError>;

    /// Hook fired when the cell gains its first listener.
    fn on_first_listener(&self) {}

    /// Hook fired at section end when a sensor has no live listeners left.
    fn on_no_listeners(&self) {}
}

/// Shared state behind a [`Cell`] handle.
pub(crate) struct CellShared<T: Value> {
    meta: Meta,
    weak_self: Weak<CellShared<T>>,
    value: RefCell<Option<T>>,
    rule: RefCell<Option<Rc<dyn Fn() -> T>>>,
    reset: RefCell<ResetPolicy<T>>,
    writebuf: RefCell<Option<T>>,
    /// Whether a rule-backed cell accepts writes (the maintained contract).
    writable: std::cell::Cell<bool>,
    /// Sensor hooks: connect on first listener, disconnect on last.
    attach_hook: RefCell<Option<Box<dyn Fn()>>>,
    detach_hook: RefCell<Option<Box<dyn Fn()>>>,
    connected: std::cell::Cell<bool>,
    /// Effector write side.
    sink: RefCell<Option<Rc<dyn Fn(&T)>>>,
}

impl<T: Value> CellShared<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn raw(
        kind: CellKind,
        layer: u32,
        value: Option<T>,
        rule: Option<Rc<dyn Fn() -> T>>,
        reset: ResetPolicy<T>,
        writable: bool,
        dirty: bool,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            meta: Meta::new(kind, layer, dirty),
            weak_self: weak.clone(),
            value: RefCell::new(value),
            rule: RefCell::new(rule),
            reset: RefCell::new(reset),
            writebuf: RefCell::new(None),
            writable: std::cell::Cell::new(writable),
            attach_hook: RefCell::new(None),
            detach_hook: RefCell::new(None),
            connected: std::cell::Cell::new(false),
            sink: RefCell::new(None),
        })
    }

    fn strong(&self) -> Rc<Self> {
        self.weak_self.upgrade().expect("cell alive during call")
    }

    pub(crate) fn set_attach_hook(&self, hook: Box<dyn Fn()>) {
        *self.attach_hook.borrow_mut() = Some(hook);
    }

    pub(crate) fn set_detach_hook(&self, hook: Box<dyn Fn()>) {
        *self.detach_hook.borrow_mut() = Some(hook);
    }

    pub(crate) fn set_sink(&self, sink: Rc<dyn Fn(&T)>) {
        *self.sink.borrow_mut() = Some(sink);
    }

    pub(crate) fn sink(&self) -> Option<Rc<dyn Fn(&T)>> {
        self.sink.borrow().clone()
    }

    /// Drop the rule and every outgoing link. Used by observer disposal.
    pub(crate) fn clear_rule(&self) {
        *self.rule.borrow_mut() = None;
        let me = self.strong() as Rc<dyn AnyCell>;
        let old = std::mem::take(&mut *self.meta.subjects.borrow_mut());
        link::retire_stale(&me, &old);
    }

    /// The value a discrete cell settles back to, if it is discrete.
    fn reset_value(&self) -> Option<T> {
        match &*self.reset.borrow() {
            ResetPolicy::None => None,
            ResetPolicy::Value(v) => Some(v.clone()),
            ResetPolicy::Produce(f) => Some(f()),
        }
    }

    /// Read path shared by `get` and `try_get`.
    fn read(&self) -> Result<T, TrellisError> {
        let e = engine();
        let m = &self.meta;

        // Bring the cell up to date first: during a sweep always, otherwise
        // only for a lazy first activation.
        let first_activation = m.version.get() == 0 && self.rule.borrow().is_some();
        if m.is_dirty() && !m.computing.get() && (e.sweeping() || first_activation) {
            if e.history.is_active() {
                self.bring_current()?;
            } else {
                let this = self.strong();
                context::atomically(move || this.bring_current().map(|_| ()))?;
            }
        }

        // Only then record the subscription, so the reader never sees a
        // stale notification from this cell.
        if let Some(reader) = e.current() {
            let kind = m.kind.get();
            if reader.meta().id != m.id && kind != CellKind::Constant && kind != CellKind::Observer
            {
                let me = self.strong() as Rc<dyn AnyCell>;
                link::subscribe(&me, &reader);
            }
        }

        match &*self.value.borrow() {
            Some(v) => Ok(v.clone()),
            None => Err(TrellisError::InvalidOperation(
                "cell read before it produced a value",
            )),
        }
    }

    /// Check write permission for this cell.
    fn writable_check(&self) -> Result<(), TrellisError> {
        match self.meta.kind.get() {
            CellKind::Constant => Err(TrellisError::ReadOnly("constant cells can't be written")),
            CellKind::Observer => Err(TrellisError::ReadOnly("observer cells can't be written")),
            CellKind::Computed | CellKind::Discrete | CellKind::Sensor
                if !self.writable.get() =>
            {
                Err(TrellisError::ReadOnly(
                    "rule-backed cell has no writable override",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Buffer a write for the next sweep, checking the dual-write contract.
    ///
    /// Equal-value writes are detected at commit time, not here: a buffered
    /// write equal to the current value commits without notifying anyone,
    /// but it still participates in conflict detection against later
    /// writes in the same section.
    pub(crate) fn buffer_write(&self, v: T) -> Result<(), TrellisError> {
        let e = engine();
        {
            let mut buf = self.writebuf.borrow_mut();
            match &*buf {
                Some(old) if *old != v => {
                    return Err(TrellisError::conflict(old, &v));
                }
                Some(_) => return Ok(()), // same value again
                None => *buf = Some(v),
            }
        }
        let this = self.strong();
        e.history.on_undo(move || {
            this.writebuf.borrow_mut().take();
        })?;
        self.meta.bump_needs(e.next_stamp());
        e.enqueue(self.strong() as Rc<dyn AnyCell>);
        Ok(())
    }

    /// Execute the rule with this cell as the current computation.
    fn run_rule(&self, rule: &Rc<dyn Fn() -> T>) -> Result<T, TrellisError> {
        let e = engine();
        let m = &self.meta;
        let me = self.strong() as Rc<dyn AnyCell>;

        let old_subjects = std::mem::take(&mut *m.subjects.borrow_mut());
        {
            let this = self.strong();
            let restore = old_subjects.clone();
            e.history.on_undo(move || {
                *this.meta.subjects.borrow_mut() = restore;
            })?;
        }

        m.computing.set(true);
        e.push_current(me.clone());
        let new = rule();
        e.pop_current();
        m.computing.set(false);

        if let Some(err) = e.take_failure() {
            return Err(err);
        }

        link::retire_stale(&me, &old_subjects);

        // A computed cell that read nothing is permanently frozen.
        if m.kind.get() == CellKind::Computed && m.subjects.borrow().is_empty() {
            let this = self.strong();
            let old_rule = self.rule.borrow_mut().take();
            e.history.on_undo(move || {
                this.meta.kind.set(CellKind::Computed);
                *this.rule.borrow_mut() = old_rule;
            })?;
            m.kind.set(CellKind::Constant);
            debug!(cell = m.id.raw(), "computed cell froze into a constant");
        }

        // Keep the layer strictly above every subject.
        if m.kind.get() != CellKind::Observer {
            let max_subject = link::live_subjects(m)
                .iter()
                .map(|s| s.meta().layer.get())
                .max();
            if let Some(ms) = max_subject {
                let want = ms.saturating_add(1);
                if want > m.layer.get() {
                    let this = self.strong();
                    let old_layer = m.layer.get();
                    e.history.on_undo(move || {
                        this.meta.layer.set(old_layer);
                    })?;
                    m.layer.set(want);
                    trace!(cell = m.id.raw(), layer = want, "layer promoted");
                }
            }
        }

        Ok(new)
    }

    /// Store a new value if it differs, notify listeners, and schedule the
    /// discrete reset if applicable. Returns whether the value changed.
    fn commit_value(&self, new: T) -> Result<bool, TrellisError> {
        let e = engine();
        let m = &self.meta;
        let force = m.force_changed.replace(false);
        if !force && self.value.borrow().as_ref() == Some(&new) {
            return Ok(false);
        }

        let old = self.value.replace(Some(new));
        let old_changed = m.changed_as_of.replace(e.pulse());
        {
            let this = self.strong();
            e.history.on_undo(move || {
                *this.value.borrow_mut() = old;
                this.meta.changed_as_of.set(old_changed);
            })?;
        }

        if m.kind.get() == CellKind::Discrete {
            let is_default = self
                .reset_value()
                .is_some_and(|d| self.value.borrow().as_ref() == Some(&d));
            if !is_default {
                e.schedule_reset(self.strong() as Rc<dyn AnyCell>);
            }
        }

        let stamp = e.next_stamp();
        for listener in link::live_listeners(m) {
            listener.meta().bump_needs(stamp);
            e.enqueue(listener);
        }
        Ok(true)
    }
}

impl<T: Value> AnyCell for CellShared<T> {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn bring_current(&self) -> Result<bool, TrellisError> {
        let e = engine();
        let m = &self.meta;
        let pulse = e.pulse();

        if m.computing.get() {
            // Re-entrant read of a cell mid-rule: the caller uses the stored
            // (previous) value; any change will requeue it afterwards.
            return Ok(false);
        }
        if !m.is_dirty() {
            return Ok(m.changed_as_of.get() == pulse);
        }
        if m.kind.get() == CellKind::Constant {
            m.version.set(m.needs.get());
            return Ok(false);
        }

        if m.ran_in.get() == pulse {
            let runs = m.runs.get() + 1;
            m.runs.set(runs);
            if runs > e.max_recalcs() {
                return Err(TrellisError::Conflict {
                    first: format!("{:?}", self.value.borrow()),
                    second: format!("no convergence after {runs} recalculations"),
                });
            }
        } else {
            m.ran_in.set(pulse);
            m.runs.set(1);
        }

        let goal = m.needs.get();

        // A buffered write wins over the rule for this sweep.
        let buffered = self.writebuf.borrow_mut().take();
        if let Some(v) = buffered {
            let this = self.strong();
            let restore = v.clone();
            e.history.on_undo(move || {
                *this.writebuf.borrow_mut() = Some(restore);
            })?;
            m.version.set(goal);
            return self.commit_value(v);
        }

        let rule = self.rule.borrow().clone();
        let Some(rule) = rule else {
            m.version.set(goal);
            return Ok(false);
        };

        let new = self.run_rule(&rule)?;
        m.version.set(goal.max(m.version.get()));
        self.commit_value(new)
    }

    fn snap_reset(&self) -> Result<(), TrellisError> {
        let Some(default) = self.reset_value() else {
            return Ok(());
        };
        if self.value.borrow().as_ref() == Some(&default) {
            return Ok(());
        }
        trace!(cell = self.meta.id.raw(), "discrete cell reset");
        self.commit_value(default).map(|_| ())
    }

    fn on_first_listener(&self) {
        if self.connected.get() {
            return;
        }
        if let Some(hook) = &*self.attach_hook.borrow() {
            self.connected.set(true);
            debug!(cell = self.meta.id.raw(), "sensor connected");
            engine().without_tracking(hook);
        }
    }

    fn on_no_listeners(&self) {
        if !self.connected.get() {
            return;
        }
        if let Some(hook) = &*self.detach_hook.borrow() {
            self.connected.set(false);
            debug!(cell = self.meta.id.raw(), "sensor disconnected");
            engine().without_tracking(hook);
        }
    }
}

/// A reactive cell holding a value of type `T`.
///
/// Handles clone cheaply and share the same underlying cell. Cells are
/// single-threaded: they belong to the engine of the thread that created
/// them.
pub struct Cell<T: Value> {
    shared: Rc<CellShared<T>>,
}

impl<T: Value> Cell<T> {
    pub(crate) fn from_shared(shared: Rc<CellShared<T>>) -> Self {
        Self { shared }
    }

    /// Create an input cell holding `v`.
    pub fn new(v: T) -> Self {
        Self::from_shared(CellShared::raw(
            CellKind::Value,
            0,
            Some(v),
            None,
            ResetPolicy::None,
            true,
            false,
        ))
    }

    /// Create a frozen cell holding `v`. Constants reject writes and never
    /// participate in dependency tracking.
    pub fn constant(v: T) -> Self {
        Self::from_shared(CellShared::raw(
            CellKind::Constant,
            0,
            Some(v),
            None,
            ResetPolicy::None,
            false,
            false,
        ))
    }

    /// Create a read-only computed cell. The rule runs on first read and
    /// re-runs whenever a cell it read changes.
    pub fn computed(rule: impl Fn() -> T + 'static) -> Self {
        Self::from_shared(CellShared::raw(
            CellKind::Computed,
            1,
            None,
            Some(Rc::new(rule)),
            ResetPolicy::None,
            false,
            true,
        ))
    }

    /// Create a writable computed cell, activated eagerly.
    ///
    /// A write replaces the rule's current result for that sweep; the rule
    /// is expected to honor it via a self-referential read. `initial` is the
    /// value visible to such self-reads during the first rule run.
    pub fn maintained(rule: impl Fn() -> T + 'static, initial: T) -> Result<Self, TrellisError> {
        let cell = Self::from_shared(CellShared::raw(
            CellKind::Computed,
            1,
            Some(initial),
            Some(Rc::new(rule)),
            ResetPolicy::None,
            true,
            true,
        ));
        let shared = cell.shared.clone();
        context::atomically(move || shared.bring_current().map(|_| ()))?;
        Ok(cell)
    }

    /// Like [`Cell::maintained`], but without the eager first run. The
    /// component layer uses this to cache a cell before its rule executes,
    /// so mutually referential attributes can activate in any order.
    pub(crate) fn maintained_lazy(rule: Rc<dyn Fn() -> T>, initial: T) -> Self {
        Self::from_shared(CellShared::raw(
            CellKind::Computed,
            1,
            Some(initial),
            Some(rule),
            ResetPolicy::None,
            true,
            true,
        ))
    }

    /// Create a rule-backed discrete cell that settles back to `default` at
    /// the end of every sweep.
    pub fn discrete(rule: impl Fn() -> T + 'static, default: T) -> Self {
        Self::from_shared(CellShared::raw(
            CellKind::Discrete,
            1,
            Some(default.clone()),
            Some(Rc::new(rule)),
            ResetPolicy::Value(default),
            false,
            true,
        ))
    }

    /// Create a writable discrete input cell that settles back to `default`
    /// at the end of every sweep.
    pub fn resetting(default: T) -> Self {
        Self::from_shared(CellShared::raw(
            CellKind::Discrete,
            0,
            Some(default.clone()),
            None,
            ResetPolicy::Value(default),
            true,
            false,
        ))
    }

    /// Create a discrete cell whose per-sweep default is produced fresh by
    /// `producer`. This is the cell behind the todo/future pattern: mutate
    /// the upcoming value with [`Cell::future_mut`] inside a modifier.
    pub fn todo(producer: impl Fn() -> T + 'static) -> Self {
        let producer: Rc<dyn Fn() -> T> = Rc::new(producer);
        Self::from_shared(CellShared::raw(
            CellKind::Discrete,
            0,
            Some(producer()),
            None,
            ResetPolicy::Produce(producer),
            true,
            false,
        ))
    }

    /// Stable identity of this cell.
    pub fn id(&self) -> CellId {
        self.shared.meta.id
    }

    /// Current kind. Kinds change only by constant absorption.
    pub fn kind(&self) -> CellKind {
        self.shared.meta.kind.get()
    }

    /// Current layer.
    pub fn layer(&self) -> u32 {
        self.shared.meta.layer.get()
    }

    /// Read the cell's value.
    ///
    /// Inside a rule this subscribes the rule to the cell. Dirty cells are
    /// brought up to date before the value is returned.
    ///
    /// # Panics
    ///
    /// Panics if the engine cannot produce a value at all (a divergent
    /// first activation). Inside an atomic section such errors instead
    /// abort the section.
    pub fn get(&self) -> T {
        match self.shared.read() {
            Ok(v) => v,
            Err(err) => {
                let e = engine();
                if e.history.is_active() {
                    e.record_failure(err);
                    if let Some(v) = self.shared.value.borrow().clone() {
                        return v;
                    }
                }
                panic!("cell {} read failed", self.shared.meta.id.raw());
            }
        }
    }

    /// Read the cell's value, reporting engine errors to the caller.
    pub fn try_get(&self) -> Result<T, TrellisError> {
        self.shared.read()
    }

    /// Write a value to the cell.
    ///
    /// Outside an atomic section this opens one (and drives the resulting
    /// sweeps before returning). Inside a rule the write is deferred to the
    /// end of the sweep. Unequal writes to the same cell within one section
    /// fail with [`TrellisError::Conflict`]; writing the current value is a
    /// no-op.
    pub fn set(&self, v: T) -> Result<(), TrellisError> {
        self.shared.writable_check()?;
        if let Some(sink) = self.shared.sink() {
            // Effector: forward to the external sink, without tracking.
            let e = engine();
            e.without_tracking(|| sink(&v));
        }
        let e = engine();
        if e.current().is_some() {
            // Change takes time: writes from rules land next sweep.
            let shared = self.shared.clone();
            e.defer_write(Box::new(move || shared.buffer_write(v)));
            return Ok(());
        }
        let shared = self.shared.clone();
        context::atomically(move || shared.buffer_write(v))
    }

    /// Mutate the value this discrete cell is about to commit.
    ///
    /// Only legal inside a modifier and outside any rule. The future value
    /// is materialized once per sweep from the cell's default producer;
    /// subsequent calls in the same sweep see the accumulated mutations.
    pub fn future_mut(&self, f: impl FnOnce(&mut T)) -> Result<(), TrellisError> {
        let e = engine();
        if !e.history.is_active() || !e.in_modifier() {
            return Err(TrellisError::InvalidOperation(
                "future views are only available inside a modifier",
            ));
        }
        if e.current().is_some() {
            return Err(TrellisError::InvalidOperation(
                "future views can't be used inside a rule",
            ));
        }
        let shared = &self.shared;
        if shared.meta.kind.get() != CellKind::Discrete {
            return Err(TrellisError::InvalidOperation(
                "future views require a discrete cell",
            ));
        }
        let materialized = {
            let mut buf = shared.writebuf.borrow_mut();
            let fresh = buf.is_none();
            if fresh {
                *buf = shared.reset_value();
            }
            f(buf.as_mut().expect("future value just materialized"));
            fresh
        };
        if materialized {
            let this = shared.clone();
            e.history.on_undo(move || {
                this.writebuf.borrow_mut().take();
            })?;
            shared.meta.bump_needs(e.next_stamp());
            e.enqueue(shared.clone() as Rc<dyn AnyCell>);
        }
        Ok(())
    }

    /// Freeze this cell into a constant holding `v`.
    ///
    /// Permitted only during initial wiring, before anything subscribed to
    /// the cell.
    pub fn set_to_constant(&self, v: T) -> Result<(), TrellisError> {
        let shared = &self.shared;
        if !link::live_listeners(&shared.meta).is_empty() {
            return Err(TrellisError::InvalidOperation(
                "can't freeze a cell that already has listeners",
            ));
        }
        if shared.meta.kind.get() == CellKind::Observer {
            return Err(TrellisError::ReadOnly("observer cells can't be frozen"));
        }
        *shared.rule.borrow_mut() = None;
        *shared.value.borrow_mut() = Some(v);
        shared.meta.kind.set(CellKind::Constant);
        shared.meta.needs.set(shared.meta.version.get());
        Ok(())
    }

    /// Schedule this cell for recalculation even though no subject changed.
    pub fn ensure_recalc(&self) -> Result<(), TrellisError> {
        let shared = self.shared.clone();
        context::atomically(move || {
            let e = engine();
            shared.meta.bump_needs(e.next_stamp());
            e.enqueue(shared.clone() as Rc<dyn AnyCell>);
            Ok(())
        })
    }

    /// Identities of the cells this cell read during its latest rule run,
    /// most recently read first.
    pub fn subjects(&self) -> Vec<CellId> {
        link::subject_ids(&self.shared.meta)
    }

    /// Identities of the cells currently subscribed to this cell, most
    /// recently subscribed first.
    pub fn listeners(&self) -> Vec<CellId> {
        link::listener_ids(&self.shared.meta)
    }
}

impl<T: Value> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: Value> Debug for Cell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.shared.meta.id.raw())
            .field("kind", &self.shared.meta.kind.get())
            .field("layer", &self.shared.meta.layer.get())
            .field("value", &self.shared.value.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_cell_get_and_set() {
        let cell = Cell::new(0);
        assert_eq!(cell.get(), 0);
        cell.set(42).unwrap();
        assert_eq!(cell.get(), 42);
    }

    #[test]
    fn computed_cell_tracks_its_input() {
        let input = Cell::new(10);
        let doubled = {
            let input = input.clone();
            Cell::computed(move || input.get() * 2)
        };
        assert_eq!(doubled.get(), 20);

        input.set(5).unwrap();
        assert_eq!(doubled.get(), 10);
    }

    #[test]
    fn computed_chain_updates_transitively() {
        let base = Cell::new(1);
        let double = {
            let base = base.clone();
            Cell::computed(move || base.get() * 2)
        };
        let plus_one = {
            let double = double.clone();
            Cell::computed(move || double.get() + 1)
        };
        assert_eq!(plus_one.get(), 3);

        base.set(10).unwrap();
        assert_eq!(plus_one.get(), 21);
        assert!(plus_one.layer() > double.layer());
    }

    #[test]
    fn equal_write_is_a_no_op() {
        let input = Cell::new(7);
        let runs = Rc::new(std::cell::Cell::new(0));
        let watcher = {
            let (input, runs) = (input.clone(), runs.clone());
            Cell::computed(move || {
                runs.set(runs.get() + 1);
                input.get()
            })
        };
        assert_eq!(watcher.get(), 7);
        assert_eq!(runs.get(), 1);

        input.set(7).unwrap();
        assert_eq!(watcher.get(), 7);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn unequal_writes_in_one_section_conflict() {
        let cell = Cell::new(0);
        let c = cell.clone();
        let err = context::atomically(move || {
            c.set(22)?;
            c.set(55)
        })
        .unwrap_err();
        assert_eq!(err, TrellisError::conflict(&22, &55));
        // The aborted section left the original value in place.
        assert_eq!(cell.get(), 0);
    }

    #[test]
    fn equal_writes_in_one_section_commute() {
        let cell = Cell::new(0);
        let c = cell.clone();
        context::atomically(move || {
            c.set(9)?;
            c.set(9)
        })
        .unwrap();
        assert_eq!(cell.get(), 9);
    }

    #[test]
    fn constants_reject_writes() {
        let k = Cell::constant(5);
        let err = k.set(6).unwrap_err();
        assert!(matches!(err, TrellisError::ReadOnly(_)));
        assert_eq!(k.get(), 5);
    }

    #[test]
    fn computed_without_override_rejects_writes() {
        let c = Cell::computed(|| 1);
        let err = c.set(2).unwrap_err();
        assert!(matches!(err, TrellisError::ReadOnly(_)));
    }

    #[test]
    fn rule_with_no_reads_becomes_constant() {
        let c = Cell::computed(|| 99);
        assert_eq!(c.get(), 99);
        assert_eq!(c.kind(), CellKind::Constant);
    }

    #[test]
    fn rule_reading_only_constants_becomes_constant() {
        let k = Cell::constant(10);
        let c = {
            let k = k.clone();
            Cell::computed(move || k.get() + 1)
        };
        assert_eq!(c.get(), 11);
        assert_eq!(c.kind(), CellKind::Constant);
        assert!(k.listeners().is_empty());
    }

    #[test]
    fn maintained_cell_accepts_writes() {
        let input = Cell::new(1);
        let m = {
            let input = input.clone();
            Cell::maintained(move || input.get() * 10, 10).unwrap()
        };
        assert_eq!(m.get(), 10);
        m.set(42).unwrap();
        assert_eq!(m.get(), 42);
    }

    #[test]
    fn maintained_rule_with_no_reads_freezes_too() {
        let m = Cell::maintained(|| 7, 7).unwrap();
        assert_eq!(m.kind(), CellKind::Constant);
        assert!(m.set(8).is_err());
    }

    #[test]
    fn self_read_sees_previous_value() {
        let input = Cell::new(1);
        let accum = Rc::new(RefCell::new(None::<Cell<i32>>));
        let cell = {
            let (input, accum) = (input.clone(), accum.clone());
            Cell::maintained(
                move || {
                    let prior = accum.borrow().as_ref().map_or(0, Cell::get);
                    prior + input.get()
                },
                0,
            )
            .unwrap()
        };
        // First run saw no backreference: 0 + 1.
        assert_eq!(cell.get(), 1);
        *accum.borrow_mut() = Some(cell.clone());

        input.set(10).unwrap();
        // The self-read observed the previous value: 1 + 10.
        assert_eq!(cell.get(), 11);
        // No self-link was recorded.
        assert_eq!(cell.subjects().len(), 1);
    }

    #[test]
    fn resetting_cell_snaps_back_after_the_sweep() {
        let event = Cell::resetting(0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let watcher = {
            let (event, seen) = (event.clone(), seen.clone());
            Cell::computed(move || {
                let v = event.get();
                seen.borrow_mut().push(v);
                v
            })
        };
        assert_eq!(watcher.get(), 0);

        event.set(5).unwrap();
        // Settled state: the event snapped back to its default and the
        // watcher saw both the value and the reset.
        assert_eq!(event.get(), 0);
        assert_eq!(watcher.get(), 0);
        assert_eq!(*seen.borrow(), vec![0, 5, 0]);
    }

    #[test]
    fn ensure_recalc_reruns_an_unchanged_rule() {
        let input = Cell::new(1);
        let runs = Rc::new(std::cell::Cell::new(0));
        let c = {
            let (input, runs) = (input.clone(), runs.clone());
            Cell::computed(move || {
                runs.set(runs.get() + 1);
                input.get()
            })
        };
        assert_eq!(c.get(), 1);
        assert_eq!(runs.get(), 1);

        c.ensure_recalc().unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn set_to_constant_only_before_wiring() {
        let a = Cell::new(1);
        a.set_to_constant(3).unwrap();
        assert_eq!(a.kind(), CellKind::Constant);
        assert_eq!(a.get(), 3);

        let b = Cell::new(1);
        let reader = {
            let b = b.clone();
            Cell::computed(move || b.get())
        };
        assert_eq!(reader.get(), 1);
        assert!(b.set_to_constant(2).is_err());
    }

    #[test]
    fn future_view_requires_a_modifier() {
        let todo: Cell<Vec<i32>> = Cell::todo(Vec::new);
        let err = todo.future_mut(|v| v.push(1)).unwrap_err();
        assert!(matches!(err, TrellisError::InvalidOperation(_)));
    }

    #[test]
    fn future_view_accumulates_within_one_sweep() {
        let todo: Cell<Vec<i32>> = Cell::todo(Vec::new);
        let log = Rc::new(RefCell::new(Vec::new()));
        let watch = {
            let (todo, log) = (todo.clone(), log.clone());
            Cell::computed(move || {
                let v = todo.get();
                if !v.is_empty() {
                    log.borrow_mut().push(v.clone());
                }
                v.len()
            })
        };
        assert_eq!(watch.get(), 0);

        let t = todo.clone();
        context::modify(move || {
            t.future_mut(|v| v.push(1))?;
            t.future_mut(|v| v.push(2))
        })
        .unwrap();

        assert_eq!(*log.borrow(), vec![vec![1, 2]]);
        // And the todo itself settled back to empty.
        assert!(todo.get().is_empty());
    }
}
