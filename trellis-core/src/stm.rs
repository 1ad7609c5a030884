//! Software transactional memory substrate.
//!
//! The engine wraps every externally visible state change in an atomic
//! section. This module owns the bookkeeping for one section: an ordered
//! undo log, savepoints into that log, and scope managers whose `exit`
//! callbacks run when the section ends.
//!
//! # How It Works
//!
//! 1. The engine marks the history active when the outermost section opens.
//!
//! 2. While the section runs, every state mutation appends an inverse
//!    operation to the undo log, and resources register scope managers.
//!
//! 3. On commit the undo log is discarded and managers exit in LIFO order
//!    with no error.
//!
//! 4. On abort the undo log is replayed in reverse insertion order, managers
//!    exit in LIFO order carrying the error, and the error propagates.
//!
//! The history itself is deliberately unaware of cells and sweeps; the
//! scheduler drives it. That keeps rollback testable in isolation.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::TrellisError;

/// Inverse of one state mutation, replayed on rollback.
///
/// Undo entries are required to be infallible. If one panics, the remaining
/// entries are skipped; this is the documented contract, not a recoverable
/// condition.
type UndoEntry = Box<dyn FnOnce()>;

/// An RAII-style resource scope tied to the lifetime of an atomic section.
///
/// Registered with [`StmHistory::manage`]; `enter` runs at registration and
/// `exit` runs when the enclosing section commits or aborts. `exit` receives
/// the section's error, if any. An error returned from `exit` replaces the
/// section's outcome, but the remaining managers still exit.
pub trait ScopeManager {
    /// Called once when the manager is first registered in a section.
    fn enter(&self);

    /// Called when the section ends. `error` is `None` on commit.
    fn exit(&self, error: Option<&TrellisError>) -> Result<(), TrellisError>;
}

/// Opaque token capturing the current undo-log depth.
///
/// Produced by [`StmHistory::savepoint`] and consumed by
/// [`StmHistory::rollback_to`] to partially rewind a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint(usize);

/// Undo log, savepoints, and scope managers for one thread's engine.
pub(crate) struct StmHistory {
    active: Cell<bool>,
    in_cleanup: Cell<bool>,
    undo: RefCell<Vec<UndoEntry>>,
    managers: RefCell<Vec<Rc<dyn ScopeManager>>>,
}

impl StmHistory {
    pub(crate) fn new() -> Self {
        Self {
            active: Cell::new(false),
            in_cleanup: Cell::new(false),
            undo: RefCell::new(Vec::new()),
            managers: RefCell::new(Vec::new()),
        }
    }

    /// Whether an atomic section is currently open.
    pub(crate) fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Whether commit/abort processing is currently executing.
    pub(crate) fn in_cleanup(&self) -> bool {
        self.in_cleanup.get()
    }

    /// Mark the outermost section open. Panics if one is already open; the
    /// caller is responsible for joining nested sections instead.
    pub(crate) fn begin(&self) {
        assert!(!self.active.get(), "atomic section already active");
        self.active.set(true);
    }

    /// Append an entry to the undo log.
    pub(crate) fn on_undo(&self, f: impl FnOnce() + 'static) -> Result<(), TrellisError> {
        if !self.active.get() {
            return Err(TrellisError::InvalidOperation(
                "can't record undo outside an atomic section",
            ));
        }
        self.undo.borrow_mut().push(Box::new(f));
        Ok(())
    }

    /// Record the current undo-log length.
    pub(crate) fn savepoint(&self) -> Result<Savepoint, TrellisError> {
        if !self.active.get() {
            return Err(TrellisError::InvalidOperation(
                "can't take a savepoint outside an atomic section",
            ));
        }
        Ok(Savepoint(self.undo.borrow().len()))
    }

    /// Replay and truncate the undo log back to `sp`.
    ///
    /// Entries run in reverse insertion order. Each entry is popped before it
    /// runs, so an entry may itself append further undo work without
    /// disturbing the replay.
    pub(crate) fn rollback_to(&self, sp: Savepoint) -> Result<(), TrellisError> {
        if !self.active.get() {
            return Err(TrellisError::InvalidOperation(
                "can't roll back outside an atomic section",
            ));
        }
        trace!(to = sp.0, "rolling back undo log");
        loop {
            let entry = {
                let mut undo = self.undo.borrow_mut();
                if undo.len() <= sp.0 {
                    break;
                }
                undo.pop()
            };
            if let Some(f) = entry {
                f();
            }
        }
        Ok(())
    }

    /// Register a scope manager for the current section.
    ///
    /// Registration is idempotent per section: a manager already registered
    /// is not entered again.
    pub(crate) fn manage(&self, mgr: Rc<dyn ScopeManager>) -> Result<(), TrellisError> {
        if !self.active.get() {
            return Err(TrellisError::InvalidOperation(
                "can't register a scope manager outside an atomic section",
            ));
        }
        let mut managers = self.managers.borrow_mut();
        if managers.iter().any(|m| Rc::ptr_eq(m, &mgr)) {
            return Ok(());
        }
        mgr.enter();
        managers.push(mgr);
        Ok(())
    }

    /// End the section: exit managers in LIFO order, roll back on error,
    /// clear the undo log, and mark the history inactive.
    ///
    /// Returns the final outcome. A manager `exit` error replaces the
    /// incoming outcome but does not stop the remaining exits.
    pub(crate) fn cleanup(&self, error: Option<TrellisError>) -> Result<(), TrellisError> {
        assert!(self.active.get(), "can't clean up an inactive history");
        assert!(!self.in_cleanup.get(), "cleanup is not reentrant");
        self.in_cleanup.set(true);

        let mut outcome = error;
        let mut managers = std::mem::take(&mut *self.managers.borrow_mut());
        while let Some(mgr) = managers.pop() {
            if let Err(e) = mgr.exit(outcome.as_ref()) {
                outcome = Some(e);
            }
        }

        let result = match outcome {
            Some(err) => {
                debug!(%err, "atomic section aborted");
                let r = self.rollback_to(Savepoint(0));
                self.undo.borrow_mut().clear();
                r.and(Err(err))
            }
            None => {
                trace!("atomic section committed");
                self.undo.borrow_mut().clear();
                Ok(())
            }
        };

        self.in_cleanup.set(false);
        self.active.set(false);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn active_history() -> StmHistory {
        let h = StmHistory::new();
        h.begin();
        h
    }

    #[test]
    fn undo_replays_in_reverse_order() {
        let h = active_history();
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            h.on_undo(move || log.borrow_mut().push(i)).unwrap();
        }

        h.rollback_to(Savepoint(0)).unwrap();
        assert_eq!(*log.borrow(), vec![2, 1, 0]);
    }

    #[test]
    fn savepoint_truncates_partially() {
        let h = active_history();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        h.on_undo(move || l.borrow_mut().push("early")).unwrap();
        let sp = h.savepoint().unwrap();
        let l = log.clone();
        h.on_undo(move || l.borrow_mut().push("late")).unwrap();

        h.rollback_to(sp).unwrap();
        assert_eq!(*log.borrow(), vec!["late"]);

        // The earlier entry is still there for a full rollback.
        h.rollback_to(Savepoint(0)).unwrap();
        assert_eq!(*log.borrow(), vec!["late", "early"]);
    }

    #[test]
    fn undo_requires_active_section() {
        let h = StmHistory::new();
        let err = h.on_undo(|| {}).unwrap_err();
        assert!(matches!(err, TrellisError::InvalidOperation(_)));
    }

    struct Recorder {
        name: &'static str,
        log: Rc<RefCell<Vec<String>>>,
        fail_on_exit: bool,
    }

    impl ScopeManager for Recorder {
        fn enter(&self) {
            self.log.borrow_mut().push(format!("enter {}", self.name));
        }

        fn exit(&self, error: Option<&TrellisError>) -> Result<(), TrellisError> {
            self.log
                .borrow_mut()
                .push(format!("exit {} err={}", self.name, error.is_some()));
            if self.fail_on_exit {
                Err(TrellisError::user(format!("{} exit failed", self.name)))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn managers_enter_once_and_exit_lifo() {
        let h = active_history();
        let log = Rc::new(RefCell::new(Vec::new()));

        let a: Rc<dyn ScopeManager> = Rc::new(Recorder {
            name: "a",
            log: log.clone(),
            fail_on_exit: false,
        });
        let b: Rc<dyn ScopeManager> = Rc::new(Recorder {
            name: "b",
            log: log.clone(),
            fail_on_exit: false,
        });

        h.manage(a.clone()).unwrap();
        h.manage(b).unwrap();
        h.manage(a).unwrap(); // duplicate registration is a no-op

        h.cleanup(None).unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["enter a", "enter b", "exit b err=false", "exit a err=false"]
        );
    }

    #[test]
    fn failing_manager_replaces_outcome_but_others_still_exit() {
        let h = active_history();
        let log = Rc::new(RefCell::new(Vec::new()));

        let inner: Rc<dyn ScopeManager> = Rc::new(Recorder {
            name: "inner",
            log: log.clone(),
            fail_on_exit: true,
        });
        let outer: Rc<dyn ScopeManager> = Rc::new(Recorder {
            name: "outer",
            log: log.clone(),
            fail_on_exit: false,
        });

        h.manage(outer).unwrap();
        h.manage(inner).unwrap();

        let err = h.cleanup(None).unwrap_err();
        assert_eq!(err, TrellisError::user("inner exit failed"));
        // Both managers exited, outer last, and the outer saw the error.
        assert_eq!(
            *log.borrow(),
            vec![
                "enter outer",
                "enter inner",
                "exit inner err=false",
                "exit outer err=true"
            ]
        );
    }

    #[test]
    fn cleanup_with_error_rolls_back() {
        let h = active_history();
        let undone = Rc::new(Cell::new(false));
        let u = undone.clone();
        h.on_undo(move || u.set(true)).unwrap();

        let err = h.cleanup(Some(TrellisError::user("boom"))).unwrap_err();
        assert_eq!(err, TrellisError::user("boom"));
        assert!(undone.get());
        assert!(!h.is_active());
    }

    #[test]
    fn cleanup_without_error_discards_undo() {
        let h = active_history();
        let undone = Rc::new(Cell::new(false));
        let u = undone.clone();
        h.on_undo(move || u.set(true)).unwrap();

        h.cleanup(None).unwrap();
        assert!(!undone.get());
        assert!(!h.is_active());
    }
}
