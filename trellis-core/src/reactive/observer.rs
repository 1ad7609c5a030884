//! Observer cells.
//!
//! An observer is a terminal rule: it exists to push changes out of the
//! cell graph (logging, widget updates, queueing work for an event loop).
//! Observers are pinned to the top scheduler layer, so they fire only after
//! every computed cell below them is quiescent, and they are never recorded
//! as the subject of any other rule.
//!
//! Observers may write to cells. Such writes join the enclosing atomic
//! section and trigger a follow-up sweep. Be careful when combining this
//! with external side effects: if a later observer aborts the section, the
//! cell state rolls back but side effects already performed by earlier
//! observers are not undone.

use std::rc::Rc;

use crate::error::TrellisError;
use crate::reactive::cell::{AnyCell, CellId, CellKind, CellShared, ResetPolicy, OBSERVER_LAYER};
use crate::reactive::context;
use crate::reactive::link;

/// A side-effecting terminal cell.
///
/// The rule runs once at creation to establish its subscriptions, then
/// again in the observer phase of every sweep in which one of its subjects
/// changed. Dropping the last handle (or calling [`Observer::dispose`])
/// retires it.
pub struct Observer {
    shared: Rc<CellShared<()>>,
}

impl Observer {
    /// Create an observer and run it immediately.
    pub fn new(rule: impl Fn() + 'static) -> Result<Self, TrellisError> {
        let rule: Rc<dyn Fn()> = Rc::new(rule);
        let shared = CellShared::raw(
            CellKind::Observer,
            OBSERVER_LAYER,
            Some(()),
            Some(rule),
            ResetPolicy::None,
            false,
            true,
        );
        let eager = shared.clone();
        context::atomically(move || eager.bring_current().map(|_| ()))?;
        Ok(Self { shared })
    }

    /// Stable identity of the underlying cell.
    pub fn id(&self) -> CellId {
        self.shared.meta().id
    }

    /// Identities of the cells this observer read during its latest run.
    pub fn subjects(&self) -> Vec<CellId> {
        link::subject_ids(self.shared.meta())
    }

    /// Stop the observer permanently and drop its subscriptions.
    pub fn dispose(&self) {
        self.shared.clear_rule();
    }
}

impl Clone for Observer {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.shared.meta().id.raw())
            .field("subjects", &self.subjects().len())
            .finish()
    }
}
