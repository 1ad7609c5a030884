//! Subject/listener links.
//!
//! Every cell keeps two ordered edge lists: the subjects it read during its
//! most recent rule run, and the listeners currently subscribed to it. Both
//! ends hold weak references, so dropping a cell's last handle excises it
//! from the graph lazily: the next traversal scrubs dead entries.
//!
//! Ordering contract: traversal yields entries in reverse order of
//! subscription. Re-subscribing an existing pair never creates a duplicate.

use std::rc::{Rc, Weak};

use crate::reactive::cell::{AnyCell, CellId, Meta};

/// Record that `listener`'s running rule read `subject`.
///
/// Called after the subject's value has settled, so the listener never
/// receives a stale notification from it. Both directions are deduplicated.
pub(crate) fn subscribe(subject: &Rc<dyn AnyCell>, listener: &Rc<dyn AnyCell>) {
    let subject_id = subject.meta().id;
    let listener_id = listener.meta().id;

    {
        let mut subjects = listener.meta().subjects.borrow_mut();
        let already = subjects
            .iter()
            .filter_map(Weak::upgrade)
            .any(|s| s.meta().id == subject_id);
        if !already {
            subjects.push(Rc::downgrade(subject));
        }
    }

    let had_listeners;
    {
        let mut listeners = subject.meta().listeners.borrow_mut();
        listeners.retain(|w| w.upgrade().is_some());
        had_listeners = !listeners.is_empty();
        let already = listeners
            .iter()
            .filter_map(Weak::upgrade)
            .any(|l| l.meta().id == listener_id);
        if already {
            return;
        }
        listeners.push(Rc::downgrade(listener));
    }
    if !had_listeners {
        subject.on_first_listener();
    }
}

/// Drop the listener's link from every subject in `previous` that it did not
/// re-read during its latest rule run.
pub(crate) fn retire_stale(listener: &Rc<dyn AnyCell>, previous: &[Weak<dyn AnyCell>]) {
    let listener_id = listener.meta().id;
    let current: Vec<CellId> = listener
        .meta()
        .subjects
        .borrow()
        .iter()
        .filter_map(Weak::upgrade)
        .map(|s| s.meta().id)
        .collect();

    for old in previous.iter().filter_map(Weak::upgrade) {
        if current.contains(&old.meta().id) {
            continue;
        }
        old.meta()
            .listeners
            .borrow_mut()
            .retain(|w| match w.upgrade() {
                Some(l) => l.meta().id != listener_id,
                None => false,
            });
    }
}

/// Live listeners of a cell, most recently subscribed first. Scrubs dead
/// entries as a side effect.
pub(crate) fn live_listeners(meta: &Meta) -> Vec<Rc<dyn AnyCell>> {
    let mut listeners = meta.listeners.borrow_mut();
    listeners.retain(|w| w.upgrade().is_some());
    listeners.iter().rev().filter_map(Weak::upgrade).collect()
}

/// Live subjects of a cell, most recently read first.
pub(crate) fn live_subjects(meta: &Meta) -> Vec<Rc<dyn AnyCell>> {
    let mut subjects = meta.subjects.borrow_mut();
    subjects.retain(|w| w.upgrade().is_some());
    subjects.iter().rev().filter_map(Weak::upgrade).collect()
}

/// Identities of a cell's live subjects, most recently read first.
pub(crate) fn subject_ids(meta: &Meta) -> Vec<CellId> {
    live_subjects(meta).iter().map(|s| s.meta().id).collect()
}

/// Identities of a cell's live listeners, most recently subscribed first.
pub(crate) fn listener_ids(meta: &Meta) -> Vec<CellId> {
    live_listeners(meta).iter().map(|l| l.meta().id).collect()
}
