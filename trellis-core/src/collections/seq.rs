//! Observable sequence.

use crate::error::TrellisError;
use crate::reactive::{modify, Cell, Value};

/// One buffered sequence mutation.
///
/// Fine-grained diffs of arbitrary sequence edits are not tractable, so the
/// visible state is rebuilt copy-on-write by replaying the sweep's ops.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SeqChange<T> {
    /// Append one item.
    Push(T),
    /// Insert before `0`-based position (clamped to the length).
    Insert(usize, T),
    /// Replace the item at a position; out of range is ignored.
    Set(usize, T),
    /// Remove the item at a position; out of range is ignored.
    Remove(usize),
    /// Shorten to at most the given length.
    Truncate(usize),
    /// Remove everything.
    Clear,
}

impl<T: Clone> SeqChange<T> {
    fn apply(&self, items: &mut Vec<T>) {
        match self {
            Self::Push(item) => items.push(item.clone()),
            Self::Insert(at, item) => {
                let at = (*at).min(items.len());
                items.insert(at, item.clone());
            }
            Self::Set(at, item) => {
                if let Some(slot) = items.get_mut(*at) {
                    *slot = item.clone();
                }
            }
            Self::Remove(at) => {
                if *at < items.len() {
                    items.remove(*at);
                }
            }
            Self::Truncate(len) => items.truncate(*len),
            Self::Clear => items.clear(),
        }
    }
}

/// A reactive sequence.
///
/// Mutations buffer as [`SeqChange`] ops; the next sweep replays them onto
/// a copy of the previous contents. The [`changed`](MutSeq::changed) cell
/// is a discrete boolean that holds `true` exactly for sweeps that applied
/// at least one op.
pub struct MutSeq<T: Value> {
    data: Cell<Vec<T>>,
    ops: Cell<Vec<SeqChange<T>>>,
    changed: Cell<bool>,
}

impl<T: Value> MutSeq<T> {
    /// Create an empty sequence.
    pub fn new() -> Result<Self, TrellisError> {
        Self::with_items(std::iter::empty())
    }

    /// Create a sequence holding `items`.
    pub fn with_items(items: impl IntoIterator<Item = T>) -> Result<Self, TrellisError> {
        let initial: Vec<T> = items.into_iter().collect();
        let ops: Cell<Vec<SeqChange<T>>> = Cell::todo(Vec::new);

        let changed = {
            let ops = ops.clone();
            Cell::discrete(move || !ops.get().is_empty(), false)
        };

        let backref: std::rc::Rc<std::cell::RefCell<Option<Cell<Vec<T>>>>> =
            std::rc::Rc::new(std::cell::RefCell::new(None));
        let data = {
            let ops = ops.clone();
            let backref = backref.clone();
            let first = initial.clone();
            Cell::maintained(
                move || {
                    let mut items =
                        backref.borrow().as_ref().map_or_else(|| first.clone(), Cell::get);
                    for op in ops.get() {
                        op.apply(&mut items);
                    }
                    items
                },
                initial,
            )?
        };
        *backref.borrow_mut() = Some(data.clone());

        Ok(Self { data, ops, changed })
    }

    fn record(&self, op: SeqChange<T>) -> Result<(), TrellisError> {
        let this = self.clone();
        modify(move || {
            this.ops.future_mut(|log| log.push(op.clone()))
        })
    }

    /// Append `item` at the next sweep.
    pub fn push(&self, item: T) -> Result<(), TrellisError> {
        self.record(SeqChange::Push(item))
    }

    /// Insert `item` before `at` at the next sweep.
    pub fn insert(&self, at: usize, item: T) -> Result<(), TrellisError> {
        self.record(SeqChange::Insert(at, item))
    }

    /// Replace the item at `at` at the next sweep.
    pub fn set(&self, at: usize, item: T) -> Result<(), TrellisError> {
        self.record(SeqChange::Set(at, item))
    }

    /// Remove the item at `at` at the next sweep.
    pub fn remove(&self, at: usize) -> Result<(), TrellisError> {
        self.record(SeqChange::Remove(at))
    }

    /// Shorten to `len` at the next sweep.
    pub fn truncate(&self, len: usize) -> Result<(), TrellisError> {
        self.record(SeqChange::Truncate(len))
    }

    /// Remove everything at the next sweep.
    pub fn clear(&self) -> Result<(), TrellisError> {
        self.record(SeqChange::Clear)
    }

    /// Append several items at the next sweep.
    pub fn extend(&self, items: impl IntoIterator<Item = T>) -> Result<(), TrellisError> {
        let ops: Vec<SeqChange<T>> = items.into_iter().map(SeqChange::Push).collect();
        let this = self.clone();
        modify(move || {
            this.ops.future_mut(|log| log.extend(ops.iter().cloned()))
        })
    }

    /// Removing the last item and returning it would read and write in the
    /// same operation; read it first, then truncate.
    pub fn pop(&self) -> Result<T, TrellisError> {
        Err(TrellisError::Conflict {
            first: "read".to_owned(),
            second: "Can't read and write in the same operation".to_owned(),
        })
    }

    /// The item at `at`, if any.
    pub fn get(&self, at: usize) -> Option<T> {
        self.data.get().get(at).cloned()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.data.get().len()
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.data.get().is_empty()
    }

    /// Snapshot of the current contents.
    pub fn to_vec(&self) -> Vec<T> {
        self.data.get()
    }

    /// The visible data cell.
    pub fn cell(&self) -> &Cell<Vec<T>> {
        &self.data
    }

    /// Discrete boolean: did this sweep change the sequence?
    pub fn changed(&self) -> &Cell<bool> {
        &self.changed
    }
}

impl<T: Value> Clone for MutSeq<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            ops: self.ops.clone(),
            changed: self.changed.clone(),
        }
    }
}

impl<T: Value> std::fmt::Debug for MutSeq<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MutSeq({:?})", self.data.get())
    }
}
