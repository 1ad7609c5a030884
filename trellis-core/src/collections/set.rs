//! Observable set.

use std::collections::HashSet;
use std::hash::Hash;

use crate::error::TrellisError;
use crate::reactive::{modify, Cell, Value};

/// A reactive set.
///
/// Reading the set from a rule subscribes the rule to it. Mutations are
/// modifiers: they buffer into the upcoming sweep, and the per-sweep
/// [`added`](MutSet::added) and [`removed`](MutSet::removed) delta cells
/// carry exactly what that sweep changed before resetting to empty.
pub struct MutSet<T: Value + Eq + Hash> {
    data: Cell<HashSet<T>>,
    added: Cell<HashSet<T>>,
    removed: Cell<HashSet<T>>,
}

impl<T: Value + Eq + Hash> MutSet<T> {
    /// Create an empty set.
    pub fn new() -> Result<Self, TrellisError> {
        Self::with_items(std::iter::empty())
    }

    /// Create a set holding `items`.
    pub fn with_items(items: impl IntoIterator<Item = T>) -> Result<Self, TrellisError> {
        let initial: HashSet<T> = items.into_iter().collect();
        let added: Cell<HashSet<T>> = Cell::todo(HashSet::new);
        let removed: Cell<HashSet<T>> = Cell::todo(HashSet::new);

        let backref: std::rc::Rc<std::cell::RefCell<Option<Cell<HashSet<T>>>>> =
            std::rc::Rc::new(std::cell::RefCell::new(None));
        let data = {
            let (added, removed) = (added.clone(), removed.clone());
            let backref = backref.clone();
            let first = initial.clone();
            Cell::maintained(
                move || {
                    // Self-read: the previous sweep's contents.
                    let mut set = backref.borrow().as_ref().map_or_else(|| first.clone(), Cell::get);
                    for item in removed.get() {
                        set.remove(&item);
                    }
                    for item in added.get() {
                        set.insert(item);
                    }
                    set
                },
                initial,
            )?
        };
        *backref.borrow_mut() = Some(data.clone());

        Ok(Self {
            data,
            added,
            removed,
        })
    }

    /// Schedule `item` for insertion at the next sweep.
    pub fn insert(&self, item: T) -> Result<(), TrellisError> {
        let this = self.clone();
        modify(move || {
            if !this.data.get().contains(&item) {
                this.added.future_mut(|s| {
                    s.insert(item.clone());
                })?;
            }
            // Cancel any pending removal of the same item.
            this.removed.future_mut(|s| {
                s.remove(&item);
            })
        })
    }

    /// Schedule `item` for removal at the next sweep.
    pub fn remove(&self, item: &T) -> Result<(), TrellisError> {
        let this = self.clone();
        let item = item.clone();
        modify(move || {
            if this.data.get().contains(&item) {
                this.removed.future_mut(|s| {
                    s.insert(item.clone());
                })?;
            }
            this.added.future_mut(|s| {
                s.remove(&item);
            })
        })
    }

    /// A set can't hand out an arbitrary element and remove it in the same
    /// operation; read, then remove.
    pub fn pop(&self) -> Result<T, TrellisError> {
        Err(TrellisError::Conflict {
            first: "read".to_owned(),
            second: "Can't read and write in the same operation".to_owned(),
        })
    }

    /// Whether the set currently contains `item`.
    pub fn contains(&self, item: &T) -> bool {
        self.data.get().contains(item)
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.data.get().len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.data.get().is_empty()
    }

    /// Snapshot of the current contents.
    pub fn to_set(&self) -> HashSet<T> {
        self.data.get()
    }

    /// The visible data cell.
    pub fn cell(&self) -> &Cell<HashSet<T>> {
        &self.data
    }

    /// Discrete cell holding the items added in the latest sweep.
    pub fn added(&self) -> &Cell<HashSet<T>> {
        &self.added
    }

    /// Discrete cell holding the items removed in the latest sweep.
    pub fn removed(&self) -> &Cell<HashSet<T>> {
        &self.removed
    }
}

impl<T: Value + Eq + Hash> Clone for MutSet<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            added: self.added.clone(),
            removed: self.removed.clone(),
        }
    }
}

impl<T: Value + Eq + Hash> std::fmt::Debug for MutSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MutSet({:?})", self.data.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Observer;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn insert_and_remove_update_the_visible_state() {
        let set = MutSet::new().unwrap();
        set.insert(1).unwrap();
        set.insert(2).unwrap();
        assert!(set.contains(&1));
        assert!(set.contains(&2));
        assert_eq!(set.len(), 2);

        set.remove(&1).unwrap();
        assert!(!set.contains(&1));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn added_and_removed_expose_per_sweep_deltas() {
        let set = MutSet::with_items([1, 2, 3]).unwrap();
        let deltas = Rc::new(RefCell::new(Vec::new()));
        let _obs = {
            let (set, deltas) = (set.clone(), deltas.clone());
            Observer::new(move || {
                let added = set.added().get();
                let removed = set.removed().get();
                if !added.is_empty() || !removed.is_empty() {
                    let mut a: Vec<i32> = added.into_iter().collect();
                    let mut r: Vec<i32> = removed.into_iter().collect();
                    a.sort_unstable();
                    r.sort_unstable();
                    deltas.borrow_mut().push((a, r));
                }
            })
            .unwrap()
        };

        set.insert(4).unwrap();
        set.remove(&2).unwrap();
        assert_eq!(
            *deltas.borrow(),
            vec![(vec![4], vec![]), (vec![], vec![2])]
        );
        // The delta cells settled back to empty.
        assert!(set.added().get().is_empty());
        assert!(set.removed().get().is_empty());
    }

    #[test]
    fn inserting_a_present_item_is_silent() {
        let set = MutSet::with_items([1]).unwrap();
        let fires = Rc::new(std::cell::Cell::new(0));
        let _obs = {
            let (set, fires) = (set.clone(), fires.clone());
            Observer::new(move || {
                let _ = set.cell().get();
                fires.set(fires.get() + 1);
            })
            .unwrap()
        };
        assert_eq!(fires.get(), 1);

        set.insert(1).unwrap();
        // No visible change, no refire.
        assert_eq!(fires.get(), 1);
    }

    #[test]
    fn insert_then_remove_in_one_modifier_cancels_out() {
        let set: MutSet<i32> = MutSet::new().unwrap();
        let s = set.clone();
        modify(move || {
            s.insert(9)?;
            s.remove(&9)
        })
        .unwrap();
        assert!(!set.contains(&9));
    }

    #[test]
    fn pop_is_rejected() {
        let set = MutSet::with_items([1]).unwrap();
        let err = set.pop().unwrap_err();
        assert!(matches!(err, TrellisError::Conflict { .. }));
    }
}
