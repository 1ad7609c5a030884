//! Sorted view over an observable set.

use std::collections::HashSet;
use std::hash::Hash;
use std::rc::Rc;

use crate::error::TrellisError;
use crate::reactive::{Cell, Value};

use super::set::MutSet;

/// One contiguous edit to the sorted order.
///
/// `start..end` names the rows that were replaced; `inserted` is how many
/// rows now occupy that span. A deletion is `inserted == 0`; a pure
/// insertion has `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SeqRegion {
    /// First affected row.
    pub start: usize,
    /// One past the last replaced row (in pre-edit coordinates).
    pub end: usize,
    /// Number of rows inserted at `start`.
    pub inserted: usize,
}

#[derive(Clone, PartialEq, Debug)]
struct SortedState<K, T> {
    items: Vec<(K, T)>,
    changes: Vec<SeqRegion>,
}

/// A set presented as a list sorted by a key function.
///
/// The view maintains itself incrementally from the set's per-sweep
/// `added`/`removed` deltas, and exposes a discrete
/// [`changes`](SortedSeq::changes) cell describing each sweep's edits as
/// row regions, suitable for driving list widgets.
///
/// Rows are ordered by `(key, item)`: items sharing a key fall back to the
/// item's own ordering, so the sequence and its change regions are fully
/// deterministic regardless of the backing set's iteration order.
pub struct SortedSeq<T, K>
where
    T: Value + Ord + Hash,
    K: Value + Ord,
{
    state: Cell<SortedState<K, T>>,
    changes: Cell<Vec<SeqRegion>>,
}

impl<T, K> SortedSeq<T, K>
where
    T: Value + Ord + Hash,
    K: Value + Ord,
{
    /// Create a sorted view of `set`, ordered by `key`.
    pub fn new(set: &MutSet<T>, key: impl Fn(&T) -> K + 'static) -> Result<Self, TrellisError> {
        let key: Rc<dyn Fn(&T) -> K> = Rc::new(key);
        let backref: Rc<std::cell::RefCell<Option<Cell<SortedState<K, T>>>>> =
            Rc::new(std::cell::RefCell::new(None));

        let state = {
            let set = set.clone();
            let key = Rc::clone(&key);
            let backref = Rc::clone(&backref);
            Cell::maintained(
                move || match backref.borrow().as_ref() {
                    // First run: build from scratch, reading the whole set.
                    None => full_build(&set, key.as_ref()),
                    Some(me) => {
                        let mut state = me.get();
                        state.changes = apply_deltas(
                            &mut state.items,
                            key.as_ref(),
                            set.added().get(),
                            set.removed().get(),
                        );
                        state
                    }
                },
                SortedState {
                    items: Vec::new(),
                    changes: Vec::new(),
                },
            )?
        };
        *backref.borrow_mut() = Some(state.clone());

        let changes = {
            let state = state.clone();
            Cell::discrete(move || state.get().changes, Vec::new())
        };

        Ok(Self { state, changes })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.state.get().items.len()
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.state.get().items.is_empty()
    }

    /// The item at row `at`, if any.
    pub fn get(&self, at: usize) -> Option<T> {
        self.state.get().items.get(at).map(|(_, item)| item.clone())
    }

    /// Snapshot of the rows in sorted order.
    pub fn to_vec(&self) -> Vec<T> {
        self.state
            .get()
            .items
            .into_iter()
            .map(|(_, item)| item)
            .collect()
    }

    /// Discrete cell holding the latest sweep's row edits.
    pub fn changes(&self) -> &Cell<Vec<SeqRegion>> {
        &self.changes
    }
}

impl<T, K> std::fmt::Debug for SortedSeq<T, K>
where
    T: Value + Ord + Hash,
    K: Value + Ord,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SortedSeq({:?})", self.to_vec())
    }
}

fn full_build<T, K>(set: &MutSet<T>, key: &dyn Fn(&T) -> K) -> SortedState<K, T>
where
    T: Value + Ord + Hash,
    K: Value + Ord,
{
    let mut items: Vec<(K, T)> = set
        .cell()
        .get()
        .into_iter()
        .map(|item| (key(&item), item))
        .collect();
    items.sort();
    let size = items.len();
    SortedState {
        items,
        changes: vec![SeqRegion {
            start: 0,
            end: size,
            inserted: size,
        }],
    }
}

/// Fold one sweep's set deltas into the sorted rows, returning the edit
/// regions. Edits are ordered by the full `(key, item)` pair and applied
/// from the highest pair down, so earlier edits never shift the rows later
/// ones target and equal-key rows keep their deterministic relative order.
fn apply_deltas<T, K>(
    items: &mut Vec<(K, T)>,
    key: &dyn Fn(&T) -> K,
    added: HashSet<T>,
    removed: HashSet<T>,
) -> Vec<SeqRegion>
where
    T: Value + Ord + Hash,
    K: Value + Ord,
{
    let mut edits: Vec<(K, bool, T)> = removed
        .into_iter()
        .map(|item| (key(&item), true, item))
        .chain(added.into_iter().map(|item| (key(&item), false, item)))
        .collect();
    edits.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then(a.1.cmp(&b.1))
            .then_with(|| a.2.cmp(&b.2))
    });
    edits.reverse();

    let lo = 0usize;
    let mut hi = items.len();
    let mut regions: Vec<SeqRegion> = Vec::new();

    for (k, is_removal, item) in edits {
        // Leftmost row whose (key, item) pair is not below the edit's pair.
        let pos_at = lo
            + items[lo..hi].partition_point(|(ik, it)| match ik.cmp(&k) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => *it < item,
                std::cmp::Ordering::Greater => false,
            });
        let pos = if is_removal {
            if pos_at >= hi || items[pos_at].0 != k || items[pos_at].1 != item {
                continue;
            }
            items.remove(pos_at);
            match regions.last_mut() {
                Some(last) if last.start == pos_at + 1 => last.start = pos_at,
                _ => regions.push(SeqRegion {
                    start: pos_at,
                    end: pos_at + 1,
                    inserted: 0,
                }),
            }
            pos_at
        } else {
            items.insert(pos_at, (k, item));
            match regions.last_mut() {
                Some(last) if last.start == pos_at => last.inserted += 1,
                _ => regions.push(SeqRegion {
                    start: pos_at,
                    end: pos_at,
                    inserted: 1,
                }),
            }
            pos_at
        };
        hi = pos;
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Observer;
    use std::cell::RefCell;

    #[test]
    fn rows_stay_sorted_through_mutations() {
        let set = MutSet::with_items([3, 1, 2]).unwrap();
        let view = SortedSeq::new(&set, |v: &i32| *v).unwrap();
        assert_eq!(view.to_vec(), vec![1, 2, 3]);

        set.insert(0).unwrap();
        assert_eq!(view.to_vec(), vec![0, 1, 2, 3]);

        set.remove(&2).unwrap();
        assert_eq!(view.to_vec(), vec![0, 1, 3]);
        assert_eq!(view.get(2), Some(3));
        assert_eq!(view.len(), 3);
    }

    #[test]
    fn key_function_orders_the_rows() {
        let set = MutSet::with_items(["ccc".to_owned(), "a".to_owned(), "bb".to_owned()]).unwrap();
        let view = SortedSeq::new(&set, |s: &String| s.len()).unwrap();
        assert_eq!(
            view.to_vec(),
            vec!["a".to_owned(), "bb".to_owned(), "ccc".to_owned()]
        );
    }

    #[test]
    fn equal_keys_order_deterministically_by_item() {
        // Every item shares the key, so the row order rests entirely on
        // the item tie-break, not on set iteration order.
        let set = MutSet::with_items(["bb".to_owned(), "aa".to_owned(), "cc".to_owned()]).unwrap();
        let view = SortedSeq::new(&set, |s: &String| s.len()).unwrap();
        assert_eq!(
            view.to_vec(),
            vec!["aa".to_owned(), "bb".to_owned(), "cc".to_owned()]
        );

        set.insert("ab".to_owned()).unwrap();
        assert_eq!(
            view.to_vec(),
            vec![
                "aa".to_owned(),
                "ab".to_owned(),
                "bb".to_owned(),
                "cc".to_owned()
            ]
        );

        set.remove(&"bb".to_owned()).unwrap();
        assert_eq!(
            view.to_vec(),
            vec!["aa".to_owned(), "ab".to_owned(), "cc".to_owned()]
        );
    }

    #[test]
    fn changes_report_row_regions() {
        let set = MutSet::with_items([10, 20, 30]).unwrap();
        let view = Rc::new(SortedSeq::new(&set, |v: &i32| *v).unwrap());
        let regions = Rc::new(RefCell::new(Vec::new()));
        let _obs = {
            let (view, regions) = (Rc::clone(&view), regions.clone());
            Observer::new(move || {
                let edits = view.changes().get();
                if !edits.is_empty() {
                    regions.borrow_mut().push(edits);
                }
            })
            .unwrap()
        };
        // The initial build reports one full-span region.
        assert_eq!(
            *regions.borrow(),
            vec![vec![SeqRegion {
                start: 0,
                end: 3,
                inserted: 3
            }]]
        );
        regions.borrow_mut().clear();

        // Inserting 15 lands between 10 and 20: row 1.
        set.insert(15).unwrap();
        assert_eq!(
            *regions.borrow(),
            vec![vec![SeqRegion {
                start: 1,
                end: 1,
                inserted: 1
            }]]
        );
        regions.borrow_mut().clear();

        // Removing 30 deletes what is now row 3.
        set.remove(&30).unwrap();
        assert_eq!(
            *regions.borrow(),
            vec![vec![SeqRegion {
                start: 3,
                end: 4,
                inserted: 0
            }]]
        );
    }
}
