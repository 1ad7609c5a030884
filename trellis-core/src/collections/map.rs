//! Observable mapping.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::TrellisError;
use crate::reactive::{modify, Cell, Value};

/// A reactive key/value mapping.
///
/// Reads subscribe the running rule to the visible data; mutations buffer
/// into the next sweep. Three discrete delta cells describe each sweep:
/// [`added`](MutMap::added) holds new entries, [`changed`](MutMap::changed)
/// holds overwritten entries (new values), and [`deleted`](MutMap::deleted)
/// holds removed entries with the values they had.
pub struct MutMap<K, V>
where
    K: Value + Eq + Hash,
    V: Value,
{
    data: Cell<HashMap<K, V>>,
    added: Cell<HashMap<K, V>>,
    changed: Cell<HashMap<K, V>>,
    deleted: Cell<HashMap<K, V>>,
}

impl<K, V> MutMap<K, V>
where
    K: Value + Eq + Hash,
    V: Value,
{
    /// Create an empty map.
    pub fn new() -> Result<Self, TrellisError> {
        Self::with_entries(std::iter::empty())
    }

    /// Create a map holding `entries`.
    pub fn with_entries(entries: impl IntoIterator<Item = (K, V)>) -> Result<Self, TrellisError> {
        let initial: HashMap<K, V> = entries.into_iter().collect();
        let added: Cell<HashMap<K, V>> = Cell::todo(HashMap::new);
        let changed: Cell<HashMap<K, V>> = Cell::todo(HashMap::new);
        let deleted: Cell<HashMap<K, V>> = Cell::todo(HashMap::new);

        let backref: std::rc::Rc<std::cell::RefCell<Option<Cell<HashMap<K, V>>>>> =
            std::rc::Rc::new(std::cell::RefCell::new(None));
        let data = {
            let (added, changed, deleted) = (added.clone(), changed.clone(), deleted.clone());
            let backref = backref.clone();
            let first = initial.clone();
            Cell::maintained(
                move || {
                    let mut map = backref.borrow().as_ref().map_or_else(|| first.clone(), Cell::get);
                    for key in deleted.get().keys() {
                        map.remove(key);
                    }
                    for (key, value) in changed.get() {
                        map.insert(key, value);
                    }
                    for (key, value) in added.get() {
                        map.insert(key, value);
                    }
                    map
                },
                initial,
            )?
        };
        *backref.borrow_mut() = Some(data.clone());

        Ok(Self {
            data,
            added,
            changed,
            deleted,
        })
    }

    /// Schedule `key -> value` for the next sweep. A new key lands in
    /// `added`, an existing one in `changed`.
    pub fn insert(&self, key: K, value: V) -> Result<(), TrellisError> {
        let this = self.clone();
        modify(move || {
            this.deleted.future_mut(|d| {
                d.remove(&key);
            })?;
            if this.data.get().contains_key(&key) {
                this.changed.future_mut(|m| {
                    m.insert(key.clone(), value.clone());
                })
            } else {
                this.added.future_mut(|m| {
                    m.insert(key.clone(), value.clone());
                })
            }
        })
    }

    /// Schedule `key` for removal at the next sweep.
    pub fn remove(&self, key: &K) -> Result<(), TrellisError> {
        let this = self.clone();
        let key = key.clone();
        modify(move || {
            if let Some(old) = this.data.get().get(&key) {
                let old = old.clone();
                this.deleted.future_mut(|d| {
                    d.insert(key.clone(), old.clone());
                })?;
            }
            this.added.future_mut(|m| {
                m.remove(&key);
            })?;
            this.changed.future_mut(|m| {
                m.remove(&key);
            })
        })
    }

    /// Removing an entry and returning it would read and write in the same
    /// operation; look the value up first, then remove.
    pub fn pop(&self, _key: &K) -> Result<V, TrellisError> {
        Err(TrellisError::Conflict {
            first: "read".to_owned(),
            second: "Can't read and write in the same operation".to_owned(),
        })
    }

    /// `setdefault` would read and write in the same operation; check with
    /// [`get`](MutMap::get) first, then insert.
    pub fn set_default(&self, _key: K, _value: V) -> Result<V, TrellisError> {
        Err(TrellisError::Conflict {
            first: "read".to_owned(),
            second: "Can't read and write in the same operation".to_owned(),
        })
    }

    /// Look up a key in the visible state.
    pub fn get(&self, key: &K) -> Option<V> {
        self.data.get().get(key).cloned()
    }

    /// Whether the visible state contains `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.data.get().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.data.get().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.data.get().is_empty()
    }

    /// Snapshot of the current contents.
    pub fn to_map(&self) -> HashMap<K, V> {
        self.data.get()
    }

    /// The visible data cell.
    pub fn cell(&self) -> &Cell<HashMap<K, V>> {
        &self.data
    }

    /// Discrete cell holding the entries added in the latest sweep.
    pub fn added(&self) -> &Cell<HashMap<K, V>> {
        &self.added
    }

    /// Discrete cell holding the entries overwritten in the latest sweep,
    /// with their new values.
    pub fn changed(&self) -> &Cell<HashMap<K, V>> {
        &self.changed
    }

    /// Discrete cell holding the entries deleted in the latest sweep, with
    /// the values they had.
    pub fn deleted(&self) -> &Cell<HashMap<K, V>> {
        &self.deleted
    }
}

impl<K, V> Clone for MutMap<K, V>
where
    K: Value + Eq + Hash,
    V: Value,
{
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            added: self.added.clone(),
            changed: self.changed.clone(),
            deleted: self.deleted.clone(),
        }
    }
}

impl<K, V> std::fmt::Debug for MutMap<K, V>
where
    K: Value + Eq + Hash,
    V: Value,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MutMap({:?})", self.data.get())
    }
}
