//! Fire-and-forget pipe.

use crate::error::TrellisError;
use crate::reactive::{modify, Cell, Value};

/// A one-sweep buffer.
///
/// Values sent into the pipe are visible to rules for exactly one sweep,
/// then vanish. Useful for feeding streams of events (keystrokes, network
/// chunks) into discrete processing rules.
pub struct Pipe<T: Value> {
    buffer: Cell<Vec<T>>,
}

impl<T: Value> Pipe<T> {
    /// Create an empty pipe.
    pub fn new() -> Self {
        Self {
            buffer: Cell::todo(Vec::new),
        }
    }

    /// Send one value into the next sweep.
    pub fn send(&self, item: T) -> Result<(), TrellisError> {
        let this = self.clone();
        modify(move || this.buffer.future_mut(|buf| buf.push(item.clone())))
    }

    /// Send several values into the next sweep.
    pub fn send_all(&self, items: impl IntoIterator<Item = T>) -> Result<(), TrellisError> {
        let items: Vec<T> = items.into_iter().collect();
        let this = self.clone();
        modify(move || this.buffer.future_mut(|buf| buf.extend(items.iter().cloned())))
    }

    /// This sweep's contents. Empty outside a delivery sweep.
    pub fn items(&self) -> Vec<T> {
        self.buffer.get()
    }

    /// The underlying discrete cell, for rules and observers.
    pub fn cell(&self) -> &Cell<Vec<T>> {
        &self.buffer
    }
}

impl<T: Value> Default for Pipe<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Value> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
        }
    }
}

impl<T: Value> std::fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pipe({:?})", self.buffer.get())
    }
}
