//! Reactive engine core.
//!
//! This module implements the cell graph and its scheduler: the machinery
//! that turns writes into glitch-free, transactional recalculation sweeps.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A [`Cell`] holds a value, and optionally a rule that computes the value.
//! Rules discover their inputs by reading other cells; those reads become
//! subscriptions, so no dependency ever has to be declared by hand.
//!
//! ## Sweeps
//!
//! Writes are buffered and applied in discrete sweeps. Within a sweep,
//! rules re-run in ascending layer order (producers strictly before
//! consumers), each at most once unless a cycle or an explicit `repeat()`
//! demands another pass. Observers fire last, then discrete cells snap back
//! to their defaults.
//!
//! ## Atomic sections
//!
//! Every sweep runs inside an atomic section backed by an undo log. If
//! anything fails, the whole section rolls back and the error propagates to
//! the caller of [`atomically`].
//!
//! # Implementation Notes
//!
//! The engine is a thread-local singleton; cells belong to the thread that
//! created them. Dependency tracking uses a compute stack: reading a cell
//! while a rule runs links the cell to the rule, after the cell's own value
//! has settled. This design is shared with the transparent-reactivity
//! family of systems (SolidJS, Vue, Leptos) but adds the transactional
//! write buffer and the layered, glitch-free scheduler on top.

mod cell;
mod context;
mod link;
mod observer;
mod scheduler;
mod sensor;

pub use cell::{Cell, CellId, CellKind, Value};
pub use context::{
    atomically, current_cell, in_cleanup, in_rule, log_set, manage, mark_dirty, modifier, modify,
    on_undo, poll, repeat, rollback_to, savepoint, set_max_recalcs,
};
pub use observer::Observer;
pub use sensor::{Connector, Effector, Sensor, SensorInput};
