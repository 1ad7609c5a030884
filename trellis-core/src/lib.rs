//! Trellis Core
//!
//! This crate provides a synchronous reactive computation engine: a
//! dependency-tracked cell graph with automatic, glitch-free, transactional
//! recalculation.
//!
//! It implements:
//!
//! - Reactive cells (values, computed rules, observers, discrete events)
//! - A software-transactional-memory substrate (undo, savepoints, scope
//!   managers)
//! - A layered recalculation scheduler with conflict detection
//! - Observable containers (map, sequence, set, pipe) built on the engine
//! - Declarative, cell-backed component attributes
//! - A simulated clock, an event loop, and cooperative tasks layered on the
//!   public cell surface
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: the engine core: cells, dependency tracking, sweeps
//! - `stm`: atomic sections, undo log, savepoints, scope managers
//! - `collections`: observable container types with per-sweep change logs
//! - `component`: name-keyed, cell-backed object attributes
//! - `activity`: clock, event loop, and task collaborators
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::{Cell, Observer};
//!
//! let celsius = Cell::new(0.0_f64);
//!
//! let fahrenheit = {
//!     let celsius = celsius.clone();
//!     Cell::computed(move || celsius.get() * 1.8 + 32.0)
//! };
//!
//! let _report = Observer::new({
//!     let fahrenheit = fahrenheit.clone();
//!     move || println!("{} F", fahrenheit.get())
//! })?;
//!
//! celsius.set(100.0)?;
//! // The observer fired exactly once and printed "212 F".
//! ```
//!
//! Cells are single-threaded: each OS thread gets an independent engine,
//! and nothing is shared between them.

pub mod activity;
pub mod collections;
pub mod component;
mod error;
pub mod reactive;
pub mod stm;

pub use error::TrellisError;
pub use reactive::{
    atomically, current_cell, in_cleanup, in_rule, log_set, manage, mark_dirty, modifier, modify,
    on_undo, poll, repeat, rollback_to, savepoint, set_max_recalcs, Cell, CellId, CellKind,
    Connector, Effector, Observer, Sensor, SensorInput, Value,
};
pub use stm::{Savepoint, ScopeManager};
