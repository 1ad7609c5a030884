//! Error types for the trellis engine.
//!
//! All fallible operations in the crate report a [`TrellisError`]. The set of
//! kinds is closed: the scheduler relies on exhaustive matching to decide
//! whether a failure aborts the enclosing atomic section (all of them do) and
//! how it should be reported.

use std::fmt::Debug;

use thiserror::Error;

/// Error type for engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrellisError {
    /// Two mutually inconsistent writes landed on one cell within a single
    /// sweep, or a cyclic rule failed to converge within the recalculation
    /// budget.
    #[error("conflicting values: {first} vs. {second}")]
    Conflict {
        /// Rendering of the value that was written first.
        first: String,
        /// Rendering of the value that arrived second.
        second: String,
    },

    /// A write targeted a cell that does not accept writes: a constant, or a
    /// rule-backed cell without a writable override.
    #[error("cell is read-only: {0}")]
    ReadOnly(&'static str),

    /// An API was called from a context where it is meaningless, such as
    /// `repeat()` outside a rule or a future view outside a modifier.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// An error returned by user code from inside an atomic section. The
    /// section is rolled back before this propagates.
    #[error("{0}")]
    User(String),
}

impl TrellisError {
    /// Build a [`TrellisError::Conflict`] from the two offending values.
    pub fn conflict(first: &impl Debug, second: &impl Debug) -> Self {
        Self::Conflict {
            first: format!("{first:?}"),
            second: format!("{second:?}"),
        }
    }

    /// Build a [`TrellisError::User`] from anything displayable.
    pub fn user(msg: impl Into<String>) -> Self {
        Self::User(msg.into())
    }
}
