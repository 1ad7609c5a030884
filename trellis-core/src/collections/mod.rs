//! Observable containers.
//!
//! Each container pairs a visible data cell with discrete delta cells. A
//! mutation (always a modifier: atomic, buffered) lands in the delta cells'
//! future values; at the next sweep the data cell's rule folds the deltas
//! into a fresh copy of the container, rules depending on the data re-run,
//! and the delta cells expose the sweep's changes to observers before
//! resetting to empty.
//!
//! Copy-on-write keeps the STM contract simple: the only undo action for a
//! data change is swapping the previous container value back, which the
//! cell kernel already records.
//!
//! Operations that would have to observe their own write in the same moment
//! (`pop` and friends) are rejected with a conflict; read first, then
//! mutate.

mod map;
mod pipe;
mod seq;
mod set;
mod sorted;

pub use map::MutMap;
pub use pipe::Pipe;
pub use seq::{MutSeq, SeqChange};
pub use set::MutSet;
pub use sorted::{SeqRegion, SortedSeq};
