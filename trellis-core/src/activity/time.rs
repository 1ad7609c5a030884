//! Simulated clock and timers.
//!
//! The clock holds the current time in seconds and a schedule of moments
//! that rules are waiting for. Asking whether a moment has been
//! [`reached`](Moment::reached) from inside a rule creates a timer cell and
//! subscribes the rule to it; advancing the clock past the moment flips the
//! cell, and the rule re-runs. Nothing here touches the wall clock unless
//! [`Clock::tick`] is called, which makes time fully controllable in tests.

use std::cell::RefCell;
use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::TrellisError;
use crate::reactive::{atomically, on_undo, Cell};

/// An instant in clock seconds.
///
/// Moments are values: copy them around, offset them, compare them. The
/// special [`NOT_YET`] moment is later than every real one.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Moment(f64);

/// The moment the clock starts at.
pub const EPOCH: Moment = Moment(0.0);

/// A moment that never arrives.
pub const NOT_YET: Moment = Moment(f64::INFINITY);

impl Moment {
    /// A moment `secs` later than this one. Offsetting [`NOT_YET`] stays
    /// [`NOT_YET`].
    pub fn offset(self, secs: f64) -> Self {
        if self.0.is_infinite() {
            self
        } else {
            Self(self.0 + secs)
        }
    }

    /// Seconds between two moments.
    pub fn seconds_since(self, earlier: Self) -> f64 {
        self.0 - earlier.0
    }

    /// Whether this thread's clock has passed this moment.
    ///
    /// Called inside a rule, this subscribes the rule so it re-runs when
    /// the moment arrives.
    pub fn reached(self) -> bool {
        Clock::service().reached(self)
    }

    /// Track when `flag` first became true: while the flag holds, the
    /// result is the earliest moment it was observed true; otherwise
    /// [`NOT_YET`].
    pub fn begins_with(self, flag: bool) -> Self {
        if !flag {
            return NOT_YET;
        }
        let now = Clock::service().now();
        if now < self {
            now
        } else {
            self
        }
    }
}

/// f64 key with a total order, for the schedule heap and the timer map.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TimeKey(f64);

impl Eq for TimeKey {}

impl PartialOrd for TimeKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

thread_local! {
    static CLOCK: Rc<Clock> = Rc::new(Clock::new());
}

/// This thread's clock service.
///
/// Like the engine itself, the clock is per thread: simulated time on one
/// thread never leaks into another.
pub struct Clock {
    now: std::cell::Cell<f64>,
    schedule: RefCell<BinaryHeap<Reverse<TimeKey>>>,
    timers: RefCell<HashMap<u64, Cell<bool>>>,
}

impl Clock {
    fn new() -> Self {
        Self {
            now: std::cell::Cell::new(0.0),
            schedule: RefCell::new(BinaryHeap::new()),
            timers: RefCell::new(HashMap::new()),
        }
    }

    /// Get this thread's clock.
    pub fn service() -> Rc<Self> {
        CLOCK.with(Rc::clone)
    }

    /// The current moment.
    pub fn now(&self) -> Moment {
        Moment(self.now.get())
    }

    /// A moment `secs` from now.
    pub fn timer(&self, secs: f64) -> Moment {
        Moment(self.now.get() + secs)
    }

    /// Whether `moment` has passed, creating and subscribing to a timer
    /// cell when it has not.
    pub fn reached(&self, moment: Moment) -> bool {
        if moment.0.is_infinite() {
            return false;
        }
        let key = moment.0.to_bits();
        let cell = {
            let timers = self.timers.borrow();
            timers.get(&key).cloned()
        };
        let cell = match cell {
            Some(cell) => cell,
            None => {
                if self.now.get() >= moment.0 {
                    return true;
                }
                let cell = Cell::new(false);
                self.schedule.borrow_mut().push(Reverse(TimeKey(moment.0)));
                self.timers.borrow_mut().insert(key, cell.clone());
                cell
            }
        };
        cell.get()
    }

    /// Move the clock forward by `secs`, firing due timers.
    pub fn advance(&self, secs: f64) -> Result<(), TrellisError> {
        self.set_time(self.now.get() + secs.max(0.0))
    }

    /// Jump the clock to the wall-clock time.
    pub fn tick(&self) -> Result<(), TrellisError> {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.set_time(wall.max(self.now.get()))
    }

    fn set_time(&self, to: f64) -> Result<(), TrellisError> {
        let clock = Self::service();
        atomically(move || {
            let from = clock.now.get();
            clock.now.set(to);
            {
                let undo = Rc::clone(&clock);
                on_undo(move || undo.now.set(from))?;
            }
            // Fire every timer whose moment has arrived.
            loop {
                let due = {
                    let mut schedule = clock.schedule.borrow_mut();
                    match schedule.peek() {
                        Some(Reverse(key)) if key.0 <= to => schedule.pop(),
                        _ => None,
                    }
                };
                let Some(Reverse(key)) = due else {
                    break;
                };
                if let Some(cell) = clock.timers.borrow_mut().remove(&key.0.to_bits()) {
                    cell.set(true)?;
                }
            }
            Ok(())
        })
    }

    /// The next scheduled moment, absolute, or `None` when nothing waits.
    /// With `relative` the result is in seconds from now.
    pub fn next_event_time(&self, relative: bool) -> Option<f64> {
        loop {
            let head = self.schedule.borrow().peek().map(|Reverse(k)| k.0);
            let when = head?;
            if !self.timers.borrow().contains_key(&when.to_bits()) {
                // Already fired; drop the stale heap entry.
                self.schedule.borrow_mut().pop();
                continue;
            }
            return Some(if relative { when - self.now.get() } else { when });
        }
    }
}
