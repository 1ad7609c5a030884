//! Callback-queue event loop.
//!
//! A minimal driver for programs whose only activity is reacting to cell
//! changes and timers: queue callbacks with [`EventLoop::call`], then
//! [`EventLoop::run`]. When the queue drains, the loop advances the clock
//! to the next scheduled moment; when neither callbacks nor timers remain,
//! it returns.
//!
//! `running` and `stop_requested` are ordinary cells, so rules can watch
//! the loop's state like any other input.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::activity::time::Clock;
use crate::error::TrellisError;
use crate::reactive::Cell;

type Callback = Box<dyn FnOnce() -> Result<(), TrellisError>>;

/// Run queued callbacks and pump the clock.
pub struct EventLoop {
    running: Cell<bool>,
    stop_requested: Cell<bool>,
    queue: Rc<RefCell<VecDeque<Callback>>>,
}

impl EventLoop {
    /// Create an idle loop.
    pub fn new() -> Self {
        Self {
            running: Cell::new(false),
            stop_requested: Cell::new(false),
            queue: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Queue `f` to run at the next opportunity.
    pub fn call(&self, f: impl FnOnce() -> Result<(), TrellisError> + 'static) {
        self.queue.borrow_mut().push_back(Box::new(f));
    }

    /// Cell holding whether the loop is currently running.
    pub fn running(&self) -> &Cell<bool> {
        &self.running
    }

    /// Drain callbacks, advancing the clock between batches, until nothing
    /// remains or [`EventLoop::stop`] is requested.
    pub fn run(&self) -> Result<(), TrellisError> {
        if self.running.get() {
            return Err(TrellisError::InvalidOperation(
                "event loop is already running",
            ));
        }
        self.stop_requested.set(false)?;
        self.running.set(true)?;
        let result = self.run_inner();
        self.running.set(false)?;
        self.stop_requested.set(false)?;
        result
    }

    fn run_inner(&self) -> Result<(), TrellisError> {
        let clock = Clock::service();
        loop {
            if self.stop_requested.get() {
                return Ok(());
            }
            let job = self.queue.borrow_mut().pop_front();
            match job {
                Some(f) => f()?,
                None => match clock.next_event_time(true) {
                    Some(delay) => clock.advance(delay.max(0.0))?,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Ask a running loop to stop at the next opportunity.
    pub fn stop(&self) -> Result<(), TrellisError> {
        if !self.running.get() {
            return Err(TrellisError::InvalidOperation(
                "event loop is not running",
            ));
        }
        self.stop_requested.set(true)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
