//! Cooperative tasks.
//!
//! A task is an explicit state machine stepped by the engine: each step
//! runs inside an observer-layer rule, reads whatever cells it needs, and
//! returns what to do next. Pausing suspends the task until the next sweep
//! in which one of the cells read by its latest step changes. Steps can
//! push sub-tasks, which run to completion before the parent resumes.
//!
//! A step that pauses without having read any cell never wakes up; read
//! the cell you are waiting on before pausing.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::TrellisError;
use crate::reactive::{Cell, Observer};

/// What a task decided at the end of one step.
pub enum Step {
    /// Suspend until a cell read during this step changes.
    Pause,
    /// Run a sub-task to completion, then resume this task.
    Call(Box<dyn TaskFn>),
    /// This task (or sub-task) is finished.
    Done,
}

/// A resumable unit of work.
///
/// Implemented for any `FnMut() -> Step` closure; implement the trait
/// directly for state machines with named states.
pub trait TaskFn {
    /// Perform one step.
    fn step(&mut self) -> Step;
}

impl<F: FnMut() -> Step> TaskFn for F {
    fn step(&mut self) -> Step {
        self()
    }
}

/// Handle to a spawned task.
pub struct TaskHandle {
    finished: Cell<bool>,
    observer: Observer,
}

impl TaskHandle {
    /// Whether the task ran to completion. Readable from rules.
    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    /// The cell that flips to true when the task completes.
    pub fn finished(&self) -> &Cell<bool> {
        &self.finished
    }

    /// Stop the task permanently, whether or not it completed.
    pub fn cancel(&self) {
        self.observer.dispose();
    }
}

/// Start a task. The first step runs immediately.
pub fn spawn(task: impl TaskFn + 'static) -> Result<TaskHandle, TrellisError> {
    let stack: Rc<RefCell<Vec<Box<dyn TaskFn>>>> = Rc::new(RefCell::new(vec![Box::new(task)]));
    let finished = Cell::new(false);

    let observer = {
        let stack = Rc::clone(&stack);
        let finished = finished.clone();
        Observer::new(move || {
            loop {
                let Some(mut top) = stack.borrow_mut().pop() else {
                    return;
                };
                match top.step() {
                    Step::Pause => {
                        stack.borrow_mut().push(top);
                        return;
                    }
                    Step::Call(sub) => {
                        let mut stack = stack.borrow_mut();
                        stack.push(top);
                        stack.push(sub);
                    }
                    Step::Done => {
                        if stack.borrow().is_empty() {
                            // Deferred like any in-rule write; lands next
                            // sweep.
                            finished.set(true).expect("finished flag accepts writes");
                            return;
                        }
                    }
                }
            }
        })?
    };

    Ok(TaskHandle { finished, observer })
}
