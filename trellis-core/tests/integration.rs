//! Integration tests for the reactive engine.
//!
//! These tests drive the public surface end to end: cells, components,
//! observers, discrete resets, deferred writes, and the transactional
//! machinery underneath them.

use std::cell::RefCell;
use std::rc::Rc;

use trellis_core::component::{ClassBuilder, Component};
use trellis_core::{
    atomically, log_set, mark_dirty, modify, poll, repeat, rollback_to, savepoint, Cell, Observer,
    TrellisError,
};

/// Two mutually maintained cells converge after a write to either side,
/// and an observer of both fires exactly once per external write.
#[test]
fn temperature_converter() {
    let class = ClassBuilder::new()
        .maintain("F", |c: &Component| c.read::<f64>("C") * 1.8 + 32.0, 32.0)
        .maintain("C", |c: &Component| (c.read::<f64>("F") - 32.0) / 1.8, 0.0)
        .build();
    let tc = Component::build(&class).create().unwrap();

    assert_eq!(tc.get::<f64>("F").unwrap(), 32.0);
    assert_eq!(tc.get::<f64>("C").unwrap(), 0.0);

    let fires = Rc::new(std::cell::Cell::new(0));
    let _obs = {
        let (tc, fires) = (Rc::clone(&tc), fires.clone());
        Observer::new(move || {
            let _ = (tc.read::<f64>("F"), tc.read::<f64>("C"));
            fires.set(fires.get() + 1);
        })
        .unwrap()
    };
    assert_eq!(fires.get(), 1);

    tc.set("C", 100.0).unwrap();
    assert_eq!(tc.get::<f64>("F").unwrap(), 212.0);
    assert_eq!(fires.get(), 2);

    tc.set("F", -40.0).unwrap();
    assert_eq!(tc.get::<f64>("C").unwrap(), -40.0);
    assert_eq!(fires.get(), 3);
}

/// A diamond-with-a-tail dependency graph recomputes in ascending layer
/// order, so no rule ever sees a half-updated pair.
#[test]
fn layered_diamond_recomputes_in_order() {
    let order = Rc::new(RefCell::new(Vec::new()));

    let x = Cell::new(1);
    let b = {
        let (x, order) = (x.clone(), order.clone());
        Cell::computed(move || {
            order.borrow_mut().push("B");
            x.get()
        })
    };
    let c = {
        let (b, x, order) = (b.clone(), x.clone(), order.clone());
        Cell::computed(move || {
            order.borrow_mut().push("C");
            (b.get(), x.get())
        })
    };
    let a = {
        let (x, c, order) = (x.clone(), c.clone(), order.clone());
        Cell::computed(move || {
            order.borrow_mut().push("A");
            (x.get(), c.get())
        })
    };
    let h = {
        let (x, c, order) = (x.clone(), c.clone(), order.clone());
        Cell::computed(move || {
            order.borrow_mut().push("H");
            (x.get(), c.get())
        })
    };

    // Reading H then A establishes the layering.
    assert_eq!(h.get(), (1, (1, 1)));
    assert_eq!(a.get(), (1, (1, 1)));
    assert_eq!(x.layer(), 0);
    assert_eq!(b.layer(), 1);
    assert_eq!(c.layer(), 2);
    assert_eq!(a.layer(), 3);
    assert_eq!(h.layer(), 3);

    order.borrow_mut().clear();
    x.set(2).unwrap();

    assert_eq!(h.get(), (2, (2, 2)));
    assert_eq!(a.get(), (2, (2, 2)));
    // Producers strictly before consumers, A before H at the top layer.
    assert_eq!(*order.borrow(), vec!["B", "C", "A", "H"]);
}

/// A line receiver built from a resetting byte feed, a buffer written by
/// deferred writes, and a discrete line cell that uses `repeat()` to emit
/// several lines from one chunk.
#[test]
fn line_receiver_splits_chunks_into_lines() {
    fn build() -> (Cell<String>, Cell<String>, Rc<RefCell<Vec<String>>>, Observer) {
        let bytes = Cell::resetting(String::new());
        let buffer = Cell::new(String::new());
        let line: Cell<Option<String>> = {
            let (bytes, buffer) = (bytes.clone(), buffer.clone());
            Cell::discrete(
                move || {
                    let mut pending = buffer.get();
                    pending.push_str(&bytes.get());
                    let out = match pending.find("\r\n") {
                        Some(at) => {
                            let found = pending[..at].to_string();
                            pending = pending[at + 2..].to_string();
                            if pending.contains("\r\n") {
                                repeat();
                            }
                            Some(found)
                        }
                        None => None,
                    };
                    let _ = buffer.set(pending);
                    out
                },
                None,
            )
        };
        let lines = Rc::new(RefCell::new(Vec::new()));
        let obs = {
            let (line, lines) = (line.clone(), lines.clone());
            Observer::new(move || {
                if let Some(l) = line.get() {
                    lines.borrow_mut().push(l);
                }
            })
            .unwrap()
        };
        (bytes, buffer, lines, obs)
    }

    // Delimiter arriving byte by byte yields exactly one line.
    let (bytes, buffer, lines, _obs) = build();
    bytes.set("xyz".to_string()).unwrap();
    bytes.set("\r".to_string()).unwrap();
    bytes.set("\n".to_string()).unwrap();
    assert_eq!(*lines.borrow(), vec!["xyz".to_string()]);
    assert_eq!(buffer.get(), "");

    // One chunk with two delimiters yields both lines and keeps the tail.
    let (bytes, buffer, lines, _obs) = build();
    bytes.set("abc\r\nghi\r\nmno".to_string()).unwrap();
    assert_eq!(
        *lines.borrow(),
        vec!["abc".to_string(), "ghi".to_string()]
    );
    assert_eq!(buffer.get(), "mno");
}

/// A discrete new-high signal fires for each value that beats the running
/// maximum and stays silent otherwise.
#[test]
fn new_high_detector() {
    let value = Cell::new(0);
    let last_max = Cell::new(0);
    let new_high: Cell<bool> = {
        let (value, last_max) = (value.clone(), last_max.clone());
        Cell::discrete(
            move || {
                let v = value.get();
                if v > last_max.get() {
                    let _ = last_max.set(v);
                    true
                } else {
                    false
                }
            },
            false,
        )
    };

    let highs = Rc::new(std::cell::Cell::new(0));
    let _obs = {
        let (new_high, highs) = (new_high.clone(), highs.clone());
        Observer::new(move || {
            if new_high.get() {
                highs.set(highs.get() + 1);
            }
        })
        .unwrap()
    };

    let mut fired = Vec::new();
    for input in [7, 9, 3, 16] {
        let before = highs.get();
        value.set(input).unwrap();
        fired.push(highs.get() > before);
        // Outside the sweep the discrete signal rests at its default.
        assert!(!new_high.get());
    }
    assert_eq!(fired, vec![true, true, false, true]);
}

/// Unequal writes to one cell within one modifier conflict, and the whole
/// section rolls back.
#[test]
fn conflicting_writes_roll_back_the_modifier() {
    let class = ClassBuilder::new().attr("left", 10).attr("top", 20).build();
    let r = Component::build(&class).create().unwrap();

    let err = {
        let r = Rc::clone(&r);
        modify(move || {
            r.set("left", 22)?;
            r.set("top", 55)?;
            r.set("left", 33)
        })
        .unwrap_err()
    };
    assert_eq!(err, TrellisError::conflict(&22, &33));

    // Every write in the failed section was undone, including the
    // non-conflicting one.
    assert_eq!(r.get::<i32>("left").unwrap(), 10);
    assert_eq!(r.get::<i32>("top").unwrap(), 20);
}

/// A noise filter whose rule reads its own previous value only passes
/// changes that clear the threshold.
#[test]
fn noise_filter_with_self_read() {
    let value = Cell::new(0);
    let threshold = Cell::new(5);
    let me: Rc<RefCell<Option<Cell<i32>>>> = Rc::new(RefCell::new(None));
    let filtered = {
        let (value, threshold, me) = (value.clone(), threshold.clone(), me.clone());
        Cell::maintained(
            move || {
                let v = value.get();
                let t = threshold.get();
                let prior = me.borrow().as_ref().map_or(0, Cell::get);
                if (v - prior).abs() > t {
                    v
                } else {
                    prior
                }
            },
            0,
        )
        .unwrap()
    };
    *me.borrow_mut() = Some(filtered.clone());

    let mut observed = Vec::new();
    for input in [1, 6, 2, 10] {
        value.set(input).unwrap();
        observed.push(filtered.get());
    }
    assert_eq!(observed, vec![0, 6, 6, 6]);

    // Lowering the threshold lets the pending value through.
    threshold.set(3).unwrap();
    assert_eq!(filtered.get(), 10);
}

/// `poll()` re-runs a rule on every sweep, even when nothing it reads
/// changed.
#[test]
fn polled_rules_rerun_every_sweep() {
    let a = Cell::new(0);
    let unrelated = Cell::new(100);
    let runs = Rc::new(std::cell::Cell::new(0));
    let watcher = {
        let (a, runs) = (a.clone(), runs.clone());
        Cell::computed(move || {
            poll();
            runs.set(runs.get() + 1);
            a.get()
        })
    };
    assert_eq!(watcher.get(), 0);
    assert_eq!(runs.get(), 1);

    // The watcher never reads `unrelated`, but polls.
    unrelated.set(5).unwrap();
    assert_eq!(runs.get(), 2);

    a.set(3).unwrap();
    assert_eq!(watcher.get(), 3);
    assert_eq!(runs.get(), 3);
}

/// `mark_dirty()` forces a change notification even when the recomputed
/// value compares equal.
#[test]
fn mark_dirty_forces_propagation() {
    let trigger = Cell::new(0);
    let constant_output = {
        let trigger = trigger.clone();
        Cell::computed(move || {
            mark_dirty();
            let _ = trigger.get();
            7
        })
    };
    let downstream_runs = Rc::new(std::cell::Cell::new(0));
    let downstream = {
        let (constant_output, downstream_runs) = (constant_output.clone(), downstream_runs.clone());
        Cell::computed(move || {
            downstream_runs.set(downstream_runs.get() + 1);
            constant_output.get()
        })
    };
    assert_eq!(downstream.get(), 7);
    assert_eq!(downstream_runs.get(), 1);

    trigger.set(1).unwrap();
    // The value is still 7, but the forced change propagated.
    assert_eq!(downstream_runs.get(), 2);
}

/// Savepoints rewind part of a section without aborting it.
#[test]
fn savepoints_partially_rewind_a_section() {
    let slot = Rc::new(RefCell::new(vec![1]));
    let s = slot.clone();
    atomically(move || {
        log_set(&s, vec![1, 2])?;
        let sp = savepoint()?;
        log_set(&s, vec![1, 2, 3])?;
        assert_eq!(*s.borrow(), vec![1, 2, 3]);

        rollback_to(sp)?;
        assert_eq!(*s.borrow(), vec![1, 2]);
        Ok(())
    })
    .unwrap();
    assert_eq!(*slot.borrow(), vec![1, 2]);
}

/// An error from user code anywhere in a section restores every cell that
/// the section had already changed.
#[test]
fn failed_sections_restore_cell_state() {
    let a = Cell::new(1);
    let b = Cell::new(2);

    let err = {
        let (a, b) = (a.clone(), b.clone());
        atomically(move || {
            a.set(10)?;
            b.set(20)?;
            Err::<(), _>(TrellisError::user("change of plans"))
        })
        .unwrap_err()
    };
    assert_eq!(err, TrellisError::user("change of plans"));
    assert_eq!(a.get(), 1);
    assert_eq!(b.get(), 2);
}
