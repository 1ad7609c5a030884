//! Sensor and effector cells.
//!
//! A sensor bridges an external data source into the cell graph. The
//! source is attached lazily: its `connect` callback runs when the sensor
//! gains its first listener, and `disconnect` runs at the end of a section
//! in which it lost its last one. While connected, the source pushes values
//! through a [`SensorInput`], which buffers them exactly like an ordinary
//! input write (opening an implicit atomic section when needed).
//!
//! An effector adds a writable side: values written to it are forwarded to
//! an external sink before being committed to the cell.
//!
//! Connector callbacks run with dependency tracking suppressed, so they
//! never become subjects of the rule that happened to trigger them.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::TrellisError;
use crate::reactive::cell::{AnyCell, Cell, CellId, CellKind, CellShared, ResetPolicy, Value};
use crate::reactive::context::{self, engine};

/// External-source hooks for a sensor.
///
/// `connect` is handed a [`SensorInput`] and returns an opaque key;
/// `disconnect` receives that key back when the sensor loses its last
/// listener. `read` supplies the value the sensor holds before the source
/// has produced anything.
pub trait Connector<T: Value> {
    /// Attach the external source. Returns a key identifying the
    /// attachment.
    fn connect(&self, input: SensorInput<T>) -> u64;

    /// Detach the external source.
    fn disconnect(&self, key: u64);

    /// Initial reading.
    fn read(&self) -> T;
}

/// Write handle given to a sensor's external source.
///
/// Posting marshals the value into the engine on the engine's own thread;
/// external I/O must deliver values here from that thread.
pub struct SensorInput<T: Value> {
    shared: Weak<CellShared<T>>,
}

impl<T: Value> SensorInput<T> {
    /// Push a new reading into the cell graph. A no-op once the sensor has
    /// been dropped.
    pub fn post(&self, v: T) -> Result<(), TrellisError> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        context::atomically(move || shared.buffer_write(v))
    }
}

impl<T: Value> Clone for SensorInput<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

/// A cell fed by an external source.
pub struct Sensor<T: Value> {
    cell: Cell<T>,
}

impl<T: Value> Sensor<T> {
    /// Create a sensor backed by `connector`. Nothing is connected until
    /// the sensor acquires its first listener.
    pub fn new(connector: Rc<dyn Connector<T>>) -> Self {
        Self::build(connector, CellKind::Sensor, None)
    }

    fn build(
        connector: Rc<dyn Connector<T>>,
        kind: CellKind,
        sink: Option<Rc<dyn Fn(&T)>>,
    ) -> Self {
        let shared = CellShared::raw(
            kind,
            0,
            Some(connector.read()),
            None,
            ResetPolicy::None,
            false,
            false,
        );
        let key: Rc<RefCell<Option<u64>>> = Rc::new(RefCell::new(None));
        {
            let connector = Rc::clone(&connector);
            let key = Rc::clone(&key);
            let weak = Rc::downgrade(&shared);
            shared.set_attach_hook(Box::new(move || {
                let input = SensorInput {
                    shared: Weak::clone(&weak),
                };
                *key.borrow_mut() = Some(connector.connect(input));
            }));
        }
        {
            let connector = Rc::clone(&connector);
            shared.set_detach_hook(Box::new(move || {
                if let Some(k) = key.borrow_mut().take() {
                    connector.disconnect(k);
                }
            }));
        }
        if let Some(sink) = sink {
            shared.set_sink(sink);
        }
        engine().register_sensor(&(shared.clone() as Rc<dyn AnyCell>));
        Self {
            cell: Cell::from_shared(shared),
        }
    }

    /// Read the current value, subscribing the running rule if any.
    pub fn get(&self) -> T {
        self.cell.get()
    }

    /// The underlying cell handle.
    pub fn cell(&self) -> &Cell<T> {
        &self.cell
    }

    /// Stable identity of the underlying cell.
    pub fn id(&self) -> CellId {
        self.cell.id()
    }
}

impl<T: Value> Clone for Sensor<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

/// A sensor with a writable side.
///
/// Writes are forwarded to the external sink and then committed to the
/// cell like an ordinary input write, so rules depending on the effector
/// see what was sent.
pub struct Effector<T: Value> {
    sensor: Sensor<T>,
}

impl<T: Value> Effector<T> {
    /// Create an effector backed by `connector`, sending writes to `sink`.
    pub fn new(connector: Rc<dyn Connector<T>>, sink: impl Fn(&T) + 'static) -> Self {
        let sensor = Sensor::build(connector, CellKind::Effector, Some(Rc::new(sink)));
        Self { sensor }
    }

    /// Read the current value.
    pub fn get(&self) -> T {
        self.sensor.get()
    }

    /// Send a value to the external sink and commit it to the cell.
    pub fn set(&self, v: T) -> Result<(), TrellisError> {
        self.sensor.cell.set(v)
    }

    /// The underlying cell handle.
    pub fn cell(&self) -> &Cell<T> {
        self.sensor.cell()
    }
}

impl<T: Value> Clone for Effector<T> {
    fn clone(&self) -> Self {
        Self {
            sensor: self.sensor.clone(),
        }
    }
}
