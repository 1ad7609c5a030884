//! Declarative cell-backed attributes.
//!
//! A component is an object whose attributes are cells, declared once per
//! "class" and instantiated per object. Rules receive the component, read
//! other attributes by name, and the engine wires the dependencies up from
//! those reads like it does everywhere else.
//!
//! # How It Works
//!
//! 1. A [`ClassBuilder`] collects attribute declarations into a
//!    [`ComponentClass`]: plain values, computed rules, writable maintained
//!    rules, discrete todos, observers, and eager constants.
//!
//! 2. [`Component::build`] instantiates the class. Eager attributes
//!    (maintained rules, observers, constants) activate inside one atomic
//!    section at construction; optional attributes activate on first
//!    access. Constructor presets overwrite initial values, and a preset on
//!    a computed attribute freezes it into a constant.
//!
//! 3. Each instance carries a private cell cache keyed by attribute name.
//!    The cache owns the cells; rules hold only a weak reference back to
//!    the component, which breaks the component-to-cell-to-rule cycle.
//!
//! Subclassing replaces declarations by name; the parent's rule stays
//! reachable through [`ComponentClass::inherited_rule`], the by-name
//! analog of calling up to a superclass.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::error::TrellisError;
use crate::reactive::{atomically, Cell, Observer, Value};

/// A rule bound to a component.
pub type AttrRule<T> = Rc<dyn Fn(&Component) -> T>;

struct RuleHolder<T: Value>(AttrRule<T>);

/// What an attribute produced at activation, plus any follow-up work that
/// must run after the cache slot is filled.
struct BuiltAttr {
    handle: Rc<dyn Any>,
    after: Option<Box<dyn FnOnce() -> Result<(), TrellisError>>>,
}

type BuildFn = Rc<dyn Fn(&Rc<Component>, Option<Box<dyn Any>>) -> Result<BuiltAttr, TrellisError>>;

struct AttrSpec {
    eager: bool,
    build: BuildFn,
    rule: Option<Rc<dyn Any>>,
}

/// An immutable set of attribute declarations shared by its instances.
pub struct ComponentClass {
    parent: Option<Rc<ComponentClass>>,
    specs: HashMap<&'static str, AttrSpec>,
    order: Vec<&'static str>,
}

impl ComponentClass {
    fn spec(&self, name: &str) -> Option<&AttrSpec> {
        self.specs.get(name)
    }

    /// The rule declared for `name` in this class, if it has one.
    pub fn rule<T: Value>(&self, name: &str) -> Option<AttrRule<T>> {
        let holder = self.specs.get(name)?.rule.clone()?;
        let holder = holder.downcast::<RuleHolder<T>>().ok()?;
        Some(Rc::clone(&holder.0))
    }

    /// The rule a parent class declared for `name`. This is the by-name
    /// `super` lookup: a subclass rule can delegate to what it replaced.
    pub fn inherited_rule<T: Value>(&self, name: &str) -> Option<AttrRule<T>> {
        let parent = self.parent.as_ref()?;
        parent.rule(name).or_else(|| parent.inherited_rule(name))
    }
}

/// Builder for a [`ComponentClass`].
pub struct ClassBuilder {
    parent: Option<Rc<ComponentClass>>,
    specs: HashMap<&'static str, AttrSpec>,
    order: Vec<&'static str>,
}

impl ClassBuilder {
    /// Start a class from scratch.
    pub fn new() -> Self {
        Self {
            parent: None,
            specs: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Start a class that replaces `parent`'s declarations by name.
    pub fn extending(parent: &Rc<ComponentClass>) -> Self {
        let mut specs = HashMap::new();
        let mut order = Vec::new();
        for name in &parent.order {
            if let Some(spec) = parent.specs.get(name) {
                specs.insert(
                    *name,
                    AttrSpec {
                        eager: spec.eager,
                        build: Rc::clone(&spec.build),
                        rule: spec.rule.clone(),
                    },
                );
                order.push(*name);
            }
        }
        Self {
            parent: Some(Rc::clone(parent)),
            specs,
            order,
        }
    }

    fn define(mut self, name: &'static str, spec: AttrSpec) -> Self {
        if self.specs.insert(name, spec).is_none() {
            self.order.push(name);
        }
        self
    }

    /// An input value attribute. Optional; a preset replaces the default.
    pub fn attr<T: Value>(self, name: &'static str, default: T) -> Self {
        let build: BuildFn = Rc::new(move |_, preset| {
            let initial = match preset {
                Some(boxed) => take_preset::<T>(boxed)?,
                None => default.clone(),
            };
            Ok(BuiltAttr {
                handle: Rc::new(Cell::new(initial)),
                after: None,
            })
        });
        self.define(
            name,
            AttrSpec {
                eager: false,
                build,
                rule: None,
            },
        )
    }

    /// A discrete input attribute that settles back to `default` after
    /// every sweep. Optional; presets are not accepted.
    pub fn resetting<T: Value>(self, name: &'static str, default: T) -> Self {
        let build: BuildFn = Rc::new(move |_, preset| {
            if preset.is_some() {
                return Err(TrellisError::InvalidOperation(
                    "discrete attributes can't be preset",
                ));
            }
            Ok(BuiltAttr {
                handle: Rc::new(Cell::resetting(default.clone())),
                after: None,
            })
        });
        self.define(
            name,
            AttrSpec {
                eager: false,
                build,
                rule: None,
            },
        )
    }

    /// A read-only computed attribute. Optional. A preset freezes it into a
    /// constant instead of installing the rule.
    ///
    /// # Panics
    ///
    /// The installed rule holds only a weak reference to its component and
    /// panics if it recomputes after the component has been dropped; see
    /// [`Component::cell`] for the lifetime contract.
    pub fn compute<T: Value>(
        self,
        name: &'static str,
        rule: impl Fn(&Component) -> T + 'static,
    ) -> Self {
        let rule: AttrRule<T> = Rc::new(rule);
        let stored = Rc::clone(&rule);
        let build: BuildFn = Rc::new(move |comp, preset| {
            let handle: Rc<dyn Any> = match preset {
                Some(boxed) => Rc::new(Cell::constant(take_preset::<T>(boxed)?)),
                None => {
                    let rule = Rc::clone(&rule);
                    let weak = Rc::downgrade(comp);
                    Rc::new(Cell::computed(move || {
                        let comp = weak.upgrade().expect("component outlives its rules");
                        rule(&comp)
                    }))
                }
            };
            Ok(BuiltAttr {
                handle,
                after: None,
            })
        });
        self.define(
            name,
            AttrSpec {
                eager: false,
                build,
                rule: Some(Rc::new(RuleHolder(stored))),
            },
        )
    }

    /// A writable computed attribute, activated at construction. A write
    /// replaces the rule's result for a sweep; the rule sees prior values
    /// of itself through self-referential reads. A preset replaces the
    /// initial value.
    ///
    /// # Panics
    ///
    /// The installed rule panics if it recomputes after the component has
    /// been dropped; see [`Component::cell`] for the lifetime contract.
    pub fn maintain<T: Value>(
        self,
        name: &'static str,
        rule: impl Fn(&Component) -> T + 'static,
        initial: T,
    ) -> Self {
        let rule: AttrRule<T> = Rc::new(rule);
        let stored = Rc::clone(&rule);
        let build: BuildFn = Rc::new(move |comp, preset| {
            let initial = match preset {
                Some(boxed) => take_preset::<T>(boxed)?,
                None => initial.clone(),
            };
            let bound: Rc<dyn Fn() -> T> = {
                let rule = Rc::clone(&rule);
                let weak = Rc::downgrade(comp);
                Rc::new(move || {
                    let comp = weak.upgrade().expect("component outlives its rules");
                    rule(&comp)
                })
            };
            let cell = Cell::maintained_lazy(bound, initial);
            let kick = cell.clone();
            Ok(BuiltAttr {
                handle: Rc::new(cell),
                after: Some(Box::new(move || kick.ensure_recalc())),
            })
        });
        self.define(
            name,
            AttrSpec {
                eager: true,
                build,
                rule: Some(Rc::new(RuleHolder(stored))),
            },
        )
    }

    /// A discrete attribute whose upcoming value is produced fresh per
    /// sweep and mutated through future views. Optional.
    ///
    /// # Panics
    ///
    /// The default producer panics if it runs after the component has been
    /// dropped; see [`Component::cell`] for the lifetime contract.
    pub fn todo<T: Value>(
        self,
        name: &'static str,
        producer: impl Fn(&Component) -> T + 'static,
    ) -> Self {
        let producer: AttrRule<T> = Rc::new(producer);
        let stored = Rc::clone(&producer);
        let build: BuildFn = Rc::new(move |comp, preset| {
            if preset.is_some() {
                return Err(TrellisError::InvalidOperation(
                    "todo attributes can't be preset",
                ));
            }
            let producer = Rc::clone(&producer);
            let weak = Rc::downgrade(comp);
            let cell = Cell::todo(move || {
                let comp = weak.upgrade().expect("component outlives its rules");
                producer(&comp)
            });
            Ok(BuiltAttr {
                handle: Rc::new(cell),
                after: None,
            })
        });
        self.define(
            name,
            AttrSpec {
                eager: false,
                build,
                rule: Some(Rc::new(RuleHolder(stored))),
            },
        )
    }

    /// An observer attribute, activated at construction.
    ///
    /// An observer handle extracted with [`Component::observer`] may outlive
    /// the component; once the component is dropped the observer skips its
    /// rule, drops its subscriptions, and goes quiet instead of firing.
    pub fn observe(self, name: &'static str, rule: impl Fn(&Component) + 'static) -> Self {
        let rule: Rc<dyn Fn(&Component)> = Rc::new(rule);
        let build: BuildFn = Rc::new(move |comp, preset| {
            if preset.is_some() {
                return Err(TrellisError::InvalidOperation(
                    "observer attributes can't be preset",
                ));
            }
            let rule = Rc::clone(&rule);
            let weak = Rc::downgrade(comp);
            let observer = Observer::new(move || {
                if let Some(comp) = weak.upgrade() {
                    rule(&comp);
                }
            })?;
            Ok(BuiltAttr {
                handle: Rc::new(observer),
                after: None,
            })
        });
        self.define(
            name,
            AttrSpec {
                eager: true,
                build,
                rule: None,
            },
        )
    }

    /// An eagerly constructed constant attribute. The constructor runs once
    /// at activation; a preset replaces its result.
    pub fn make<T: Value>(
        self,
        name: &'static str,
        ctor: impl Fn(&Component) -> T + 'static,
    ) -> Self {
        let ctor: AttrRule<T> = Rc::new(ctor);
        let build: BuildFn = Rc::new(move |comp, preset| {
            let value = match preset {
                Some(boxed) => take_preset::<T>(boxed)?,
                None => ctor(comp),
            };
            Ok(BuiltAttr {
                handle: Rc::new(Cell::constant(value)),
                after: None,
            })
        });
        self.define(
            name,
            AttrSpec {
                eager: true,
                build,
                rule: None,
            },
        )
    }

    /// Finish the class.
    pub fn build(self) -> Rc<ComponentClass> {
        Rc::new(ComponentClass {
            parent: self.parent,
            specs: self.specs,
            order: self.order,
        })
    }
}

impl Default for ClassBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn take_preset<T: Value>(boxed: Box<dyn Any>) -> Result<T, TrellisError> {
    boxed
        .downcast::<T>()
        .map(|b| *b)
        .map_err(|_| TrellisError::InvalidOperation("preset type mismatch"))
}

/// Builder for one component instance.
pub struct ComponentBuilder {
    class: Rc<ComponentClass>,
    presets: HashMap<&'static str, Box<dyn Any>>,
}

impl ComponentBuilder {
    /// Preset an attribute's initial value. On a computed attribute this
    /// freezes it into a constant.
    pub fn with<T: Value>(mut self, name: &'static str, value: T) -> Self {
        self.presets.insert(name, Box::new(value));
        self
    }

    /// Instantiate, activating eager attributes inside one atomic section.
    pub fn create(self) -> Result<Rc<Component>, TrellisError> {
        let comp = Rc::new_cyclic(|weak| Component {
            class: Rc::clone(&self.class),
            cells: RefCell::new(HashMap::new()),
            presets: RefCell::new(self.presets),
            weak_self: weak.clone(),
        });
        let eager: Vec<&'static str> = comp
            .class
            .order
            .iter()
            .filter(|name| comp.class.specs[*name].eager)
            .copied()
            .collect();
        atomically(|| {
            for name in eager {
                comp.activate(name)?;
            }
            Ok(())
        })?;
        Ok(comp)
    }
}

/// One instance of a [`ComponentClass`]: a private cache of named cells.
pub struct Component {
    class: Rc<ComponentClass>,
    cells: RefCell<HashMap<&'static str, Rc<dyn Any>>>,
    presets: RefCell<HashMap<&'static str, Box<dyn Any>>>,
    weak_self: Weak<Component>,
}

impl Component {
    /// Start building an instance of `class`.
    pub fn build(class: &Rc<ComponentClass>) -> ComponentBuilder {
        ComponentBuilder {
            class: Rc::clone(class),
            presets: HashMap::new(),
        }
    }

    /// The class this instance was built from.
    pub fn class(&self) -> &Rc<ComponentClass> {
        &self.class
    }

    fn activate(&self, name: &'static str) -> Result<Rc<dyn Any>, TrellisError> {
        if let Some(cached) = self.cells.borrow().get(name) {
            return Ok(Rc::clone(cached));
        }
        let Some(spec) = self.class.spec(name) else {
            return Err(TrellisError::InvalidOperation("unknown attribute"));
        };
        let preset = self.presets.borrow_mut().remove(name);
        let me = self.weak_self.upgrade().expect("component alive");
        let built = (spec.build)(&me, preset)?;
        self.cells
            .borrow_mut()
            .insert(name, Rc::clone(&built.handle));
        if let Some(after) = built.after {
            after()?;
        }
        Ok(built.handle)
    }

    /// The cell behind an attribute, activating it if necessary.
    ///
    /// # Panics
    ///
    /// The returned handle is independent of the component, but a
    /// rule-backed attribute's rule (and a todo attribute's default
    /// producer) holds only a weak reference back to the component. If the
    /// component is dropped while such a cell can still recompute, because
    /// an extracted handle or a surviving listener reaches it, the next
    /// recomputation panics. Keep the component alive as long as any
    /// extracted rule-backed cell is in use.
    pub fn cell<T: Value>(&self, name: &'static str) -> Result<Cell<T>, TrellisError> {
        let handle = self.activate(name)?;
        handle
            .downcast::<Cell<T>>()
            .map(|rc| (*rc).clone())
            .map_err(|_| TrellisError::InvalidOperation("attribute type mismatch"))
    }

    /// The observer behind an attribute declared with
    /// [`ClassBuilder::observe`].
    pub fn observer(&self, name: &'static str) -> Result<Observer, TrellisError> {
        let handle = self.activate(name)?;
        handle
            .downcast::<Observer>()
            .map(|rc| (*rc).clone())
            .map_err(|_| TrellisError::InvalidOperation("attribute type mismatch"))
    }

    /// Read an attribute, reporting engine errors. See [`Component::cell`]
    /// for the rule lifetime contract.
    pub fn get<T: Value>(&self, name: &'static str) -> Result<T, TrellisError> {
        self.cell::<T>(name)?.try_get()
    }

    /// Read an attribute from inside a rule.
    ///
    /// # Panics
    ///
    /// Panics on an unknown attribute name or a type mismatch; those are
    /// wiring bugs, not runtime conditions. See [`Component::cell`] for the
    /// rule lifetime contract.
    pub fn read<T: Value>(&self, name: &'static str) -> T {
        self.cell::<T>(name)
            .expect("attribute exists with the requested type")
            .get()
    }

    /// Write an attribute. See [`Component::cell`] for the rule lifetime
    /// contract.
    pub fn set<T: Value>(&self, name: &'static str, value: T) -> Result<(), TrellisError> {
        self.cell::<T>(name)?.set(value)
    }

    /// Mutate a todo attribute's upcoming value. Only legal inside a
    /// modifier. See [`Component::cell`] for the rule lifetime contract.
    pub fn future<T: Value>(
        &self,
        name: &'static str,
        f: impl FnOnce(&mut T),
    ) -> Result<(), TrellisError> {
        self.cell::<T>(name)?.future_mut(f)
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("attributes", &self.class.order)
            .field("activated", &self.cells.borrow().len())
            .finish()
    }
}
