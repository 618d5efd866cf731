//! Classes and method tables.
//!
//! Classes are **globally registered** by name and never removed, so a class
//! name received over the wire can always be resolved back to the same
//! `Class`. Each class owns a method table mapping selectors to a parsed
//! signature plus an implementation closure; lookups walk the superclass
//! chain.

use crate::error::{Error, Result};
use crate::runtime::{Invocation, MethodSignature, Object, Protocol, Selector};
use fxhash::FxHashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Method implementation.
///
/// Receives the receiver and the invocation; reads arguments from it and
/// stores the result with [`Invocation::set_return_value`].
pub type Imp = Arc<dyn Fn(&Object, &mut Invocation) -> Result<()> + Send + Sync>;

/// A method: selector, parsed signature and implementation.
#[derive(Clone)]
pub struct Method {
    /// The selector this method answers.
    pub selector: Selector,
    /// Parsed type encoding.
    pub signature: MethodSignature,
    /// The implementation.
    pub imp: Imp,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("selector", &self.selector)
            .field("types", &self.signature.types())
            .finish_non_exhaustive()
    }
}

struct ClassInner {
    name: String,
    super_class: Option<Class>,
    methods: RwLock<FxHashMap<Selector, Method>>,
    protocols: RwLock<Vec<Protocol>>,
}

/// A registered class.
///
/// ```rust
/// use oxidec_do::{Class, Object, Value};
///
/// let class = Class::new_root("DocCounter").unwrap();
/// class
///     .add_method("answer", "i@:", |_, inv| inv.set_return_value(Value::Int(42)))
///     .unwrap();
///
/// let obj = Object::new(&class);
/// assert_eq!(obj.send_message("answer", vec![]).unwrap(), Value::Int(42));
/// ```
#[derive(Clone)]
pub struct Class {
    inner: Arc<ClassInner>,
}

static REGISTRY: OnceLock<RwLock<FxHashMap<String, Class>>> = OnceLock::new();

fn registry() -> &'static RwLock<FxHashMap<String, Class>> {
    REGISTRY.get_or_init(|| RwLock::new(FxHashMap::default()))
}

impl Class {
    fn register(name: &str, super_class: Option<Class>) -> Result<Self> {
        let mut classes = registry().write();
        if classes.contains_key(name) {
            return Err(Error::ClassAlreadyExists {
                name: name.to_owned(),
            });
        }
        let class = Class {
            inner: Arc::new(ClassInner {
                name: name.to_owned(),
                super_class,
                methods: RwLock::new(FxHashMap::default()),
                protocols: RwLock::new(Vec::new()),
            }),
        };
        classes.insert(name.to_owned(), class.clone());
        Ok(class)
    }

    /// Creates and registers a class with no superclass.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassAlreadyExists`] if the name is taken.
    pub fn new_root(name: &str) -> Result<Self> {
        Self::register(name, None)
    }

    /// Creates and registers a subclass.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassAlreadyExists`] if the name is taken.
    pub fn new(name: &str, super_class: &Class) -> Result<Self> {
        Self::register(name, Some(super_class.clone()))
    }

    /// Finds a registered class by name.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Class> {
        registry().read().get(name).cloned()
    }

    /// Finds a registered class by name, failing with [`Error::ClassNotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassNotFound`] if no class has that name.
    pub fn named(name: &str) -> Result<Class> {
        Self::lookup(name).ok_or_else(|| Error::ClassNotFound {
            name: name.to_owned(),
        })
    }

    /// The class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The superclass, if any.
    #[must_use]
    pub fn super_class(&self) -> Option<Class> {
        self.inner.super_class.clone()
    }

    /// Adds or replaces a method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSignature`] if `types` does not parse, or
    /// [`Error::SelectorNotFound`] for an empty selector.
    pub fn add_method<F>(&self, selector: &str, types: &str, imp: F) -> Result<()>
    where
        F: Fn(&Object, &mut Invocation) -> Result<()> + Send + Sync + 'static,
    {
        let selector: Selector = selector.parse()?;
        let signature = MethodSignature::parse(types)?;
        self.inner.methods.write().insert(
            selector,
            Method {
                selector,
                signature,
                imp: Arc::new(imp),
            },
        );
        Ok(())
    }

    /// Looks up a method on this class or its superclasses.
    #[must_use]
    pub fn lookup_method(&self, selector: &Selector) -> Option<Method> {
        let mut class = Some(self);
        while let Some(current) = class {
            if let Some(method) = current.inner.methods.read().get(selector) {
                return Some(method.clone());
            }
            class = current.inner.super_class.as_ref();
        }
        None
    }

    /// Whether instances respond to `selector`.
    #[must_use]
    pub fn responds_to(&self, selector: &Selector) -> bool {
        self.lookup_method(selector).is_some()
    }

    /// Whether `self` is `class` or inherits from it.
    #[must_use]
    pub fn is_subclass_of(&self, class: &Class) -> bool {
        let mut current = Some(self);
        while let Some(c) = current {
            if c == class {
                return true;
            }
            current = c.inner.super_class.as_ref();
        }
        false
    }

    /// Declares conformance to a protocol. Adding twice is a no-op.
    pub fn add_protocol(&self, protocol: &Protocol) {
        let mut protocols = self.inner.protocols.write();
        if !protocols.contains(protocol) {
            protocols.push(protocol.clone());
        }
    }

    /// Whether this class or a superclass adopts `protocol` (directly or via
    /// a protocol that extends it).
    #[must_use]
    pub fn conforms_to(&self, protocol: &Protocol) -> bool {
        let mut current = Some(self);
        while let Some(c) = current {
            if c.inner.protocols.read().iter().any(|p| p.conforms_to(protocol)) {
                return true;
            }
            current = c.inner.super_class.as_ref();
        }
        false
    }

    /// Protocols adopted directly by this class.
    #[must_use]
    pub fn protocols(&self) -> Vec<Protocol> {
        self.inner.protocols.read().clone()
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Class {}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.inner.name)
            .field("super_class", &self.inner.super_class.as_ref().map(Class::name))
            .finish()
    }
}
