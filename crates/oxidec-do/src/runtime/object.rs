//! Reference-counted objects.
//!
//! An [`Object`] is a cheap, clonable handle (`Arc`) to either a class
//! instance with named instance variables, or a [`DistantObject`] proxy.
//! Identity is pointer identity: two handles are equal iff they refer to the
//! same allocation. Every object also carries a process-unique id that never
//! changes, used as a key by the coder and connection tables.
//!
//! Messages are sent through the [`Callable`] seam. Instances dispatch through
//! their class's method table; proxies serialize the invocation and forward
//! it to their peer.

use crate::error::{Error, Result};
use crate::proxy::DistantObject;
use crate::runtime::{Class, Invocation, MethodSignature, Selector, Value};
use parking_lot::RwLock;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Anything a message can be sent to.
pub trait Callable {
    /// Signature of `selector` as this receiver implements it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SelectorNotFound`] if the receiver does not respond.
    fn method_signature(&self, selector: &Selector) -> Result<MethodSignature>;

    /// Performs the invocation, leaving the result in its return slot.
    ///
    /// # Errors
    ///
    /// Whatever the receiver signals.
    fn forward_invocation(&self, invocation: &mut Invocation) -> Result<()>;

    /// Whether the receiver responds to `selector`.
    fn responds_to(&self, selector: &Selector) -> bool {
        self.method_signature(selector).is_ok()
    }
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

enum Body {
    Instance {
        class: Class,
        ivars: RwLock<Vec<(String, Value)>>,
    },
    Proxy(DistantObject),
}

struct ObjectInner {
    id: u64,
    body: Body,
}

/// A strong handle to an object.
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

/// A non-owning handle to an object.
#[derive(Clone)]
pub struct WeakObject {
    inner: Weak<ObjectInner>,
}

impl WeakObject {
    /// The object, if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Object> {
        self.inner.upgrade().map(|inner| Object { inner })
    }
}

impl fmt::Debug for WeakObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakObject(alive: {})", self.inner.strong_count() > 0)
    }
}

impl Object {
    fn with_body(body: Body) -> Self {
        Object {
            inner: Arc::new(ObjectInner {
                id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
                body,
            }),
        }
    }

    /// Creates an instance of `class` with no instance variables.
    #[must_use]
    pub fn new(class: &Class) -> Self {
        Self::with_body(Body::Instance {
            class: class.clone(),
            ivars: RwLock::new(Vec::new()),
        })
    }

    pub(crate) fn from_proxy(proxy: DistantObject) -> Self {
        Self::with_body(Body::Proxy(proxy))
    }

    /// Process-unique, stable id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The class of an instance; `None` for proxies.
    #[must_use]
    pub fn class(&self) -> Option<Class> {
        match &self.inner.body {
            Body::Instance { class, .. } => Some(class.clone()),
            Body::Proxy(_) => None,
        }
    }

    /// The class name, or `"DistantObject"` for proxies.
    #[must_use]
    pub fn class_name(&self) -> String {
        match &self.inner.body {
            Body::Instance { class, .. } => class.name().to_owned(),
            Body::Proxy(_) => "DistantObject".to_owned(),
        }
    }

    /// Whether this object is a proxy.
    #[must_use]
    pub fn is_proxy(&self) -> bool {
        matches!(self.inner.body, Body::Proxy(_))
    }

    /// The proxy state, if this object is a proxy.
    #[must_use]
    pub fn as_proxy(&self) -> Option<&DistantObject> {
        match &self.inner.body {
            Body::Proxy(proxy) => Some(proxy),
            Body::Instance { .. } => None,
        }
    }

    /// Sets an instance variable, keeping first-assignment order.
    ///
    /// Proxies have no instance variables; the call is ignored.
    pub fn set_ivar(&self, name: &str, value: impl Into<Value>) {
        let Body::Instance { ivars, .. } = &self.inner.body else {
            return;
        };
        let value = value.into();
        let mut ivars = ivars.write();
        match ivars.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => ivars.push((name.to_owned(), value)),
        }
    }

    /// Reads an instance variable.
    #[must_use]
    pub fn ivar(&self, name: &str) -> Option<Value> {
        match &self.inner.body {
            Body::Instance { ivars, .. } => ivars
                .read()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone()),
            Body::Proxy(_) => None,
        }
    }

    /// A snapshot of all instance variables in order.
    #[must_use]
    pub fn ivars(&self) -> Vec<(String, Value)> {
        match &self.inner.body {
            Body::Instance { ivars, .. } => ivars.read().clone(),
            Body::Proxy(_) => Vec::new(),
        }
    }

    /// Drops all instance variables. Breaks reference cycles between objects.
    pub fn clear_ivars(&self) {
        if let Body::Instance { ivars, .. } = &self.inner.body {
            ivars.write().clear();
        }
    }

    /// Whether both handles refer to the same object.
    #[must_use]
    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Creates a non-owning handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakObject {
        WeakObject {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of strong handles.
    #[must_use]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Sends `selector` with `args` as explicit arguments and returns the
    /// result.
    ///
    /// Missing trailing arguments keep their zero value.
    ///
    /// # Errors
    ///
    /// Fails if the receiver does not respond, an argument does not match the
    /// signature, or dispatch fails.
    pub fn send_message(&self, selector: &str, args: Vec<Value>) -> Result<Value> {
        let selector: Selector = selector.parse()?;
        let signature = self.method_signature(&selector)?;
        let mut invocation = Invocation::new(signature);
        invocation.set_selector(selector);
        for (i, arg) in args.into_iter().enumerate() {
            invocation.set_argument(i + 2, arg)?;
        }
        invocation.invoke_with_target(self)?;
        invocation.return_value().cloned()
    }
}

impl Callable for Object {
    fn method_signature(&self, selector: &Selector) -> Result<MethodSignature> {
        match &self.inner.body {
            Body::Instance { class, .. } => class
                .lookup_method(selector)
                .map(|m| m.signature)
                .ok_or_else(|| Error::SelectorNotFound {
                    selector: selector.name().to_owned(),
                }),
            Body::Proxy(proxy) => proxy.method_signature(selector),
        }
    }

    fn forward_invocation(&self, invocation: &mut Invocation) -> Result<()> {
        match &self.inner.body {
            Body::Instance { class, .. } => {
                let selector = invocation.selector().ok_or(Error::InvalidTarget)?;
                let method =
                    class
                        .lookup_method(&selector)
                        .ok_or_else(|| Error::SelectorNotFound {
                            selector: selector.name().to_owned(),
                        })?;
                (method.imp)(self, invocation)
            }
            Body::Proxy(proxy) => proxy.forward_invocation(invocation),
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Object {}

impl Hash for Object {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.inner.id);
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.body {
            Body::Instance { class, .. } => f
                .debug_struct("Object")
                .field("id", &self.inner.id)
                .field("class", &class.name())
                .finish(),
            Body::Proxy(proxy) => f
                .debug_struct("Object")
                .field("id", &self.inner.id)
                .field("proxy", proxy)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ivars_keep_order_and_replace() {
        let class = Class::new_root("ObjectTestIvars").unwrap();
        let obj = Object::new(&class);
        obj.set_ivar("x", 1);
        obj.set_ivar("y", 2);
        obj.set_ivar("x", 3);

        let names: Vec<String> = obj.ivars().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(obj.ivar("x"), Some(Value::Int(3)));
        assert_eq!(obj.ivar("z"), None);
    }

    #[test]
    fn test_identity_and_weak() {
        let class = Class::new_root("ObjectTestIdentity").unwrap();
        let a = Object::new(&class);
        let b = Object::new(&class);
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
        assert_eq!(a, a.clone());

        let weak = a.downgrade();
        assert!(weak.upgrade().is_some());
        drop(a);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_unknown_selector() {
        let class = Class::new_root("ObjectTestUnknown").unwrap();
        let obj = Object::new(&class);
        assert!(matches!(
            obj.send_message("nothing", vec![]),
            Err(Error::SelectorNotFound { .. })
        ));
        assert!(!obj.responds_to(&"nothing".parse().unwrap()));
    }

    #[test]
    fn test_send_message_with_arguments() {
        let class = Class::new_root("ObjectTestAdder").unwrap();
        class
            .add_method("add:to:", "q@:qq", |_, inv| {
                let a = inv.argument(2)?.as_i64().unwrap_or(0);
                let b = inv.argument(3)?.as_i64().unwrap_or(0);
                inv.set_return_value(Value::LongLong(a + b))
            })
            .unwrap();

        let obj = Object::new(&class);
        let sum = obj
            .send_message("add:to:", vec![Value::LongLong(2), Value::LongLong(40)])
            .unwrap();
        assert_eq!(sum, Value::LongLong(42));

        assert!(matches!(
            obj.send_message("add:to:", vec![Value::Int(1)]),
            Err(Error::ArgumentTypeMismatch { .. })
        ));
    }
}
