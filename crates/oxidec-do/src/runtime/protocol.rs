//! Protocols: named sets of method descriptions.
//!
//! A protocol attached to a proxy lets the proxy answer signature queries
//! locally instead of asking the peer. Protocols are globally registered by
//! name, so the name sent alongside an exported object can be resolved on
//! the receiving side if both processes declared the same protocol.

use crate::error::{Error, Result};
use crate::runtime::{MethodSignature, Selector};
use fxhash::FxHashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, OnceLock};

struct ProtocolInner {
    name: String,
    base: Option<Protocol>,
    methods: RwLock<FxHashMap<Selector, MethodSignature>>,
}

/// A registered protocol.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<ProtocolInner>,
}

static REGISTRY: OnceLock<RwLock<FxHashMap<String, Protocol>>> = OnceLock::new();

fn registry() -> &'static RwLock<FxHashMap<String, Protocol>> {
    REGISTRY.get_or_init(|| RwLock::new(FxHashMap::default()))
}

impl Protocol {
    /// Creates and registers a protocol, optionally extending `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolAlreadyExists`] if the name is taken.
    pub fn new(name: &str, base: Option<&Protocol>) -> Result<Self> {
        let mut protocols = registry().write();
        if protocols.contains_key(name) {
            return Err(Error::ProtocolAlreadyExists {
                name: name.to_owned(),
            });
        }
        let protocol = Protocol {
            inner: Arc::new(ProtocolInner {
                name: name.to_owned(),
                base: base.cloned(),
                methods: RwLock::new(FxHashMap::default()),
            }),
        };
        protocols.insert(name.to_owned(), protocol.clone());
        Ok(protocol)
    }

    /// Finds a registered protocol by name.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Protocol> {
        registry().read().get(name).cloned()
    }

    /// The protocol name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The protocol this one extends.
    #[must_use]
    pub fn base_protocol(&self) -> Option<Protocol> {
        self.inner.base.clone()
    }

    /// Declares a method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSignature`] if `types` does not parse.
    pub fn add_method(&self, selector: &str, types: &str) -> Result<()> {
        let selector: Selector = selector.parse()?;
        let signature = MethodSignature::parse(types)?;
        self.inner.methods.write().insert(selector, signature);
        Ok(())
    }

    /// Signature of `selector`, searching base protocols.
    #[must_use]
    pub fn method_signature(&self, selector: &Selector) -> Option<MethodSignature> {
        let mut current = Some(self);
        while let Some(p) = current {
            if let Some(sig) = p.inner.methods.read().get(selector) {
                return Some(sig.clone());
            }
            current = p.inner.base.as_ref();
        }
        None
    }

    /// Selectors declared directly by this protocol.
    #[must_use]
    pub fn selectors(&self) -> Vec<Selector> {
        self.inner.methods.read().keys().copied().collect()
    }

    /// Whether this protocol is `other` or extends it.
    #[must_use]
    pub fn conforms_to(&self, other: &Protocol) -> bool {
        let mut current = Some(self);
        while let Some(p) = current {
            if p == other {
                return true;
            }
            current = p.inner.base.as_ref();
        }
        false
    }
}

impl PartialEq for Protocol {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Protocol {}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.inner.name)
            .field("methods", &self.inner.methods.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_found_through_base() {
        let base = Protocol::new("ProtoTestBase", None).unwrap();
        base.add_method("count", "Q@:").unwrap();
        let derived = Protocol::new("ProtoTestDerived", Some(&base)).unwrap();
        derived.add_method("objectAt:", "@@:Q").unwrap();

        let count: Selector = "count".parse().unwrap();
        let sig = derived.method_signature(&count).unwrap();
        assert_eq!(sig.method_return_type(), "Q");
        assert!(base.method_signature(&"objectAt:".parse().unwrap()).is_none());
        assert!(derived.conforms_to(&base));
        assert!(!base.conforms_to(&derived));
    }

    #[test]
    fn test_duplicate_protocol_rejected() {
        Protocol::new("ProtoTestDup", None).unwrap();
        assert!(Protocol::new("ProtoTestDup", None).is_err());
        assert!(Protocol::lookup("ProtoTestDup").is_some());
    }
}
