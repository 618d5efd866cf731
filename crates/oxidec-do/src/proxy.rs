//! Distant objects: the stand-ins messages are sent through.
//!
//! A [`DistantObject`] is bound one of two ways, fixed at creation:
//!
//! - **local**: wraps an object of this process. This is what the peer of a
//!   [`Connection`] sees when the object is passed by reference; messages
//!   arriving for its handle are dispatched straight to the object.
//! - **remote**: names an object exported by the peer under an opaque
//!   handle. Every message is serialized, sent, and (unless `oneway`)
//!   answered by a reply carrying the return value and any `out` values.
//!
//! Proxies never own their connection. Once the connection is gone or
//! invalid, remote sends fail with [`Error::ConnectionBroken`].
//!
//! At most one invocation per proxy is in flight: a second caller queues
//! until the first one's reply has been read.

use crate::connection::{Connection, ConnectionInner};
use crate::error::{Error, Result};
use crate::runtime::{Callable, Invocation, MethodSignature, Object, Protocol, Selector};
use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Weak;

enum Binding {
    Local { object: Object, handle: u32 },
    Remote { handle: u32 },
}

/// Proxy state stored in an [`Object`] body.
pub struct DistantObject {
    binding: Binding,
    connection: Weak<ConnectionInner>,
    connection_id: u64,
    protocol: RwLock<Option<Protocol>>,
    signatures: RwLock<FxHashMap<Selector, MethodSignature>>,
    call_lock: Mutex<()>,
}

impl DistantObject {
    fn bound(binding: Binding, connection: Weak<ConnectionInner>, connection_id: u64) -> Self {
        DistantObject {
            binding,
            connection,
            connection_id,
            protocol: RwLock::new(None),
            signatures: RwLock::new(FxHashMap::default()),
            call_lock: Mutex::new(()),
        }
    }

    pub(crate) fn local(
        connection: Weak<ConnectionInner>,
        connection_id: u64,
        object: Object,
        handle: u32,
    ) -> Self {
        Self::bound(Binding::Local { object, handle }, connection, connection_id)
    }

    pub(crate) fn remote(connection: Weak<ConnectionInner>, connection_id: u64, handle: u32) -> Self {
        Self::bound(Binding::Remote { handle }, connection, connection_id)
    }

    /// The proxy `connection`'s peer sees for `object`.
    ///
    /// Exporting the same object twice yields the same proxy and handle.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if the connection is invalid.
    pub fn with_local(connection: &Connection, object: &Object) -> Result<Object> {
        connection.inner().export_proxy(object)
    }

    /// The proxy for the object the peer exported under `handle`.
    ///
    /// Each call takes one reference on the proxy, balanced by
    /// [`Connection::release_proxy`].
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if the connection is invalid.
    pub fn with_target(connection: &Connection, handle: u32) -> Result<Object> {
        connection.inner().import_proxy(handle, None)
    }

    /// The handle this proxy is known by on the wire.
    #[must_use]
    pub fn handle(&self) -> u32 {
        match self.binding {
            Binding::Local { handle, .. } | Binding::Remote { handle } => handle,
        }
    }

    /// Whether this proxy wraps an object of this process.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.binding, Binding::Local { .. })
    }

    /// The wrapped object of a local proxy.
    #[must_use]
    pub fn local_object(&self) -> Option<&Object> {
        match &self.binding {
            Binding::Local { object, .. } => Some(object),
            Binding::Remote { .. } => None,
        }
    }

    /// The owning connection, if it still exists.
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        self.connection.upgrade().map(Connection::from_inner)
    }

    pub(crate) fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// The protocol describing the remote interface, if any.
    #[must_use]
    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol.read().clone()
    }

    /// Attaches a protocol. Signatures are then taken from it without
    /// asking the peer.
    pub fn set_protocol(&self, protocol: Option<Protocol>) {
        *self.protocol.write() = protocol;
    }

    pub(crate) fn adopt_protocol_if_unset(&self, protocol: Protocol) {
        let mut slot = self.protocol.write();
        if slot.is_none() {
            *slot = Some(protocol);
        }
    }

    fn live_connection(&self) -> Result<std::sync::Arc<ConnectionInner>> {
        self.connection
            .upgrade()
            .ok_or_else(|| Error::broken("connection no longer exists"))
    }
}

impl Callable for DistantObject {
    /// Looks in the attached protocol, then the wrapped object, then a
    /// per-proxy cache, and finally asks the peer.
    fn method_signature(&self, selector: &Selector) -> Result<MethodSignature> {
        if let Some(signature) = self
            .protocol
            .read()
            .as_ref()
            .and_then(|p| p.method_signature(selector))
        {
            return Ok(signature);
        }

        let handle = match &self.binding {
            Binding::Local { object, .. } => return object.method_signature(selector),
            Binding::Remote { handle } => *handle,
        };

        if let Some(signature) = self.signatures.read().get(selector) {
            return Ok(signature.clone());
        }

        let signature = self
            .live_connection()?
            .remote_signature(handle, selector)?
            .ok_or_else(|| Error::SelectorNotFound {
                selector: selector.name().to_owned(),
            })?;
        self.signatures.write().insert(*selector, signature.clone());
        Ok(signature)
    }

    fn forward_invocation(&self, invocation: &mut Invocation) -> Result<()> {
        match &self.binding {
            Binding::Local { object, .. } => object.forward_invocation(invocation),
            Binding::Remote { handle } => {
                let connection = self.live_connection()?;
                let _in_flight = self.call_lock.lock();
                connection.send_invocation(*handle, invocation)
            }
        }
    }
}

impl fmt::Debug for DistantObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("DistantObject");
        match &self.binding {
            Binding::Local { object, handle } => {
                s.field("local", object).field("handle", handle);
            }
            Binding::Remote { handle } => {
                s.field("remote", handle);
            }
        }
        s.field("connection", &self.connection_id)
            .field(
                "protocol",
                &self.protocol.read().as_ref().map(|p| p.name().to_owned()),
            )
            .finish()
    }
}
