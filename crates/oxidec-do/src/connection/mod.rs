//! Connections: one conversation between two processes.
//!
//! A [`Connection`] owns a [`Transport`], a receiver thread reading from it,
//! and the proxy tables that give object references meaning on the wire.
//! Outgoing messages are numbered in the order they are written; a reply
//! carries the number of the request it answers, so concurrent callers are
//! paired with their replies no matter the order in which the peer answers.
//!
//! Inbound requests run on a thread of their own. A method can therefore
//! call back into the peer (which may call back again) without blocking the
//! reader that will deliver its reply.
//!
//! # Example
//!
//! ```rust
//! use oxidec_do::port::MemoryTransport;
//! use oxidec_do::{Class, Connection, ConnectionConfig, Object, Value};
//!
//! let class = Class::new_root("DocAdder").unwrap();
//! class
//!     .add_method("add:to:", "i@:ii", |_, inv| {
//!         let a = inv.argument(2)?.as_i64().unwrap_or(0);
//!         let b = inv.argument(3)?.as_i64().unwrap_or(0);
//!         inv.set_return_value(Value::Int((a + b) as i32))
//!     })
//!     .unwrap();
//!
//! let (a, b) = MemoryTransport::pair();
//! let server = Connection::new(a, ConnectionConfig::default()).unwrap();
//! let client = Connection::new(b, ConnectionConfig::default()).unwrap();
//! server.set_root_object(Some(Object::new(&class)));
//!
//! let adder = client.root_proxy().unwrap();
//! let sum = adder
//!     .send_message("add:to:", vec![Value::Int(2), Value::Int(3)])
//!     .unwrap();
//! assert_eq!(sum, Value::Int(5));
//! ```

pub mod wire;

mod scope;
mod tables;

use crate::coder::{ClassNameMap, Decoder, Encoder, ProxyResolver};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::name_server::PortNameServer;
use crate::port::{Port, PortMessage, StreamTransport, Transport};
use crate::proxy::DistantObject;
use crate::runtime::{Callable, Invocation, MethodSignature, Object, Protocol, Selector, Value};
use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use scope::MessageScope;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;
use tables::{ExportTable, ImportTable};
use wire::{Header, MessageKind, status};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Message and object counts of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatistics {
    /// Requests written, oneway included.
    pub requests_sent: u64,
    /// Requests read, oneway included.
    pub requests_received: u64,
    /// Replies written.
    pub replies_sent: u64,
    /// Replies matched to a waiting caller.
    pub replies_received: u64,
    /// Oneway requests written.
    pub oneway_sent: u64,
    /// Objects currently exported to the peer.
    pub local_objects: usize,
    /// Proxies currently held for the peer's objects.
    pub remote_objects: usize,
}

#[derive(Default)]
struct Counters {
    requests_sent: AtomicU64,
    requests_received: AtomicU64,
    replies_sent: AtomicU64,
    replies_received: AtomicU64,
    oneway_sent: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) struct ConnectionInner {
    id: u64,
    this: Weak<ConnectionInner>,
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    local_port: Port,
    remote_port: Port,
    valid: AtomicBool,
    root: RwLock<Option<Object>>,
    exports: Mutex<ExportTable>,
    imports: Mutex<ImportTable>,
    class_names: ClassNameMap,
    /// Next sequence number; held while writing so wire order matches.
    next_seq: Mutex<u32>,
    /// Outstanding two-way requests; `Some` once the reply body arrived.
    pending: Mutex<FxHashMap<u32, Option<Vec<u8>>>>,
    reply_ready: Condvar,
    release_gate: Mutex<ReleaseGate>,
    counters: Counters,
}

/// Releases must not overtake a reply that names the released handle. A
/// reply is decoded by its caller, off the reader thread, so releases that
/// arrive while one is pending are held back until it is decoded.
#[derive(Default)]
struct ReleaseGate {
    undecoded: usize,
    deferred: Vec<(u32, u32)>,
}

/// An encoded body and the export handles written into it.
#[derive(Default)]
struct Outgoing {
    body: Vec<u8>,
    exported: Vec<u32>,
}

impl Outgoing {
    fn plain(body: Vec<u8>) -> Self {
        Outgoing {
            body,
            exported: Vec::new(),
        }
    }
}

/// A handle to one side of a conversation. Clones share the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Starts a connection over `transport`.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if `config` is invalid or the receiver thread cannot
    /// be spawned.
    pub fn new(transport: impl Transport, config: ConnectionConfig) -> Result<Self> {
        Self::with_shared_transport(Arc::new(transport), config)
    }

    /// Starts a connection over a transport the caller keeps a handle to.
    ///
    /// # Errors
    ///
    /// As for [`Connection::new`].
    pub fn with_shared_transport(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        config.validate().map_err(|reason| Error::Io {
            kind: std::io::ErrorKind::InvalidInput,
            message: reason.to_owned(),
        })?;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new_cyclic(|this| ConnectionInner {
            id,
            this: this.clone(),
            local_port: Port::with_id(transport.local_port()),
            remote_port: Port::with_id(transport.remote_port()),
            transport: transport.clone(),
            config,
            valid: AtomicBool::new(true),
            root: RwLock::new(None),
            exports: Mutex::new(ExportTable::default()),
            imports: Mutex::new(ImportTable::default()),
            class_names: ClassNameMap::new(),
            next_seq: Mutex::new(1),
            pending: Mutex::new(FxHashMap::default()),
            reply_ready: Condvar::new(),
            release_gate: Mutex::new(ReleaseGate::default()),
            counters: Counters::default(),
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name(format!("oxidec-do-recv-{id}"))
            .spawn(move || receive_loop(&weak, transport.as_ref()))?;

        oxidex_log::info!(
            "connection {id} up: {} -> {}",
            inner.local_port.id(),
            inner.remote_port.id()
        );
        Ok(Connection { inner })
    }

    /// Connects a stream transport to `addr` and starts a connection on it.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if the peer cannot be reached, otherwise
    /// as for [`Connection::new`].
    pub fn connect(addr: SocketAddr, config: ConnectionConfig) -> Result<Self> {
        let transport = StreamTransport::connect(addr, &config)?;
        Self::new(transport, config)
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Connection { inner }
    }

    pub(crate) fn inner(&self) -> &ConnectionInner {
        &self.inner
    }

    /// Process-unique id of this connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The configuration the connection was started with.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Whether the connection can still carry messages.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    /// Closes the transport, fails every waiting caller with
    /// [`Error::ConnectionBroken`], empties the proxy tables and invalidates
    /// both ports. Later calls do nothing.
    pub fn invalidate(&self) {
        self.inner.invalidate();
    }

    /// Sets the object the peer gets from [`Connection::root_proxy`].
    pub fn set_root_object(&self, root: Option<Object>) {
        *self.inner.root.write() = root;
    }

    /// The object served as root.
    #[must_use]
    pub fn root_object(&self) -> Option<Object> {
        self.inner.root.read().clone()
    }

    /// Asks the peer for its root object.
    ///
    /// The returned proxy holds one reference; see
    /// [`Connection::release_proxy`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTarget`] if the peer has no root,
    /// [`Error::ConnectionBroken`] if the connection fails.
    pub fn root_proxy(&self) -> Result<Object> {
        let inner = &self.inner;
        let reply = inner.call(MessageKind::RootRequest, Outgoing::default())?;
        inner.decode_reply(&reply, |decoder| match decoder.decode_value()? {
            Value::Object(Some(root)) => Ok(root),
            Value::Object(None) => Err(Error::InvalidTarget),
            other => Err(Error::UnknownTypeTag {
                tag: other.tag() as u8,
            }),
        })
    }

    /// Drops one reference to a proxy of this connection. When the last
    /// one goes, the proxy leaves the table and the peer is told.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTarget`] if `proxy` is not a counted proxy of this
    /// connection.
    pub fn release_proxy(&self, proxy: &Object) -> Result<()> {
        let handle = proxy
            .as_proxy()
            .filter(|p| !p.is_local() && p.connection_id() == self.inner.id)
            .map(DistantObject::handle)
            .ok_or(Error::InvalidTarget)?;
        if self.inner.imports.lock().count(handle) == 0 {
            return Err(Error::InvalidTarget);
        }
        self.inner.release_handle(handle, false);
        Ok(())
    }

    /// Unbalanced references held on a proxy of this connection.
    #[must_use]
    pub fn proxy_reference_count(&self, proxy: &Object) -> usize {
        match proxy.as_proxy() {
            Some(p) if !p.is_local() && p.connection_id() == self.inner.id => {
                self.inner.imports.lock().count(p.handle())
            }
            _ => 0,
        }
    }

    /// Message counters and table sizes.
    #[must_use]
    pub fn statistics(&self) -> ConnectionStatistics {
        let counters = &self.inner.counters;
        ConnectionStatistics {
            requests_sent: counters.requests_sent.load(Ordering::Relaxed),
            requests_received: counters.requests_received.load(Ordering::Relaxed),
            replies_sent: counters.replies_sent.load(Ordering::Relaxed),
            replies_received: counters.replies_received.load(Ordering::Relaxed),
            oneway_sent: counters.oneway_sent.load(Ordering::Relaxed),
            local_objects: self.inner.exports.lock().len(),
            remote_objects: self.inner.imports.lock().len(),
        }
    }

    /// Archives of class `local` go on the wire named `wire`.
    pub fn set_class_name_override(&self, local: &str, wire: &str) {
        self.inner.class_names.set(local, wire);
    }

    /// Removes a class name override.
    pub fn remove_class_name_override(&self, local: &str) {
        self.inner.class_names.remove(local);
    }

    /// This side's port.
    #[must_use]
    pub fn local_port(&self) -> Port {
        self.inner.local_port.clone()
    }

    /// The peer's port.
    #[must_use]
    pub fn remote_port(&self) -> Port {
        self.inner.remote_port.clone()
    }

    /// Registers this connection's local port under `name`. The name goes
    /// away when the connection is invalidated.
    ///
    /// # Errors
    ///
    /// [`Error::NameInUse`] if `name` is bound to another port.
    pub fn register_name(&self, name: &str, name_server: &dyn PortNameServer) -> Result<()> {
        name_server.register_port(&self.inner.local_port, name)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("local", &self.inner.local_port.id())
            .field("remote", &self.inner.remote_port.id())
            .field("valid", &self.inner.is_valid())
            .finish()
    }
}

fn receive_loop(connection: &Weak<ConnectionInner>, transport: &dyn Transport) {
    loop {
        let received = transport.receive();
        let Some(inner) = connection.upgrade() else {
            return;
        };
        match received {
            Ok(message) => inner.dispatch(message),
            Err(err) => {
                if inner.is_valid() {
                    oxidex_log::info!("connection {}: receive failed: {err}", inner.id);
                }
                inner.invalidate();
                return;
            }
        }
        if !inner.is_valid() {
            return;
        }
    }
}

fn parse_handle_and_name<'a>(decoder: &mut Decoder<'a>) -> Result<(u32, &'a str)> {
    let handle = decoder.get_u32()?;
    let name = decoder.get_str()?;
    Ok((handle, name))
}

/// The selector a peer named. Names nothing here implements are never
/// interned.
fn known_selector(name: &str) -> Result<Selector> {
    Selector::lookup(name).ok_or_else(|| Error::SelectorNotFound {
        selector: name.to_owned(),
    })
}

impl ConnectionInner {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::broken("connection is invalid"))
        }
    }

    fn invalidate(&self) {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        oxidex_log::info!("connection {} invalidated", self.id);
        self.transport.close();
        {
            // Waiters check validity under this lock before sleeping.
            let _pending = self.pending.lock();
            self.reply_ready.notify_all();
        }
        let exports = self.exports.lock().drain();
        let imports = self.imports.lock().drain();
        let root = self.root.write().take();
        drop((exports, imports, root));
        self.local_port.invalidate();
        self.remote_port.invalidate();
    }

    /// Logs, invalidates and returns the error a caller should see.
    fn protocol_violation(&self, err: &Error) -> Error {
        oxidex_log::warn!("connection {}: protocol violation: {err}", self.id);
        self.invalidate();
        Error::broken(format!("protocol violation: {err}"))
    }

    fn fail_send(&self, err: Error) -> Error {
        if matches!(err, Error::ConnectionBroken { .. }) {
            oxidex_log::warn!("connection {}: send failed: {err}", self.id);
            self.invalidate();
        }
        err
    }

    // ---- outgoing -------------------------------------------------------

    /// Writes one message and returns its sequence number. With
    /// `awaiting_reply`, a reply slot exists before the bytes leave.
    fn post(&self, kind: MessageKind, flags: u8, outgoing: Outgoing, awaiting_reply: bool) -> Result<u32> {
        let Outgoing { body, exported } = outgoing;
        if let Err(err) = self.ensure_valid() {
            self.abandon_exports(&exported);
            return Err(err);
        }
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;
        let message = wire::build(
            self.local_port.id(),
            self.remote_port.id(),
            Header::new(kind, seq, flags),
            body,
        );
        if awaiting_reply {
            self.pending.lock().insert(seq, None);
        }
        // Counted before the bytes leave; the peer may release them at once.
        {
            let mut exports = self.exports.lock();
            for &handle in &exported {
                exports.note_sent(handle);
            }
        }
        if let Err(err) = self.transport.send(&message) {
            if awaiting_reply {
                self.pending.lock().remove(&seq);
            }
            drop(next_seq);
            self.return_exports(&exported);
            return Err(self.fail_send(err));
        }
        *next_seq = seq.wrapping_add(1);
        Ok(seq)
    }

    /// Encodes a message body. Exports made by a failed encoding are undone.
    fn encode_message(&self, write: impl FnOnce(&mut Encoder<'_>) -> Result<()>) -> Result<Outgoing> {
        let mut encoder = Encoder::new(self, &self.class_names);
        let written = write(&mut encoder);
        let exported = encoder.take_exported_handles();
        match written {
            Ok(()) => Ok(Outgoing {
                body: encoder.finish(),
                exported,
            }),
            Err(err) => {
                self.abandon_exports(&exported);
                Err(err)
            }
        }
    }

    /// Drops pending uses of handles whose message was never written.
    fn abandon_exports(&self, exported: &[u32]) {
        let dropped: Vec<_> = {
            let mut exports = self.exports.lock();
            exported
                .iter()
                .filter_map(|&handle| exports.note_unsent(handle))
                .collect()
        };
        drop(dropped);
    }

    /// Takes back references counted for a message the transport refused.
    fn return_exports(&self, exported: &[u32]) {
        let dropped: Vec<_> = {
            let mut exports = self.exports.lock();
            exported
                .iter()
                .filter_map(|&handle| exports.release(handle, 1))
                .collect()
        };
        drop(dropped);
    }

    /// Sends a two-way request and blocks for the reply body.
    fn call(&self, kind: MessageKind, outgoing: Outgoing) -> Result<Vec<u8>> {
        let seq = self.post(kind, 0, outgoing, true)?;
        bump(&self.counters.requests_sent);
        oxidex_log::trace!("connection {}: {kind:?} {seq} sent", self.id);
        self.wait_for_reply(seq)
    }

    fn wait_for_reply(&self, seq: u32) -> Result<Vec<u8>> {
        let timeout = self.config.reply_timeout;
        let deadline = Instant::now().checked_add(timeout);
        let mut pending = self.pending.lock();
        let mut timed_out = false;
        loop {
            let reply = pending.get_mut(&seq).and_then(Option::take);
            if let Some(body) = reply {
                pending.remove(&seq);
                bump(&self.counters.replies_received);
                return Ok(body);
            }
            if !self.is_valid() {
                pending.remove(&seq);
                return Err(Error::broken("connection invalidated while awaiting a reply"));
            }
            if timed_out {
                pending.remove(&seq);
                drop(pending);
                oxidex_log::warn!(
                    "connection {}: no reply to request {seq} within {timeout:?}",
                    self.id
                );
                self.invalidate();
                return Err(Error::broken(format!(
                    "no reply within {}ms",
                    timeout.as_millis()
                )));
            }
            timed_out = match deadline {
                Some(deadline) => self.reply_ready.wait_until(&mut pending, deadline).timed_out(),
                None => {
                    self.reply_ready.wait(&mut pending);
                    false
                }
            };
        }
    }

    /// Reads a reply's status byte and then the values with `read`.
    ///
    /// References imported by a successful read belong to the caller; a
    /// failed read gives them back.
    fn decode_reply<T>(
        &self,
        body: &[u8],
        read: impl FnOnce(&mut Decoder<'_>) -> Result<T>,
    ) -> Result<T> {
        let result = self.read_reply(body, read);
        self.reply_decoded();
        result
    }

    fn reply_decoded(&self) {
        let deferred = {
            let mut gate = self.release_gate.lock();
            gate.undecoded = gate.undecoded.saturating_sub(1);
            if gate.undecoded == 0 {
                std::mem::take(&mut gate.deferred)
            } else {
                Vec::new()
            }
        };
        for (handle, references) in deferred {
            self.apply_release(handle, references);
        }
    }

    fn read_reply<T>(
        &self,
        body: &[u8],
        read: impl FnOnce(&mut Decoder<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut decoder = Decoder::new(body, self);
        match decoder.get_u8() {
            Ok(status::OK) => {}
            Ok(status::EXCEPTION) => {
                return match decoder.get_str() {
                    Ok(reason) => Err(Error::RemoteException {
                        reason: reason.to_owned(),
                    }),
                    Err(err) => Err(self.protocol_violation(&err)),
                };
            }
            Ok(tag) => return Err(self.protocol_violation(&Error::UnknownTypeTag { tag })),
            Err(err) => return Err(self.protocol_violation(&err)),
        }

        let mut scope = MessageScope::new(self);
        let result = read(&mut decoder).and_then(|value| decoder.finish().map(|()| value));
        scope.adopt(decoder.take_imported_handles());
        match result {
            Ok(value) => {
                scope.commit();
                Ok(value)
            }
            Err(err) => {
                scope.rollback();
                if err.is_protocol_violation() {
                    Err(self.protocol_violation(&err))
                } else {
                    Err(err)
                }
            }
        }
    }

    pub(crate) fn send_invocation(&self, handle: u32, invocation: &mut Invocation) -> Result<()> {
        self.ensure_valid()?;
        let selector = invocation.selector().ok_or(Error::InvalidTarget)?;

        let outgoing = self.encode_message(|encoder| {
            encoder.put_u32(handle);
            encoder.put_str(selector.name())?;
            encoder.put_str(invocation.signature().types())?;
            encoder.encode_request_arguments(invocation)
        })?;

        if invocation.is_oneway() {
            self.post(MessageKind::Request, wire::FLAG_ONEWAY, outgoing, false)?;
            bump(&self.counters.requests_sent);
            bump(&self.counters.oneway_sent);
            return Ok(());
        }

        let reply = self.call(MessageKind::Request, outgoing)?;
        self.decode_reply(&reply, |decoder| decoder.decode_reply_values(invocation))
    }

    pub(crate) fn remote_signature(
        &self,
        handle: u32,
        selector: &Selector,
    ) -> Result<Option<MethodSignature>> {
        let outgoing = self.encode_message(|encoder| {
            encoder.put_u32(handle);
            encoder.put_str(selector.name())
        })?;
        let reply = self.call(MessageKind::SignatureRequest, outgoing)?;
        self.decode_reply(&reply, |decoder| match decoder.get_u8()? {
            0 => Ok(None),
            1 => MethodSignature::parse(decoder.get_str()?).map(Some),
            tag => Err(Error::UnknownTypeTag { tag }),
        })
    }

    fn send_reply(&self, seq: u32, outgoing: Outgoing) {
        let Outgoing { body, exported } = outgoing;
        let message = wire::build(
            self.local_port.id(),
            self.remote_port.id(),
            Header::new(MessageKind::Reply, seq, 0),
            body,
        );
        {
            let mut exports = self.exports.lock();
            for &handle in &exported {
                exports.note_sent(handle);
            }
        }
        match self.transport.send(&message) {
            Ok(()) => bump(&self.counters.replies_sent),
            Err(err) => {
                self.return_exports(&exported);
                let _ = self.fail_send(err);
            }
        }
    }

    fn send_exception(&self, seq: u32, err: &Error) {
        self.send_reply(seq, Outgoing::plain(wire::exception_body(&err.to_string())));
    }

    fn encode_reply(&self, write: impl FnOnce(&mut Encoder<'_>) -> Result<()>) -> Outgoing {
        let encoded = self.encode_message(|encoder| {
            encoder.put_u8(status::OK);
            write(encoder)
        });
        encoded.unwrap_or_else(|err| {
            oxidex_log::debug!("connection {}: reply not encodable: {err}", self.id);
            Outgoing::plain(wire::exception_body(&err.to_string()))
        })
    }

    // ---- incoming -------------------------------------------------------

    fn dispatch(&self, message: PortMessage) {
        let (header, body) = match wire::split(message) {
            Ok(parts) => parts,
            Err(err) => {
                let _ = self.protocol_violation(&err);
                return;
            }
        };
        match header.kind {
            MessageKind::Reply => self.deliver_reply(header.seq, body),
            MessageKind::Release => self.serve_release(&body),
            MessageKind::Request => self.accept_request(header, &body),
            MessageKind::RootRequest => self.spawn_worker(header, move |this| this.serve_root(header)),
            MessageKind::SignatureRequest => {
                self.spawn_worker(header, move |this| this.serve_signature_request(header, &body));
            }
        }
    }

    fn deliver_reply(&self, seq: u32, body: Vec<u8>) {
        let mut pending = self.pending.lock();
        let delivered = match pending.get_mut(&seq) {
            Some(slot) if slot.is_none() => {
                *slot = Some(body);
                true
            }
            _ => false,
        };
        if delivered {
            self.release_gate.lock().undecoded += 1;
            self.reply_ready.notify_all();
        } else {
            drop(pending);
            oxidex_log::warn!("connection {}: dropping unmatched reply {seq}", self.id);
        }
    }

    /// Runs `work` on a thread of its own. If no thread can be started the
    /// caller gets an exception reply instead.
    fn spawn_worker(&self, header: Header, work: impl FnOnce(&ConnectionInner) + Send + 'static) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let spawned = thread::Builder::new()
            .name(format!("oxidec-do-req-{}", self.id))
            .spawn(move || work(&this));
        if let Err(err) = spawned {
            oxidex_log::error!("connection {}: cannot start request worker: {err}", self.id);
            if !header.is_oneway() {
                self.send_reply(header.seq, Outgoing::plain(wire::exception_body(&err.to_string())));
            }
        }
    }

    fn serve_root(&self, header: Header) {
        let root = self.root.read().clone();
        let reply = self.encode_reply(|encoder| encoder.encode_object(root.as_ref(), false));
        self.send_reply(header.seq, reply);
    }

    fn decode_request(
        &self,
        body: &[u8],
        scope: &mut MessageScope<'_>,
    ) -> Result<(Object, Invocation)> {
        let mut decoder = Decoder::new(body, self);
        let (handle, name) = parse_handle_and_name(&mut decoder)?;
        let sent = MethodSignature::parse(decoder.get_str()?)?;
        let mut invocation = Invocation::new(sent.clone());

        // References in the arguments are counted even if the call is refused.
        let decoded = decoder
            .decode_request_arguments(&mut invocation)
            .and_then(|()| decoder.finish());
        scope.adopt(decoder.take_imported_handles());
        decoded?;

        let target = self.local_object(handle)?;
        let selector = known_selector(name)?;
        sent.check_compatible(&target.method_signature(&selector)?)?;
        invocation.set_selector(selector);
        Ok((target, invocation))
    }

    /// Decodes a request on the reader thread, so that references in it are
    /// resolved in wire order, then dispatches it on a worker.
    fn accept_request(&self, header: Header, body: &[u8]) {
        bump(&self.counters.requests_received);
        let mut scope = MessageScope::new(self);
        match self.decode_request(body, &mut scope) {
            Ok((target, invocation)) => {
                let handles = scope.into_handles();
                self.spawn_worker(header, move |this| {
                    this.perform(header, &target, invocation, handles);
                });
            }
            Err(err) if err.is_protocol_violation() => {
                scope.rollback();
                let _ = self.protocol_violation(&err);
            }
            Err(err) if header.is_oneway() => {
                oxidex_log::debug!("connection {}: oneway request rejected: {err}", self.id);
            }
            Err(err) => self.send_exception(header.seq, &err),
        }
    }

    fn perform(&self, header: Header, target: &Object, mut invocation: Invocation, handles: Vec<u32>) {
        let scope = MessageScope::resume(self, handles);
        let outcome = invocation.invoke_with_target(target);

        if header.is_oneway() {
            if let Err(err) = &outcome {
                oxidex_log::debug!("connection {}: oneway request failed: {err}", self.id);
            }
        } else {
            match outcome {
                Ok(()) => {
                    let reply = self.encode_reply(|encoder| encoder.encode_reply_values(&invocation));
                    self.send_reply(header.seq, reply);
                }
                Err(err) => self.send_exception(header.seq, &err),
            }
        }

        // Decoded arguments stay alive until the reply is out.
        drop(invocation);
        drop(scope);
    }

    fn serve_signature_request(&self, header: Header, body: &[u8]) {
        bump(&self.counters.requests_received);
        let mut decoder = Decoder::new(body, self);
        let parsed = parse_handle_and_name(&mut decoder).and_then(|parsed| {
            decoder.finish()?;
            Ok(parsed)
        });
        let (handle, name) = match parsed {
            Ok(parsed) => parsed,
            Err(err) if err.is_protocol_violation() => {
                let _ = self.protocol_violation(&err);
                return;
            }
            Err(err) => {
                self.send_exception(header.seq, &err);
                return;
            }
        };

        let signature = self.local_object(handle).and_then(|object| {
            let selector = known_selector(name)?;
            object.method_signature(&selector)
        });
        let reply = match signature {
            Ok(signature) => self.encode_reply(|encoder| {
                encoder.put_u8(1);
                encoder.put_str(signature.types())
            }),
            Err(Error::SelectorNotFound { .. }) => self.encode_reply(|encoder| {
                encoder.put_u8(0);
                Ok(())
            }),
            Err(err) => Outgoing::plain(wire::exception_body(&err.to_string())),
        };
        self.send_reply(header.seq, reply);
    }

    fn serve_release(&self, body: &[u8]) {
        let mut decoder = Decoder::new(body, self);
        let parsed = decoder.get_u32().and_then(|handle| {
            let references = decoder.get_u32()?;
            decoder.finish()?;
            Ok((handle, references))
        });
        let (handle, references) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                let _ = self.protocol_violation(&err);
                return;
            }
        };
        {
            let mut gate = self.release_gate.lock();
            if gate.undecoded > 0 {
                gate.deferred.push((handle, references));
                return;
            }
        }
        self.apply_release(handle, references);
    }

    fn apply_release(&self, handle: u32, references: u32) {
        let released = self.exports.lock().release(handle, references);
        if released.is_some() {
            oxidex_log::debug!("connection {}: export {handle} released", self.id);
        }
    }

    // ---- proxy tables ---------------------------------------------------

    fn make_local_proxy(&self, object: &Object, handle: u32) -> Object {
        Object::from_proxy(DistantObject::local(
            self.this.clone(),
            self.id,
            object.clone(),
            handle,
        ))
    }

    /// The object that goes into the export table for `object`: the
    /// wrapped object when `object` is one of this connection's local
    /// proxies.
    fn export_target(&self, object: &Object) -> Object {
        match object.as_proxy() {
            Some(p) if p.is_local() && p.connection_id() == self.id => {
                p.local_object().cloned().unwrap_or_else(|| object.clone())
            }
            _ => object.clone(),
        }
    }

    pub(crate) fn export_proxy(&self, object: &Object) -> Result<Object> {
        self.ensure_valid()?;
        let target = self.export_target(object);
        let (_, proxy) = self
            .exports
            .lock()
            .export(&target, |handle| self.make_local_proxy(&target, handle));
        Ok(proxy)
    }

    pub(crate) fn import_proxy(&self, handle: u32, protocol: Option<&str>) -> Result<Object> {
        self.ensure_valid()?;
        let proxy = self.imports.lock().import(handle, || {
            Object::from_proxy(DistantObject::remote(self.this.clone(), self.id, handle))
        });
        if let Some(name) = protocol
            && let Some(distant) = proxy.as_proxy()
        {
            match Protocol::lookup(name) {
                Some(protocol) => distant.adopt_protocol_if_unset(protocol),
                None => oxidex_log::debug!(
                    "connection {}: peer named unknown protocol {name}",
                    self.id
                ),
            }
        }
        Ok(proxy)
    }

    /// Drops one imported reference, telling the peer when none remain.
    pub(crate) fn release_handle(&self, handle: u32, only_unshared: bool) {
        let released = self.imports.lock().release(handle, only_unshared);
        let Some((proxy, received)) = released else {
            return;
        };
        drop(proxy);
        if !self.is_valid() {
            return;
        }
        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(&handle.to_be_bytes());
        body.extend_from_slice(&received.to_be_bytes());
        if let Err(err) = self.post(MessageKind::Release, 0, Outgoing::plain(body), false) {
            oxidex_log::debug!("connection {}: release of {handle} not sent: {err}", self.id);
        }
    }
}

impl ProxyResolver for ConnectionInner {
    fn export(&self, object: &Object) -> Result<(u32, Option<String>)> {
        self.ensure_valid()?;
        let target = self.export_target(object);
        let (handle, proxy) = {
            let mut exports = self.exports.lock();
            let exported = exports.export(&target, |handle| self.make_local_proxy(&target, handle));
            exports.note_pending(exported.0);
            exported
        };
        let protocol = proxy
            .as_proxy()
            .and_then(DistantObject::protocol)
            .map(|p| p.name().to_owned());
        Ok((handle, protocol))
    }

    fn imported_handle(&self, proxy: &DistantObject) -> Option<u32> {
        (!proxy.is_local() && proxy.connection_id() == self.id).then(|| proxy.handle())
    }

    fn import(&self, handle: u32, protocol: Option<&str>) -> Result<Object> {
        self.import_proxy(handle, protocol)
    }

    fn local_object(&self, handle: u32) -> Result<Object> {
        self.exports
            .lock()
            .get(handle)
            .map(|entry| entry.object.clone())
            .ok_or(Error::InvalidTarget)
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.invalidate();
    }
}
