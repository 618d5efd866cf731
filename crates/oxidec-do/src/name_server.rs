//! Port name server: symbolic names for ports.
//!
//! [`LocalNameServer`] keeps two maps in step, name to port and port to its
//! names, under one lock:
//!
//! - every name resolves to a port present in the port map,
//! - a port stays in the port map only while it has at least one name,
//! - invalidating a registered port removes all of its names.
//!
//! Names on other hosts are resolved through a [`NameDaemon`]. The daemon
//! protocol runs over ordinary [`PortMessage`]s:
//!
//! ```text
//! request   Data(op u8 + name) | Data(host) [| Port(id) for register]
//!           op: 'L' lookup, 'R' register, 'U' unregister
//! reply     [Port(id)]   found / registered
//!           []           not found / unregistered
//!           [Data("E")]  registration rejected
//! ```

use crate::error::{Error, Result};
use crate::port::{Component, Port, PortId, PortMessage, Transport};
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Lookup opcode.
pub const OP_LOOKUP: u8 = b'L';
/// Register opcode.
pub const OP_REGISTER: u8 = b'R';
/// Unregister opcode.
pub const OP_UNREGISTER: u8 = b'U';

const REJECTED: &[u8] = b"E";

/// A directory from names to ports.
pub trait PortNameServer: Send + Sync {
    /// Binds `name` to `port`. Binding the same pair again does nothing.
    ///
    /// # Errors
    ///
    /// [`Error::NameInUse`] if `name` is bound to another port.
    fn register_port(&self, port: &Port, name: &str) -> Result<()>;

    /// The port bound to `name` on this host.
    ///
    /// # Errors
    ///
    /// [`Error::NameNotFound`] if nothing is bound.
    fn port_for_name(&self, name: &str) -> Result<Port>;

    /// The port bound to `name` on `host`.
    ///
    /// # Errors
    ///
    /// [`Error::NameNotFound`] if nothing is bound, or whatever the daemon
    /// for `host` reports.
    fn port_for_name_on_host(&self, name: &str, host: &str) -> Result<Port>;

    /// Unbinds `name`.
    ///
    /// # Errors
    ///
    /// [`Error::NameNotFound`] if nothing is bound.
    fn remove_port_for_name(&self, name: &str) -> Result<()>;

    /// Unbinds every name of `port`.
    fn remove_port(&self, port: &Port);
}

/// Resolves names held by the name server of another host.
pub trait NameDaemon: Send + Sync {
    /// The port bound to `name` on `host`, if any.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if the daemon cannot be reached.
    fn lookup(&self, name: &str, host: &str) -> Result<Option<PortId>>;

    /// Binds `name` to `port` on `host`; `false` if the name is taken.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if the daemon cannot be reached.
    fn register(&self, name: &str, host: &str, port: PortId) -> Result<bool>;

    /// Unbinds `name` on `host`.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if the daemon cannot be reached.
    fn unregister(&self, name: &str, host: &str) -> Result<()>;
}

#[derive(Default)]
struct Maps {
    names: FxHashMap<String, Port>,
    ports: FxHashMap<PortId, Vec<String>>,
    /// Ports carrying our invalidation observer.
    observed: FxHashSet<PortId>,
}

impl Maps {
    fn remove_name(&mut self, name: &str) -> Option<Port> {
        let port = self.names.remove(name)?;
        if let Some(names) = self.ports.get_mut(&port.id()) {
            names.retain(|n| n != name);
            if names.is_empty() {
                self.ports.remove(&port.id());
            }
        }
        Some(port)
    }

    fn remove_port(&mut self, id: PortId) -> Vec<String> {
        let names = self.ports.remove(&id).unwrap_or_default();
        for name in &names {
            self.names.remove(name);
        }
        names
    }
}

struct Registry {
    host: String,
    maps: Mutex<Maps>,
    daemon: Option<Arc<dyn NameDaemon>>,
}

/// The in-process name server.
///
/// ```
/// use oxidec_do::name_server::{LocalNameServer, PortNameServer};
/// use oxidec_do::port::Port;
///
/// let names = LocalNameServer::new();
/// let port = Port::new_local();
/// names.register_port(&port, "doc.calculator").unwrap();
/// assert_eq!(names.port_for_name("doc.calculator").unwrap(), port);
///
/// port.invalidate();
/// assert!(names.port_for_name("doc.calculator").is_err());
/// ```
#[derive(Clone)]
pub struct LocalNameServer {
    registry: Arc<Registry>,
}

impl Default for LocalNameServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNameServer {
    /// A name server for `localhost` without a daemon.
    #[must_use]
    pub fn new() -> Self {
        Self::with_daemon("localhost", None)
    }

    /// A name server calling itself `host`, resolving other hosts through
    /// `daemon`.
    #[must_use]
    pub fn with_daemon(host: &str, daemon: Option<Arc<dyn NameDaemon>>) -> Self {
        LocalNameServer {
            registry: Arc::new(Registry {
                host: host.to_owned(),
                maps: Mutex::new(Maps::default()),
                daemon,
            }),
        }
    }

    /// The host name this server answers for.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.registry.host
    }

    /// Every name bound to `port`.
    #[must_use]
    pub fn names_for_port(&self, port: &Port) -> Vec<String> {
        self.registry
            .maps
            .lock()
            .ports
            .get(&port.id())
            .cloned()
            .unwrap_or_default()
    }

    /// Number of bound names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.maps.lock().names.len()
    }

    /// Whether no name is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_local_host(&self, host: &str) -> bool {
        host.is_empty()
            || host == "*"
            || host.eq_ignore_ascii_case("localhost")
            || host == "127.0.0.1"
            || host == "::1"
            || host.eq_ignore_ascii_case(&self.registry.host)
    }
}

fn forget_port(registry: &Weak<Registry>, id: PortId) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let names = {
        let mut maps = registry.maps.lock();
        maps.observed.remove(&id);
        maps.remove_port(id)
    };
    if !names.is_empty() {
        oxidex_log::debug!("port {id} invalidated; dropped names {names:?}");
    }
}

impl PortNameServer for LocalNameServer {
    fn register_port(&self, port: &Port, name: &str) -> Result<()> {
        let newly_tracked = {
            let mut maps = self.registry.maps.lock();
            if let Some(bound) = maps.names.get(name) {
                if bound == port {
                    return Ok(());
                }
                return Err(Error::NameInUse {
                    name: name.to_owned(),
                });
            }
            maps.names.insert(name.to_owned(), port.clone());
            maps.ports.entry(port.id()).or_default().push(name.to_owned());
            maps.observed.insert(port.id())
        };
        oxidex_log::info!("registered {name} -> {}", port.id());

        // Runs at once for a port that is already invalid, so the lock must
        // not be held here.
        if newly_tracked {
            let registry = Arc::downgrade(&self.registry);
            port.on_invalidate(move |id| forget_port(&registry, id));
        }
        Ok(())
    }

    fn port_for_name(&self, name: &str) -> Result<Port> {
        self.registry
            .maps
            .lock()
            .names
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NameNotFound {
                name: name.to_owned(),
            })
    }

    fn port_for_name_on_host(&self, name: &str, host: &str) -> Result<Port> {
        if self.is_local_host(host) {
            match self.port_for_name(name) {
                Err(Error::NameNotFound { .. }) if host == "*" => {}
                found => return found,
            }
        }
        let not_found = || Error::NameNotFound {
            name: name.to_owned(),
        };
        let daemon = self.registry.daemon.as_ref().ok_or_else(not_found)?;
        daemon
            .lookup(name, host)?
            .map(Port::with_id)
            .ok_or_else(not_found)
    }

    fn remove_port_for_name(&self, name: &str) -> Result<()> {
        let removed = self.registry.maps.lock().remove_name(name);
        match removed {
            Some(port) => {
                oxidex_log::info!("unregistered {name} (was {})", port.id());
                Ok(())
            }
            None => Err(Error::NameNotFound {
                name: name.to_owned(),
            }),
        }
    }

    fn remove_port(&self, port: &Port) {
        let names = self.registry.maps.lock().remove_port(port.id());
        if !names.is_empty() {
            oxidex_log::info!("unregistered {names:?} (port {})", port.id());
        }
    }
}

fn request(op: u8, name: &str, host: &str, port: Option<PortId>) -> Vec<Component> {
    let mut op_and_name = Vec::with_capacity(1 + name.len());
    op_and_name.push(op);
    op_and_name.extend_from_slice(name.as_bytes());
    let mut components = vec![
        Component::Data(op_and_name),
        Component::Data(host.as_bytes().to_vec()),
    ];
    components.extend(port.map(Component::Port));
    components
}

/// A [`NameDaemon`] that talks to a [`NameDaemonServer`] over a transport.
///
/// Requests are answered in order, one at a time.
pub struct DaemonClient {
    transport: Box<dyn Transport>,
    in_flight: Mutex<()>,
}

impl DaemonClient {
    /// A client sending over `transport`.
    #[must_use]
    pub fn new(transport: impl Transport) -> Self {
        DaemonClient {
            transport: Box::new(transport),
            in_flight: Mutex::new(()),
        }
    }

    fn round_trip(&self, components: Vec<Component>) -> Result<Vec<Component>> {
        let _in_flight = self.in_flight.lock();
        let message = PortMessage::new(
            self.transport.local_port(),
            self.transport.remote_port(),
            components,
        );
        self.transport.send(&message)?;
        Ok(self.transport.receive()?.into_components())
    }
}

impl NameDaemon for DaemonClient {
    fn lookup(&self, name: &str, host: &str) -> Result<Option<PortId>> {
        match self.round_trip(request(OP_LOOKUP, name, host, None))?.as_slice() {
            [] => Ok(None),
            [Component::Port(id)] => Ok(Some(*id)),
            _ => Err(Error::broken("malformed name daemon reply")),
        }
    }

    fn register(&self, name: &str, host: &str, port: PortId) -> Result<bool> {
        match self
            .round_trip(request(OP_REGISTER, name, host, Some(port)))?
            .as_slice()
        {
            [Component::Port(_)] => Ok(true),
            [Component::Data(flag)] if flag.as_slice() == REJECTED => Ok(false),
            _ => Err(Error::broken("malformed name daemon reply")),
        }
    }

    fn unregister(&self, name: &str, host: &str) -> Result<()> {
        match self
            .round_trip(request(OP_UNREGISTER, name, host, None))?
            .as_slice()
        {
            [] => Ok(()),
            _ => Err(Error::broken("malformed name daemon reply")),
        }
    }
}

impl std::fmt::Debug for DaemonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonClient")
            .field("remote", &self.transport.remote_port())
            .finish()
    }
}

/// Serves a [`LocalNameServer`] to daemon clients.
#[derive(Clone)]
pub struct NameDaemonServer {
    names: LocalNameServer,
}

impl NameDaemonServer {
    /// Serves `names`.
    #[must_use]
    pub fn new(names: LocalNameServer) -> Self {
        NameDaemonServer { names }
    }

    /// Answers requests on `transport` until it closes or the client goes
    /// away.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if a request is malformed or a reply
    /// cannot be written.
    pub fn serve(&self, transport: &dyn Transport) -> Result<()> {
        loop {
            let message = match transport.receive() {
                Ok(message) => message,
                Err(err) => {
                    oxidex_log::debug!("name daemon on {} stopped: {err}", transport.local_port());
                    return Ok(());
                }
            };
            let reply = self.answer(message.components())?;
            transport.send(&PortMessage::new(
                transport.local_port(),
                message.send_port(),
                reply,
            ))?;
        }
    }

    /// The reply to one request.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if the request is malformed.
    pub fn answer(&self, request: &[Component]) -> Result<Vec<Component>> {
        let malformed = || Error::broken("malformed name daemon request");
        let (op_and_name, port) = match request {
            [Component::Data(op_and_name), Component::Data(_host)] => (op_and_name, None),
            [Component::Data(op_and_name), Component::Data(_host), Component::Port(id)] => {
                (op_and_name, Some(*id))
            }
            _ => return Err(malformed()),
        };
        let (&op, name) = op_and_name.split_first().ok_or_else(malformed)?;
        let name = std::str::from_utf8(name).map_err(|_| malformed())?;

        match (op, port) {
            (OP_LOOKUP, None) => Ok(match self.names.port_for_name(name) {
                Ok(port) => vec![Component::Port(port.id())],
                Err(_) => Vec::new(),
            }),
            (OP_REGISTER, Some(id)) => {
                Ok(match self.names.register_port(&Port::with_id(id), name) {
                    Ok(()) => vec![Component::Port(id)],
                    Err(_) => vec![Component::Data(REJECTED.to_vec())],
                })
            }
            (OP_UNREGISTER, None) => {
                let _ = self.names.remove_port_for_name(name);
                Ok(Vec::new())
            }
            _ => Err(malformed()),
        }
    }
}
