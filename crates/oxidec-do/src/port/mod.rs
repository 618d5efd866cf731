//! Ports: addressable message endpoints.
//!
//! A [`PortId`] is the fixed 20-byte wire identity of an endpoint. A
//! [`Port`] wraps an id with a validity flag and invalidation observers;
//! nothing destroys a port implicitly, it is invalidated explicitly and every
//! observer is told exactly once.
//!
//! ```text
//! +--------+----------+-----------+------------------+
//! | family | reserved | port (BE) | address (16B)    |
//! |  u8    |   u8     |   u16     | v4 in first 4B   |
//! +--------+----------+-----------+------------------+
//! ```

pub mod message;
pub mod transport;

pub use message::{Component, MessagePrefix, PREFIX_SIZE, PortMessage, frame_len};
pub use transport::{MemoryTransport, StreamListener, StreamTransport, Transport};

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Encoded size of a [`PortId`].
pub const PORT_ID_SIZE: usize = 20;

/// Family byte of an in-process port.
pub const FAMILY_LOCAL: u8 = 0;
/// Family byte of an IPv4 endpoint.
pub const FAMILY_V4: u8 = 4;
/// Family byte of an IPv6 endpoint.
pub const FAMILY_V6: u8 = 6;

static NEXT_LOCAL_PORT: AtomicU64 = AtomicU64::new(1);

/// The wire identity of an endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId([u8; PORT_ID_SIZE]);

impl PortId {
    /// A fresh, process-unique local id (process id + counter).
    #[must_use]
    pub fn local() -> Self {
        let mut bytes = [0u8; PORT_ID_SIZE];
        bytes[0] = FAMILY_LOCAL;
        bytes[4..8].copy_from_slice(&std::process::id().to_be_bytes());
        let counter = NEXT_LOCAL_PORT.fetch_add(1, Ordering::Relaxed);
        bytes[8..16].copy_from_slice(&counter.to_be_bytes());
        PortId(bytes)
    }

    /// The id of a network endpoint.
    #[must_use]
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let mut bytes = [0u8; PORT_ID_SIZE];
        bytes[2..4].copy_from_slice(&addr.port().to_be_bytes());
        match addr.ip() {
            IpAddr::V4(ip) => {
                bytes[0] = FAMILY_V4;
                bytes[4..8].copy_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                bytes[0] = FAMILY_V6;
                bytes[4..20].copy_from_slice(&ip.octets());
            }
        }
        PortId(bytes)
    }

    /// The socket address of a network id; `None` for local ids.
    #[must_use]
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let port = u16::from_be_bytes([self.0[2], self.0[3]]);
        match self.0[0] {
            FAMILY_V4 => {
                let ip = Ipv4Addr::new(self.0[4], self.0[5], self.0[6], self.0[7]);
                Some(SocketAddr::new(IpAddr::V4(ip), port))
            }
            FAMILY_V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.0[4..20]);
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => None,
        }
    }

    /// Parses an id from its 20-byte encoding.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if `bytes` is not 20 bytes long,
    /// [`Error::UnknownTypeTag`] for an unknown family.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; PORT_ID_SIZE] = bytes.try_into().map_err(|_| Error::SizeMismatch {
            needed: PORT_ID_SIZE,
            available: bytes.len(),
        })?;
        match raw[0] {
            FAMILY_LOCAL | FAMILY_V4 | FAMILY_V6 => Ok(PortId(raw)),
            tag => Err(Error::UnknownTypeTag { tag }),
        }
    }

    /// The 20-byte encoding.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PORT_ID_SIZE] {
        &self.0
    }

    /// The family byte.
    #[must_use]
    pub fn family(&self) -> u8 {
        self.0[0]
    }

    /// Whether this is an in-process id.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0[0] == FAMILY_LOCAL
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "{addr}"),
            None => {
                let pid = u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]]);
                let mut counter = [0u8; 8];
                counter.copy_from_slice(&self.0[8..16]);
                write!(f, "local:{pid}.{}", u64::from_be_bytes(counter))
            }
        }
    }
}

impl fmt::Debug for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortId({self})")
    }
}

type Observer = Box<dyn FnOnce(PortId) + Send>;

struct PortInner {
    id: PortId,
    valid: AtomicBool,
    observers: Mutex<Vec<Observer>>,
}

/// An endpoint with a lifetime.
///
/// Clones share validity and observers. Two ports are equal iff their ids
/// are equal.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    /// A port for an existing id.
    #[must_use]
    pub fn with_id(id: PortId) -> Self {
        Port {
            inner: Arc::new(PortInner {
                id,
                valid: AtomicBool::new(true),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A fresh local port.
    #[must_use]
    pub fn new_local() -> Self {
        Self::with_id(PortId::local())
    }

    /// A port for a network address.
    #[must_use]
    pub fn for_address(addr: SocketAddr) -> Self {
        Self::with_id(PortId::from_socket_addr(addr))
    }

    /// The port's id.
    #[must_use]
    pub fn id(&self) -> PortId {
        self.inner.id
    }

    /// Whether the port has not been invalidated.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// Invalidates the port and notifies observers. Later calls do nothing.
    pub fn invalidate(&self) {
        if !self.inner.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        let observers = std::mem::take(&mut *self.inner.observers.lock());
        oxidex_log::debug!("port {} invalidated", self.inner.id);
        for observer in observers {
            observer(self.inner.id);
        }
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    /// Registers a callback run once when the port is invalidated. Runs
    /// immediately if the port is already invalid.
    pub fn on_invalidate(&self, observer: impl FnOnce(PortId) + Send + 'static) {
        {
            let mut observers = self.inner.observers.lock();
            if self.is_valid() {
                observers.push(Box::new(observer));
                return;
            }
        }
        observer(self.inner.id);
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Port {}

impl Hash for Port {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.inner.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}
