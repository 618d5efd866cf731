//! Transports move whole [`PortMessage`]s between two endpoints.
//!
//! The connection layer only needs a blocking duplex link; it knows nothing
//! about sockets. Two implementations are provided:
//!
//! - [`StreamTransport`]: a TCP stream, read in two phases (prefix, then
//!   body under a timeout).
//! - [`MemoryTransport`]: an in-process pair linked by channels, carrying
//!   fully encoded frames so the wire format is still exercised.

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::port::message::{MessagePrefix, PREFIX_SIZE, PortMessage};
use crate::port::PortId;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A blocking, message-oriented duplex link.
///
/// Implementations must be usable from one receiving thread and any number
/// of sending threads at once.
pub trait Transport: Send + Sync + 'static {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if the link is closed or the write fails.
    fn send(&self, message: &PortMessage) -> Result<()>;

    /// Blocks until a message arrives.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] once the link is closed from either side or
    /// a frame is invalid.
    fn receive(&self) -> Result<PortMessage>;

    /// Closes the link. Blocked receivers on both ends wake with an error.
    fn close(&self);

    /// Whether [`Transport::close`] has not been called and the peer is
    /// still there as far as this end knows.
    fn is_open(&self) -> bool;

    /// This end's port id.
    fn local_port(&self) -> PortId;

    /// The peer's port id.
    fn remote_port(&self) -> PortId;
}

// ============================================================================
// TCP
// ============================================================================

/// A transport over a connected [`TcpStream`].
#[derive(Debug)]
pub struct StreamTransport {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    control: TcpStream,
    local: PortId,
    remote: PortId,
    max_message_size: usize,
    body_read_timeout: Option<std::time::Duration>,
    open: AtomicBool,
}

impl StreamTransport {
    /// Connects to `addr`.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the connection cannot be established.
    pub fn connect(addr: SocketAddr, config: &ConnectionConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream, config)
    }

    /// Wraps an already connected stream.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if socket options cannot be applied.
    pub fn from_stream(stream: TcpStream, config: &ConnectionConfig) -> Result<Self> {
        stream.set_nodelay(config.tcp_nodelay)?;
        stream.set_write_timeout(config.send_timeout)?;
        let local = PortId::from_socket_addr(stream.local_addr()?);
        let remote = PortId::from_socket_addr(stream.peer_addr()?);
        oxidex_log::debug!("stream transport {local} <-> {remote}");
        Ok(StreamTransport {
            reader: Mutex::new(stream.try_clone()?),
            writer: Mutex::new(stream.try_clone()?),
            control: stream,
            local,
            remote,
            max_message_size: config.max_message_size,
            body_read_timeout: config.body_read_timeout,
            open: AtomicBool::new(true),
        })
    }

    fn broken(&self, what: &str, err: &std::io::Error) -> Error {
        self.open.store(false, Ordering::Release);
        Error::broken(format!("{what} from {}: {err}", self.remote))
    }
}

impl Transport for StreamTransport {
    fn send(&self, message: &PortMessage) -> Result<()> {
        if !self.is_open() {
            return Err(Error::broken("transport closed"));
        }
        let mut writer = self.writer.lock();
        message.write_to(&mut *writer).inspect_err(|_| {
            self.open.store(false, Ordering::Release);
        })
    }

    fn receive(&self) -> Result<PortMessage> {
        let mut reader = self.reader.lock();

        // Phase 1: wait as long as it takes for the next prefix.
        let mut prefix = [0u8; PREFIX_SIZE];
        reader
            .set_read_timeout(None)
            .map_err(|e| self.broken("configuring", &e))?;
        reader
            .read_exact(&mut prefix)
            .map_err(|e| self.broken("reading prefix", &e))?;
        let prefix = MessagePrefix::parse(&prefix)?;
        if prefix.frame_len() > self.max_message_size {
            self.open.store(false, Ordering::Release);
            return Err(Error::broken(format!(
                "message of {} bytes exceeds maximum {}",
                prefix.frame_len(),
                self.max_message_size
            )));
        }

        // Phase 2: the body must follow promptly.
        reader
            .set_read_timeout(self.body_read_timeout)
            .map_err(|e| self.broken("configuring", &e))?;
        let mut body = vec![0u8; prefix.body_len()];
        reader.read_exact(&mut body).map_err(|e| {
            if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                self.broken("body timed out", &e)
            } else {
                self.broken("reading body", &e)
            }
        })?;
        PortMessage::from_parts(prefix, &body)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            // The peer may already be gone; nothing to do about it.
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn local_port(&self) -> PortId {
        self.local
    }

    fn remote_port(&self) -> PortId {
        self.remote
    }
}

/// Accepts [`StreamTransport`]s.
#[derive(Debug)]
pub struct StreamListener {
    listener: TcpListener,
    config: ConnectionConfig,
}

impl StreamListener {
    /// Binds a listening socket with address reuse enabled.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the socket cannot be created or bound.
    pub fn bind(addr: SocketAddr, config: ConnectionConfig) -> Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        let listener: TcpListener = socket.into();
        oxidex_log::info!("listening on {}", listener.local_addr()?);
        Ok(StreamListener { listener, config })
    }

    /// The bound address (useful after binding port 0).
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The port id peers reach this listener at.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the socket has no local address.
    pub fn port_id(&self) -> Result<PortId> {
        Ok(PortId::from_socket_addr(self.local_addr()?))
    }

    /// Blocks until a peer connects.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if accepting fails.
    pub fn accept(&self) -> Result<StreamTransport> {
        let (stream, peer) = self.listener.accept()?;
        oxidex_log::debug!("accepted {peer}");
        StreamTransport::from_stream(stream, &self.config)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// One end of an in-process duplex link.
pub struct MemoryTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    // Dropping the shared sender disconnects `shutdown` on both ends.
    shutdown_tx: Arc<Mutex<Option<Sender<()>>>>,
    shutdown: Receiver<()>,
    closed: Arc<AtomicBool>,
    local: PortId,
    remote: PortId,
    sent: AtomicU64,
}

impl MemoryTransport {
    /// Creates two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = channel::unbounded();
        let (tx_b, rx_b) = channel::unbounded();
        let (shutdown_tx, shutdown) = channel::bounded(0);
        let shutdown_tx = Arc::new(Mutex::new(Some(shutdown_tx)));
        let closed = Arc::new(AtomicBool::new(false));
        let (port_a, port_b) = (PortId::local(), PortId::local());

        let a = MemoryTransport {
            tx: tx_a,
            rx: rx_b,
            shutdown_tx: shutdown_tx.clone(),
            shutdown: shutdown.clone(),
            closed: closed.clone(),
            local: port_a,
            remote: port_b,
            sent: AtomicU64::new(0),
        };
        let b = MemoryTransport {
            tx: tx_b,
            rx: rx_a,
            shutdown_tx,
            shutdown,
            closed,
            local: port_b,
            remote: port_a,
            sent: AtomicU64::new(0),
        };
        (a, b)
    }

    /// Frames successfully sent from this end.
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: &PortMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::broken("transport closed"));
        }
        let frame = message.encode()?;
        self.tx
            .send(frame)
            .map_err(|_| Error::broken("peer dropped"))?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn receive(&self) -> Result<PortMessage> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::broken("transport closed"));
        }
        crossbeam::channel::select! {
            recv(self.rx) -> frame => match frame {
                Ok(frame) => PortMessage::decode(&frame),
                Err(_) => Err(Error::broken("peer dropped")),
            },
            recv(self.shutdown) -> _ => Err(Error::broken("transport closed")),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown_tx.lock().take();
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn local_port(&self) -> PortId {
        self.local
    }

    fn remote_port(&self) -> PortId {
        self.remote
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish()
    }
}
