//! The port message envelope and its wire format.
//!
//! ```text
//! +--------------+---------------+------------------+-------------------+
//! | size (4B BE) | send PortId   | receive PortId   | components ...    |
//! |              | (20B)         | (20B)            |                   |
//! +--------------+---------------+------------------+-------------------+
//!
//! component: | tag u8 (1 data, 2 port) | len u32 BE | bytes |
//! ```
//!
//! `size` counts every byte after itself. A reader consumes exactly
//! [`PREFIX_SIZE`] bytes, learns the size and both port ids, then reads the
//! remaining body as one unit.

use crate::error::{Error, Result};
use crate::port::{PORT_ID_SIZE, PortId};
use std::io::{Read, Write};

/// Size of the length field.
pub const SIZE_FIELD: usize = 4;

/// Bytes a reader must consume before it knows the body length.
pub const PREFIX_SIZE: usize = SIZE_FIELD + 2 * PORT_ID_SIZE;

/// Default maximum encoded message size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Component tag for raw data.
pub const TAG_DATA: u8 = 1;
/// Component tag for a port id.
pub const TAG_PORT: u8 = 2;

const COMPONENT_HEADER: usize = 5;

/// One entry of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    /// Opaque bytes.
    Data(Vec<u8>),
    /// A port reference.
    Port(PortId),
}

impl Component {
    fn encoded_len(&self) -> usize {
        COMPONENT_HEADER
            + match self {
                Component::Data(bytes) => bytes.len(),
                Component::Port(_) => PORT_ID_SIZE,
            }
    }

    /// The data bytes, if this is a data component.
    #[must_use]
    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Component::Data(bytes) => Some(bytes),
            Component::Port(_) => None,
        }
    }

    /// The port id, if this is a port component.
    #[must_use]
    pub fn as_port(&self) -> Option<PortId> {
        match self {
            Component::Port(id) => Some(*id),
            Component::Data(_) => None,
        }
    }
}

/// The fixed-size head of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePrefix {
    /// Bytes following the size field.
    pub payload_size: u32,
    /// Sender's port.
    pub send_port: PortId,
    /// Where replies go.
    pub receive_port: PortId,
}

impl MessagePrefix {
    /// Parses the first [`PREFIX_SIZE`] bytes of a frame.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if the prefix is truncated, declares a size
    /// too small to hold both port ids, or carries an invalid port id.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < PREFIX_SIZE {
            return Err(Error::broken(format!(
                "truncated message prefix: {} of {PREFIX_SIZE} bytes",
                buf.len()
            )));
        }
        let payload_size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if (payload_size as usize) < 2 * PORT_ID_SIZE {
            return Err(Error::broken(format!(
                "declared size {payload_size} cannot hold port ids"
            )));
        }
        let send_port = PortId::from_bytes(&buf[SIZE_FIELD..SIZE_FIELD + PORT_ID_SIZE])
            .map_err(|e| Error::broken(format!("bad send port: {e}")))?;
        let receive_port = PortId::from_bytes(&buf[SIZE_FIELD + PORT_ID_SIZE..PREFIX_SIZE])
            .map_err(|e| Error::broken(format!("bad receive port: {e}")))?;
        Ok(MessagePrefix {
            payload_size,
            send_port,
            receive_port,
        })
    }

    /// Length of the body that follows the prefix.
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.payload_size as usize - 2 * PORT_ID_SIZE
    }

    /// Length of the whole frame.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        SIZE_FIELD + self.payload_size as usize
    }
}

/// Length of the first frame in `buf`, once its size field is buffered.
///
/// Lets a non-blocking reader wait until `buf.len() >= frame_len(buf)`.
#[must_use]
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    let size: [u8; SIZE_FIELD] = buf.get(..SIZE_FIELD)?.try_into().ok()?;
    Some(SIZE_FIELD + u32::from_be_bytes(size) as usize)
}

/// A message: send port, receive port and ordered components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMessage {
    send_port: PortId,
    receive_port: PortId,
    components: Vec<Component>,
}

impl PortMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(send_port: PortId, receive_port: PortId, components: Vec<Component>) -> Self {
        PortMessage {
            send_port,
            receive_port,
            components,
        }
    }

    /// The sender's port.
    #[must_use]
    pub fn send_port(&self) -> PortId {
        self.send_port
    }

    /// The reply port.
    #[must_use]
    pub fn receive_port(&self) -> PortId {
        self.receive_port
    }

    /// The components in order.
    #[must_use]
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Takes the components.
    #[must_use]
    pub fn into_components(self) -> Vec<Component> {
        self.components
    }

    /// Appends a component.
    pub fn push(&mut self, component: Component) {
        self.components.push(component);
    }

    /// Total encoded size including the size field.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        PREFIX_SIZE
            + self
                .components
                .iter()
                .map(Component::encoded_len)
                .sum::<usize>()
    }

    /// Encodes the complete frame.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if the message or a component exceeds the
    /// 32-bit size field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let total = self.encoded_size();
        let payload = u32::try_from(total - SIZE_FIELD).map_err(|_| Error::SizeMismatch {
            needed: total,
            available: u32::MAX as usize,
        })?;

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&payload.to_be_bytes());
        buf.extend_from_slice(self.send_port.as_bytes());
        buf.extend_from_slice(self.receive_port.as_bytes());
        for component in &self.components {
            match component {
                Component::Data(bytes) => {
                    buf.push(TAG_DATA);
                    // Fits: the whole payload passed the u32 check.
                    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                    buf.extend_from_slice(bytes);
                }
                Component::Port(id) => {
                    buf.push(TAG_PORT);
                    buf.extend_from_slice(&(PORT_ID_SIZE as u32).to_be_bytes());
                    buf.extend_from_slice(id.as_bytes());
                }
            }
        }
        debug_assert_eq!(buf.len(), total);
        Ok(buf)
    }

    /// Writes the frame in one call.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if the write fails.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let frame = self.encode()?;
        writer
            .write_all(&frame)
            .and_then(|()| writer.flush())
            .map_err(|e| Error::broken(format!("write failed: {e}")))
    }

    /// Reads one frame: the prefix, then exactly the declared body.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] on EOF, I/O failure, an oversized frame or a
    /// structurally invalid body.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R, max_size: usize) -> Result<Self> {
        let mut prefix = [0u8; PREFIX_SIZE];
        reader
            .read_exact(&mut prefix)
            .map_err(|e| Error::broken(format!("reading prefix: {e}")))?;
        let prefix = MessagePrefix::parse(&prefix)?;
        if prefix.frame_len() > max_size {
            return Err(Error::broken(format!(
                "message of {} bytes exceeds maximum {max_size}",
                prefix.frame_len()
            )));
        }

        let mut body = vec![0u8; prefix.body_len()];
        reader
            .read_exact(&mut body)
            .map_err(|e| Error::broken(format!("reading body: {e}")))?;
        Self::from_parts(prefix, &body)
    }

    /// Decodes a complete frame held in memory.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if the frame is truncated or invalid.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let prefix = MessagePrefix::parse(frame)?;
        if frame.len() != prefix.frame_len() {
            return Err(Error::broken(format!(
                "frame is {} bytes, prefix declares {}",
                frame.len(),
                prefix.frame_len()
            )));
        }
        Self::from_parts(prefix, &frame[PREFIX_SIZE..])
    }

    /// Builds a message from a parsed prefix and its body.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionBroken`] if a component is truncated, has an unknown
    /// tag, or a port component is not a valid port id.
    pub fn from_parts(prefix: MessagePrefix, body: &[u8]) -> Result<Self> {
        let mut components = Vec::new();
        let mut rest = body;
        while !rest.is_empty() {
            if rest.len() < COMPONENT_HEADER {
                return Err(Error::broken("truncated component header"));
            }
            let tag = rest[0];
            let len = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
            let bytes = rest
                .get(COMPONENT_HEADER..COMPONENT_HEADER + len)
                .ok_or_else(|| {
                    Error::broken(format!(
                        "component declares {len} bytes, {} available",
                        rest.len() - COMPONENT_HEADER
                    ))
                })?;
            components.push(match tag {
                TAG_DATA => Component::Data(bytes.to_vec()),
                TAG_PORT => Component::Port(
                    PortId::from_bytes(bytes)
                        .map_err(|e| Error::broken(format!("bad port component: {e}")))?,
                ),
                other => return Err(Error::broken(format!("unknown component tag {other}"))),
            });
            rest = &rest[COMPONENT_HEADER + len..];
        }
        Ok(PortMessage {
            send_port: prefix.send_port,
            receive_port: prefix.receive_port,
            components,
        })
    }
}
