//! Connection-level message layout.
//!
//! Every connection message is a [`PortMessage`] with two data components:
//!
//! ```text
//! header   kind u8 | sequence u32 | flags u8
//! body     kind-specific, written with the port coder
//! ```
//!
//! | kind               | body                                               |
//! |--------------------|----------------------------------------------------|
//! | `Request`          | handle u32, selector str, types str, arguments     |
//! | `Reply`            | status u8, then values (OK) or reason str           |
//! | `RootRequest`      | empty; reply carries one object                    |
//! | `SignatureRequest` | handle u32, selector str; reply carries present u8 + types str |
//! | `Release`          | handle u32, references u32; never answered         |
//!
//! A reply reuses the sequence number of the request it answers.

use crate::error::{Error, Result};
use crate::port::{Component, PortId, PortMessage};

/// Size of the header component.
pub const HEADER_SIZE: usize = 6;

/// The request will not be answered.
pub const FLAG_ONEWAY: u8 = 0x01;

/// Reply status bytes.
pub mod status {
    /// Values follow.
    pub const OK: u8 = 0;
    /// A reason string follows.
    pub const EXCEPTION: u8 = 1;
}

/// What a connection message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Invoke a method on an exported object.
    Request = 1,
    /// Answer to a request.
    Reply = 2,
    /// Ask for the peer's root object.
    RootRequest = 3,
    /// Ask for a method signature.
    SignatureRequest = 4,
    /// Drop references to an exported object.
    Release = 5,
}

impl MessageKind {
    /// Parses a kind byte.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownTypeTag`] for anything else.
    pub const fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            1 => MessageKind::Request,
            2 => MessageKind::Reply,
            3 => MessageKind::RootRequest,
            4 => MessageKind::SignatureRequest,
            5 => MessageKind::Release,
            tag => return Err(Error::UnknownTypeTag { tag }),
        })
    }

    /// Whether messages of this kind expect a reply unless flagged oneway.
    #[must_use]
    pub const fn expects_reply(self) -> bool {
        matches!(
            self,
            MessageKind::Request | MessageKind::RootRequest | MessageKind::SignatureRequest
        )
    }
}

/// Connection message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message kind.
    pub kind: MessageKind,
    /// Sequence number; replies echo the request's.
    pub seq: u32,
    /// Flag bits.
    pub flags: u8,
}

impl Header {
    /// Creates a header.
    #[must_use]
    pub const fn new(kind: MessageKind, seq: u32, flags: u8) -> Self {
        Header { kind, seq, flags }
    }

    /// Whether the sender waits for no reply.
    #[must_use]
    pub const fn is_oneway(&self) -> bool {
        self.flags & FLAG_ONEWAY != 0
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.kind as u8;
        out[1..5].copy_from_slice(&self.seq.to_be_bytes());
        out[5] = self.flags;
        out
    }

    /// Parses a header.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if `bytes` is not exactly one header,
    /// [`Error::UnknownTypeTag`] for an unknown kind.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; HEADER_SIZE] = bytes.try_into().map_err(|_| Error::SizeMismatch {
            needed: HEADER_SIZE,
            available: bytes.len(),
        })?;
        Ok(Header {
            kind: MessageKind::from_u8(bytes[0])?,
            seq: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            flags: bytes[5],
        })
    }
}

/// Builds a connection message.
#[must_use]
pub fn build(send: PortId, receive: PortId, header: Header, body: Vec<u8>) -> PortMessage {
    PortMessage::new(
        send,
        receive,
        vec![
            Component::Data(header.encode().to_vec()),
            Component::Data(body),
        ],
    )
}

/// Splits a connection message into header and body.
///
/// # Errors
///
/// A protocol violation if the message does not have the two data
/// components.
pub fn split(message: PortMessage) -> Result<(Header, Vec<u8>)> {
    let mut components = message.into_components().into_iter();
    match (components.next(), components.next(), components.next()) {
        (Some(Component::Data(header)), Some(Component::Data(body)), None) => {
            Ok((Header::parse(&header)?, body))
        }
        (first, second, third) => Err(Error::SizeMismatch {
            needed: 2,
            available: [first, second, third].iter().flatten().count(),
        }),
    }
}

/// Body of a reply reporting a failure.
#[must_use]
pub fn exception_body(reason: &str) -> Vec<u8> {
    let reason = reason.as_bytes();
    let len = reason.len().min(u32::MAX as usize);
    let mut body = Vec::with_capacity(5 + len);
    body.push(status::EXCEPTION);
    body.extend_from_slice(&(len as u32).to_be_bytes());
    body.extend_from_slice(&reason[..len]);
    body
}
