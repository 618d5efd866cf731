//! Error types for the `OxideC` distributed objects runtime.
//!
//! Errors fall into three groups with different propagation rules:
//!
//! - **Local programmer errors** (bad signature, bad argument index, wrong
//!   argument kind). These are returned immediately and never touch the state
//!   of a connection.
//! - **Structural wire errors** (unknown type tag, size mismatch, bad UTF-8). When they
//!   happen while decoding, the connection that delivered the bytes is
//!   invalidated, because a garbled shared stream cannot be resynchronized.
//! - **Connection and naming errors** (`ConnectionBroken`, `NameInUse`, ...),
//!   which callers handle by policy.

use std::fmt;

/// Errors that can occur in the distributed objects runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A type-encoding string could not be parsed.
    MalformedSignature {
        /// The offending encoding.
        encoding: String,
        /// What the parser tripped over.
        reason: &'static str,
    },

    /// Invocation argument index outside the explicit argument range.
    ArgumentIndexOutOfRange {
        /// The requested index.
        index: usize,
        /// Number of arguments, including self and _cmd.
        count: usize,
    },

    /// A value of the wrong kind was stored into an argument or return slot.
    ArgumentTypeMismatch {
        /// Type character the signature expects.
        expected: char,
        /// Type character of the supplied value.
        got: char,
        /// Argument index (`usize::MAX` for the return slot).
        index: usize,
    },

    /// The return value was read before the invocation produced one.
    ReturnValueUnavailable,

    /// The invocation has no live target to dispatch to.
    InvalidTarget,

    /// The receiver does not implement the selector.
    SelectorNotFound {
        /// The selector name.
        selector: String,
    },

    /// Class name already exists in the registry.
    ClassAlreadyExists {
        /// The duplicate name.
        name: String,
    },

    /// No class is registered under the name.
    ClassNotFound {
        /// The unknown name.
        name: String,
    },

    /// Protocol name already exists in the registry.
    ProtocolAlreadyExists {
        /// The duplicate name.
        name: String,
    },

    /// The transport closed, timed out, or the peer violated the protocol.
    /// The connection is permanently invalid afterwards.
    ConnectionBroken {
        /// Human-readable cause.
        reason: String,
    },

    /// A decoder met a type tag it does not understand.
    UnknownTypeTag {
        /// The tag byte.
        tag: u8,
    },

    /// Declared and available byte counts disagree.
    SizeMismatch {
        /// Bytes the encoding declared or required.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A decoded string, selector or class name is not valid UTF-8.
    MalformedString {
        /// What the string was meant to name.
        what: &'static str,
    },

    /// An object graph nests deeper than the coder allows.
    NestingTooDeep {
        /// Depth at which encoding stopped.
        depth: usize,
    },

    /// A name is already registered for a different port.
    NameInUse {
        /// The contested name.
        name: String,
    },

    /// No port is registered under the name.
    NameNotFound {
        /// The name that was looked up.
        name: String,
    },

    /// An unsupported qualifier or value was encountered.
    NotImplemented {
        /// What is missing.
        feature: &'static str,
    },

    /// The remote receiver failed while handling a request.
    RemoteException {
        /// The failure as reported by the peer.
        reason: String,
    },

    /// `unlock` was called on a distributed lock this instance does not hold.
    LockNotHeld {
        /// Lock path.
        path: String,
    },

    /// An I/O operation failed outside of a connection.
    Io {
        /// The I/O error kind.
        kind: std::io::ErrorKind,
        /// The I/O error message.
        message: String,
    },
}

impl Error {
    /// Builds a [`Error::ConnectionBroken`] from anything printable.
    pub fn broken(reason: impl fmt::Display) -> Self {
        Error::ConnectionBroken {
            reason: reason.to_string(),
        }
    }

    /// Whether this error means the bytes on the wire can no longer be
    /// trusted, so the connection that carried them must be invalidated.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::UnknownTypeTag { .. }
                | Error::SizeMismatch { .. }
                | Error::MalformedString { .. }
                | Error::MalformedSignature { .. }
                | Error::NestingTooDeep { .. }
        )
    }

    /// Whether this error ends the connection it occurred on.
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::ConnectionBroken { .. }) || self.is_protocol_violation()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedSignature { encoding, reason } => {
                write!(f, "Malformed type encoding '{encoding}': {reason}")
            }
            Error::ArgumentIndexOutOfRange { index, count } => {
                write!(
                    f,
                    "Argument index {index} out of range for {count} arguments"
                )
            }
            Error::ArgumentTypeMismatch {
                expected,
                got,
                index,
            } => {
                write!(
                    f,
                    "Argument type mismatch at index {index}: expected '{expected}', got '{got}'"
                )
            }
            Error::ReturnValueUnavailable => {
                write!(f, "Return value is not available before dispatch")
            }
            Error::InvalidTarget => write!(f, "Invocation target is unset or deallocated"),
            Error::SelectorNotFound { selector } => {
                write!(f, "Receiver does not recognize selector '{selector}'")
            }
            Error::ClassAlreadyExists { name } => {
                write!(f, "Class '{name}' already exists in registry")
            }
            Error::ClassNotFound { name } => write!(f, "Class '{name}' not found"),
            Error::ProtocolAlreadyExists { name } => {
                write!(f, "Protocol '{name}' already exists")
            }
            Error::ConnectionBroken { reason } => {
                write!(f, "Connection broken: {reason}")
            }
            Error::UnknownTypeTag { tag } => {
                write!(f, "Unknown type tag {tag:#04x}")
            }
            Error::SizeMismatch { needed, available } => {
                write!(
                    f,
                    "Size mismatch: needed {needed} bytes, {available} available"
                )
            }
            Error::MalformedString { what } => write!(f, "Invalid UTF-8 in {what}"),
            Error::NestingTooDeep { depth } => {
                write!(f, "Object graph nesting exceeds depth {depth}")
            }
            Error::NameInUse { name } => {
                write!(f, "Name '{name}' is registered to another port")
            }
            Error::NameNotFound { name } => write!(f, "No port registered for '{name}'"),
            Error::NotImplemented { feature } => write!(f, "Not implemented: {feature}"),
            Error::RemoteException { reason } => {
                write!(f, "Remote exception: {reason}")
            }
            Error::LockNotHeld { path } => {
                write!(f, "Distributed lock '{path}' is not held by this instance")
            }
            Error::Io { kind, message } => write!(f, "I/O error ({kind:?}): {message}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type for distributed objects operations.
pub type Result<T> = std::result::Result<T, Error>;
