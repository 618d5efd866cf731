//! The port coder: marshaling values and invocations.
//!
//! Every value on the wire describes itself: one tag byte (the type
//! encoding character) followed by a payload. Multi-byte numbers are big
//! endian.
//!
//! ```text
//! scalar          tag | fixed-width BE bytes
//! C string        '*' | present u8 | len u32 | bytes
//! selector        ':' | present u8 | len u32 | name
//! class           '#' | present u8 | len u32 | wire class name
//! pointer         '^' | presence u8 (0 NULL, 1 pointee follows, 2 withheld) | pointee?
//! struct / array '{' / '[' | count u32 | element ...
//! union           '(' | len u32 | raw bytes
//! object          '@' | kind u8 | ...
//!     NIL
//!     LOCAL_REF   handle u32 | protocol name (len u32 | bytes, empty = none)
//!     REMOTE_REF  handle u32
//!     ARCHIVE     wire class name | ivar count u32 | (name | value) ...
//!     BACKREF     index u32
//! ```
//!
//! A `LOCAL_REF` names an object living in the sender's process; the
//! receiver materializes a proxy for it. A `REMOTE_REF` names an object in
//! the receiver's own process (the sender holds a proxy to it). Archives copy
//! an object by value; each archived object gets the next back-reference
//! index *before* its instance variables are written, so cycles close with a
//! `BACKREF`.
//!
//! The coder never touches connection state directly: object references are
//! resolved through the [`ProxyResolver`] seam.

pub mod decoder;
pub mod encoder;

pub use decoder::Decoder;
pub use encoder::Encoder;

use crate::error::{Error, Result};
use crate::proxy::DistantObject;
use crate::runtime::Object;
use fxhash::FxHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Deepest nesting of archives and aggregates the coder accepts.
pub const MAX_NESTING: usize = 64;

/// Object payload kinds following an `@` tag.
pub mod object_tag {
    /// nil
    pub const NIL: u8 = 0;
    /// An object exported by the sender.
    pub const LOCAL_REF: u8 = 1;
    /// An object of the receiver, echoed back by handle.
    pub const REMOTE_REF: u8 = 2;
    /// An object copied by value.
    pub const ARCHIVE: u8 = 3;
    /// An earlier archive in the same pass.
    pub const BACKREF: u8 = 4;
}

/// Pointer presence bytes.
pub mod presence {
    /// NULL pointer.
    pub const NULL: u8 = 0;
    /// The pointee follows.
    pub const PRESENT: u8 = 1;
    /// Non-NULL, but the pointee travels only in the other direction.
    pub const WITHHELD: u8 = 2;
}

/// Resolves object references against the state of one connection.
pub trait ProxyResolver {
    /// Exports a local object (or a proxy owned by another connection) and
    /// returns its handle plus the name of the protocol attached to the
    /// export, if any. The same object always gets the same handle.
    ///
    /// The use stays pending until the message carrying it is sent or
    /// abandoned; the encoder lists it in
    /// [`Encoder::take_exported_handles`].
    ///
    /// # Errors
    ///
    /// Fails if the connection can no longer export objects.
    fn export(&self, object: &Object) -> Result<(u32, Option<String>)>;

    /// If `proxy` stands for an object of this connection's peer, its handle.
    fn imported_handle(&self, proxy: &DistantObject) -> Option<u32>;

    /// The proxy for a handle the peer exported, created on first use and
    /// counted on every use.
    ///
    /// # Errors
    ///
    /// Fails if the connection is no longer valid.
    fn import(&self, handle: u32, protocol: Option<&str>) -> Result<Object>;

    /// The local object this connection exported under `handle`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTarget`] if nothing is exported under `handle`.
    fn local_object(&self, handle: u32) -> Result<Object>;
}

/// A resolver for coding outside any connection: references are refused,
/// only values and archives can be coded.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedResolver;

impl ProxyResolver for DetachedResolver {
    fn export(&self, _object: &Object) -> Result<(u32, Option<String>)> {
        Err(Error::NotImplemented {
            feature: "object references outside a connection",
        })
    }

    fn imported_handle(&self, _proxy: &DistantObject) -> Option<u32> {
        None
    }

    fn import(&self, _handle: u32, _protocol: Option<&str>) -> Result<Object> {
        Err(Error::NotImplemented {
            feature: "object references outside a connection",
        })
    }

    fn local_object(&self, _handle: u32) -> Result<Object> {
        Err(Error::InvalidTarget)
    }
}

/// In-process class name to wire class name overrides.
///
/// Shared between a connection and every coder it creates; each lookup takes
/// the lock once.
#[derive(Debug, Clone, Default)]
pub struct ClassNameMap {
    names: Arc<RwLock<FxHashMap<String, String>>>,
}

impl ClassNameMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes encoders emit `wire` in place of `local`.
    pub fn set(&self, local: &str, wire: &str) {
        self.names.write().insert(local.to_owned(), wire.to_owned());
    }

    /// Removes the override for `local`.
    pub fn remove(&self, local: &str) {
        self.names.write().remove(local);
    }

    /// The name to put on the wire for `local`.
    #[must_use]
    pub fn wire_name(&self, local: &str) -> String {
        self.names
            .read()
            .get(local)
            .cloned()
            .unwrap_or_else(|| local.to_owned())
    }
}
