//! Per-message reference bookkeeping.
//!
//! Decoding an object reference takes one count on its proxy. A
//! [`MessageScope`] collects those counts for one inbound message and
//! settles them when the message is done:
//!
//! - `commit` keeps them (a reply value now owned by the caller),
//! - `rollback` returns all of them (the decode failed),
//! - dropping the scope returns the ones whose proxy nobody kept.

use crate::connection::ConnectionInner;

pub(crate) struct MessageScope<'c> {
    connection: &'c ConnectionInner,
    imported: Vec<u32>,
}

impl<'c> MessageScope<'c> {
    pub(crate) fn new(connection: &'c ConnectionInner) -> Self {
        MessageScope {
            connection,
            imported: Vec::new(),
        }
    }

    /// Takes over counts a scope on another thread handed off with
    /// [`MessageScope::into_handles`].
    pub(crate) fn resume(connection: &'c ConnectionInner, imported: Vec<u32>) -> Self {
        MessageScope {
            connection,
            imported,
        }
    }

    pub(crate) fn into_handles(mut self) -> Vec<u32> {
        std::mem::take(&mut self.imported)
    }

    pub(crate) fn adopt(&mut self, handles: Vec<u32>) {
        self.imported.extend(handles);
    }

    pub(crate) fn commit(mut self) {
        self.imported.clear();
    }

    pub(crate) fn rollback(mut self) {
        for handle in std::mem::take(&mut self.imported) {
            self.connection.release_handle(handle, false);
        }
    }
}

impl Drop for MessageScope<'_> {
    fn drop(&mut self) {
        for handle in self.imported.drain(..) {
            self.connection.release_handle(handle, true);
        }
    }
}
