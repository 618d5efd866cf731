//! Proxy tables of one connection.
//!
//! The export table maps handles this side handed out to the local objects
//! behind them. Each entry counts how many times its handle went out on the
//! wire; the peer returns that many with `Release` messages, and the entry
//! goes away when the count reaches zero. Handles written into a message
//! that has not been sent yet are `pending`; they become `sent` when the
//! message goes out, or are dropped if it never does.
//!
//! The import table maps the peer's handles to proxies. `count` is the
//! number of unbalanced references held locally; `received` is the number
//! of times the handle arrived, reported back when the entry is dropped.

use crate::runtime::Object;
use fxhash::FxHashMap;

pub(crate) struct ExportEntry {
    pub(crate) object: Object,
    pub(crate) proxy: Object,
    pub(crate) sent: u64,
    pub(crate) pending: u64,
}

pub(crate) struct ExportTable {
    entries: FxHashMap<u32, ExportEntry>,
    by_object: FxHashMap<u64, u32>,
    next_handle: u32,
}

impl Default for ExportTable {
    fn default() -> Self {
        ExportTable {
            entries: FxHashMap::default(),
            by_object: FxHashMap::default(),
            next_handle: 1,
        }
    }
}

impl ExportTable {
    /// The handle and local proxy for `object`, creating both on first use.
    pub(crate) fn export(
        &mut self,
        object: &Object,
        make_proxy: impl FnOnce(u32) -> Object,
    ) -> (u32, Object) {
        if let Some(&handle) = self.by_object.get(&object.id())
            && let Some(entry) = self.entries.get(&handle)
        {
            return (handle, entry.proxy.clone());
        }

        let handle = self.allocate_handle();
        let proxy = make_proxy(handle);
        self.entries.insert(
            handle,
            ExportEntry {
                object: object.clone(),
                proxy: proxy.clone(),
                sent: 0,
                pending: 0,
            },
        );
        self.by_object.insert(object.id(), handle);
        (handle, proxy)
    }

    fn allocate_handle(&mut self) -> u32 {
        loop {
            let handle = self.next_handle;
            self.next_handle = self.next_handle.checked_add(1).unwrap_or(1);
            if !self.entries.contains_key(&handle) {
                return handle;
            }
        }
    }

    pub(crate) fn get(&self, handle: u32) -> Option<&ExportEntry> {
        self.entries.get(&handle)
    }

    /// Records that `handle` was written into a message not yet sent.
    pub(crate) fn note_pending(&mut self, handle: u32) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.pending += 1;
        }
    }

    /// Records that `handle` was written to the wire once more.
    pub(crate) fn note_sent(&mut self, handle: u32) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.pending = entry.pending.saturating_sub(1);
            entry.sent += 1;
        }
    }

    /// Forgets one pending use of `handle` whose message was never sent.
    /// Returns the entry if nothing else refers to it.
    pub(crate) fn note_unsent(&mut self, handle: u32) -> Option<ExportEntry> {
        let entry = self.entries.get_mut(&handle)?;
        entry.pending = entry.pending.saturating_sub(1);
        self.remove_if_unreferenced(handle)
    }

    /// Returns `references` sent references. Returns the entry once none
    /// remain.
    pub(crate) fn release(&mut self, handle: u32, references: u32) -> Option<ExportEntry> {
        let entry = self.entries.get_mut(&handle)?;
        entry.sent = entry.sent.saturating_sub(u64::from(references));
        self.remove_if_unreferenced(handle)
    }

    fn remove_if_unreferenced(&mut self, handle: u32) -> Option<ExportEntry> {
        let entry = self.entries.get(&handle)?;
        if entry.sent > 0 || entry.pending > 0 {
            return None;
        }
        let entry = self.entries.remove(&handle)?;
        self.by_object.remove(&entry.object.id());
        Some(entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Empties the table, handing the entries to the caller so they can be
    /// dropped outside the lock.
    pub(crate) fn drain(&mut self) -> Vec<ExportEntry> {
        self.by_object.clear();
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

pub(crate) struct ImportEntry {
    pub(crate) proxy: Object,
    pub(crate) count: usize,
    pub(crate) received: u32,
}

#[derive(Default)]
pub(crate) struct ImportTable {
    entries: FxHashMap<u32, ImportEntry>,
}

impl ImportTable {
    /// The proxy for `handle`, created on first use; counts one reference.
    pub(crate) fn import(&mut self, handle: u32, make_proxy: impl FnOnce() -> Object) -> Object {
        let entry = self.entries.entry(handle).or_insert_with(|| ImportEntry {
            proxy: make_proxy(),
            count: 0,
            received: 0,
        });
        entry.count += 1;
        entry.received = entry.received.saturating_add(1);
        entry.proxy.clone()
    }

    /// Drops one reference. When the last goes, removes the entry and
    /// returns how many times the handle was received.
    ///
    /// With `only_unshared`, nothing happens while someone besides the table
    /// still holds the proxy.
    pub(crate) fn release(&mut self, handle: u32, only_unshared: bool) -> Option<(Object, u32)> {
        let entry = self.entries.get_mut(&handle)?;
        if only_unshared && entry.proxy.strong_count() > 1 {
            return None;
        }
        entry.count = entry.count.saturating_sub(1);
        if entry.count > 0 {
            return None;
        }
        self.entries
            .remove(&handle)
            .map(|entry| (entry.proxy, entry.received))
    }

    pub(crate) fn count(&self, handle: u32) -> usize {
        self.entries.get(&handle).map_or(0, |entry| entry.count)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<ImportEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Class;
    use std::sync::OnceLock;

    fn class() -> Class {
        static CLASS: OnceLock<Class> = OnceLock::new();
        CLASS
            .get_or_init(|| Class::new_root("TablesTestObject").unwrap())
            .clone()
    }

    #[test]
    fn test_export_reuses_handle() {
        let mut table = ExportTable::default();
        let object = Object::new(&class());
        let (first, proxy) = table.export(&object, |_| Object::new(&class()));
        let (second, again) = table.export(&object, |_| unreachable!());
        assert_eq!(first, second);
        assert!(proxy.ptr_eq(&again));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_export_release_waits_for_all_references() {
        let mut table = ExportTable::default();
        let object = Object::new(&class());
        let (handle, _) = table.export(&object, |_| Object::new(&class()));
        table.note_sent(handle);
        table.note_sent(handle);
        table.note_sent(handle);

        assert!(table.release(handle, 2).is_none());
        assert!(table.get(handle).is_some());
        let entry = table.release(handle, 1).unwrap();
        assert!(entry.object.ptr_eq(&object));
        assert_eq!(table.len(), 0);

        let (fresh, _) = table.export(&object, |_| Object::new(&class()));
        assert_ne!(fresh, handle);
    }

    #[test]
    fn test_unsent_export_is_dropped_unless_shared() {
        let mut table = ExportTable::default();
        let object = Object::new(&class());
        let (handle, _) = table.export(&object, |_| Object::new(&class()));

        // Two messages are being encoded; one goes out, one fails.
        table.note_pending(handle);
        table.note_pending(handle);
        table.note_sent(handle);
        assert!(table.note_unsent(handle).is_none());
        assert_eq!(table.get(handle).map(|e| e.sent), Some(1));

        // A release while another message is still encoding keeps the entry.
        table.note_pending(handle);
        assert!(table.release(handle, 1).is_none());
        assert!(table.note_unsent(handle).is_some());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_import_counts_references() {
        let mut table = ImportTable::default();
        let a = table.import(9, || Object::new(&class()));
        let b = table.import(9, || unreachable!());
        assert!(a.ptr_eq(&b));
        assert_eq!(table.count(9), 2);

        drop(b);
        assert!(table.release(9, false).is_none());
        assert_eq!(table.count(9), 1);
        let (proxy, received) = table.release(9, false).unwrap();
        assert!(proxy.ptr_eq(&a));
        assert_eq!(received, 2);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_unshared_release_skips_held_proxies() {
        let mut table = ImportTable::default();
        let held = table.import(4, || Object::new(&class()));
        assert!(table.release(4, true).is_none());
        assert_eq!(table.count(4), 1);
        drop(held);
        assert!(table.release(4, true).is_some());
    }
}
