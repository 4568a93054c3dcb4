//! Read path shared by point reads and search reranking.
//!
//! Lookups go newest to oldest: the active MemTable, frozen MemTables from
//! the most recently frozen, then the segment store. The first version found
//! wins, tombstones included.

use quiver_core::{Key, VectorRecord, VersionedValue};
use quiver_index::{IndexError, VectorSource};
use quiver_storage::{LsmStore, MemTable, StorageError};
use rustc_hash::FxHashSet;
use std::cell::RefCell;
use std::sync::Arc;

/// Consistent view over a shard's MemTables and segments.
pub struct ShardReader<'a> {
    active: &'a MemTable,
    frozen: &'a [Arc<MemTable>],
    store: &'a LsmStore,
    storage_error: RefCell<Option<StorageError>>,
}

impl<'a> ShardReader<'a> {
    /// View over `active`, `frozen` (oldest first) and `store`.
    pub fn new(active: &'a MemTable, frozen: &'a [Arc<MemTable>], store: &'a LsmStore) -> Self {
        ShardReader {
            active,
            frozen,
            store,
            storage_error: RefCell::new(None),
        }
    }

    /// Newest version of `key`, tombstones included.
    pub fn get_versioned(&self, key: &Key) -> Result<Option<VersionedValue>, StorageError> {
        if let Some(v) = self.active.get(key) {
            return Ok(Some(v));
        }
        for table in self.frozen.iter().rev() {
            if let Some(v) = table.get(key) {
                return Ok(Some(v));
            }
        }
        self.store.get(key)
    }

    /// Current record of `key`; `None` if absent or deleted.
    pub fn get(&self, key: &Key) -> Result<Option<VectorRecord>, StorageError> {
        Ok(self
            .get_versioned(key)?
            .and_then(|v| v.value.into_record()))
    }

    /// Storage error swallowed while serving the index, if any.
    ///
    /// The index only sees a string; the caller uses the original to decide
    /// whether a segment must be quarantined.
    pub fn take_storage_error(&self) -> Option<StorageError> {
        self.storage_error.borrow_mut().take()
    }
}

impl VectorSource for ShardReader<'_> {
    fn current(&self, key: &Key) -> quiver_index::Result<Option<Vec<f32>>> {
        match self.get(key) {
            Ok(record) => Ok(record.map(|r| r.vector)),
            Err(e) => {
                let msg = e.to_string();
                self.storage_error.borrow_mut().get_or_insert(e);
                Err(IndexError::Source(msg))
            }
        }
    }

    fn for_each_unindexed(&self, visit: &mut dyn FnMut(&Key, &[f32])) -> quiver_index::Result<()> {
        let mut seen: FxHashSet<Key> = FxHashSet::default();
        let tables = std::iter::once(self.active).chain(self.frozen.iter().rev().map(|t| &**t));
        for table in tables {
            for (key, entry) in table.iter() {
                if seen.contains(&key) {
                    continue;
                }
                if let Some(record) = entry.value.as_record() {
                    visit(&key, &record.vector);
                }
                seen.insert(key);
            }
        }
        Ok(())
    }
}
