//! MemTable: sorted in-memory table of recent mutations
//!
//! Backed by a `crossbeam_skiplist::SkipMap`, so readers (search, point reads,
//! the flush writer on the maintenance thread) run concurrently with the
//! single shard writer without locks.
//!
//! # Lifecycle
//!
//! 1. **Active**: receives committed mutations and replayed WAL records
//! 2. **Frozen**: read-only, being written to a segment; still consulted by reads
//! 3. **Dropped**: once its segment is installed in the manifest

use crate::error::{Result, StorageError};
use crossbeam_skiplist::SkipMap;
use quiver_core::{Key, Lsn, Value, VersionedValue};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Fixed per-entry cost added to key and value sizes.
const ENTRY_OVERHEAD: usize = 32;

/// Sorted table of the latest version of each key.
#[derive(Debug)]
pub struct MemTable {
    map: SkipMap<Key, VersionedValue>,
    size: AtomicUsize,
    frozen: AtomicBool,
    min_lsn: AtomicU64,
    max_lsn: AtomicU64,
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    /// Empty, active table.
    pub fn new() -> Self {
        MemTable {
            map: SkipMap::new(),
            size: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
            min_lsn: AtomicU64::new(Lsn::MAX),
            max_lsn: AtomicU64::new(0),
        }
    }

    /// Record `value` under `key` at `lsn`.
    ///
    /// Returns `false` (and changes nothing) when the table already holds
    /// this key at an equal or newer LSN.
    pub fn insert(&self, key: Key, value: Value, lsn: Lsn) -> Result<bool> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(StorageError::Frozen);
        }
        let new_size = entry_size(&key, &value);
        let old_size = match self.map.get(&key) {
            Some(existing) if existing.value().lsn >= lsn => return Ok(false),
            Some(existing) => entry_size(&key, &existing.value().value),
            None => 0,
        };
        self.map.insert(key, VersionedValue { value, lsn });

        // Single writer: load/store is enough
        let size = self.size.load(Ordering::Relaxed);
        self.size
            .store((size + new_size).saturating_sub(old_size), Ordering::Relaxed);
        self.min_lsn.fetch_min(lsn, Ordering::Relaxed);
        self.max_lsn.fetch_max(lsn, Ordering::Relaxed);
        Ok(true)
    }

    /// Insert path used while replaying the WAL at startup.
    ///
    /// Identical to [`MemTable::insert`]; replaying a record twice is a no-op.
    pub fn replay_insert(&self, key: Key, value: Value, lsn: Lsn) -> Result<bool> {
        self.insert(key, value, lsn)
    }

    /// Latest version of `key`, tombstones included.
    pub fn get(&self, key: &Key) -> Option<VersionedValue> {
        self.map.get(key).map(|e| e.value().clone())
    }

    /// Lazily iterate `[start, end)` in ascending key order.
    ///
    /// `None` bounds are open.
    pub fn range<'a>(
        &'a self,
        start: Option<&Key>,
        end: Option<&Key>,
    ) -> impl Iterator<Item = (Key, VersionedValue)> + 'a {
        let lower = start.map_or(Bound::Unbounded, |k| Bound::Included(k.clone()));
        let upper = end.map_or(Bound::Unbounded, |k| Bound::Excluded(k.clone()));
        self.map
            .range((lower, upper))
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    /// Every entry in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (Key, VersionedValue)> + '_ {
        self.range(None, None)
    }

    /// Approximate memory footprint in bytes.
    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Stop accepting writes. Idempotent.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Whether the table is frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Smallest LSN inserted, if any.
    pub fn min_lsn(&self) -> Option<Lsn> {
        let lsn = self.min_lsn.load(Ordering::Relaxed);
        (lsn != Lsn::MAX).then_some(lsn)
    }

    /// Largest LSN inserted, if any.
    pub fn max_lsn(&self) -> Option<Lsn> {
        let lsn = self.max_lsn.load(Ordering::Relaxed);
        (lsn != 0).then_some(lsn)
    }
}

fn entry_size(key: &Key, value: &Value) -> usize {
    key.len() + value.approximate_size() + ENTRY_OVERHEAD
}
