//! Immutable set of live segments
//!
//! A [`Version`] is never mutated; flushes, compactions and quarantines build
//! a new one and the store swaps it in atomically. Readers holding an older
//! `Arc<Version>` keep its segments mapped until they let go.
//!
//! Level 0 holds flush outputs, which may overlap, ordered newest first.
//! Levels 1 and deeper hold non-overlapping segments ordered by key. For any
//! key, a shallower level always holds the newer version, so point reads stop
//! at the first hit.
//!
//! A version also remembers the descriptors of quarantined segments. A read
//! whose key falls in a quarantined range fails with
//! [`SegmentError::Quarantined`] unless a live segment holds a version newer
//! than anything the quarantined segment could have held.

use crate::error::SegmentError;
use crate::segment::Segment;
use quiver_core::{Key, VersionedValue};
use quiver_durability::SegmentDescriptor;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A live segment with its manifest descriptor.
#[derive(Debug, Clone)]
pub struct LiveSegment {
    /// Manifest descriptor (level, key range, counts)
    pub desc: SegmentDescriptor,
    /// Open segment
    pub segment: Arc<Segment>,
}

impl LiveSegment {
    /// Segment id.
    pub fn id(&self) -> u64 {
        self.desc.id
    }

    /// Level.
    pub fn level(&self) -> u32 {
        self.desc.level
    }
}

/// Immutable leveled segment set.
#[derive(Debug, Clone)]
pub struct Version {
    levels: Vec<Vec<LiveSegment>>,
    quarantined: Vec<SegmentDescriptor>,
    /// Entries per segment known to be overwritten by a newer segment
    shadowed: FxHashMap<u64, u64>,
}

impl Version {
    /// Empty version with `max_levels` levels.
    pub fn new(max_levels: usize) -> Self {
        Version {
            levels: vec![Vec::new(); max_levels.max(1)],
            quarantined: Vec::new(),
            shadowed: FxHashMap::default(),
        }
    }

    /// Build from an unordered set of segments.
    pub fn from_segments(max_levels: usize, segments: impl IntoIterator<Item = LiveSegment>) -> Self {
        let mut version = Version::new(max_levels);
        for seg in segments {
            version.place(seg);
        }
        version.sort();
        version
    }

    /// New version with `added` installed and `removed` ids dropped.
    pub fn apply(&self, added: Vec<LiveSegment>, removed: &[u64]) -> Version {
        let mut next = self.clone();
        for level in &mut next.levels {
            level.retain(|s| !removed.contains(&s.id()));
        }
        next.shadowed.retain(|id, _| !removed.contains(id));
        for seg in added {
            next.place(seg);
        }
        next.sort();
        next
    }

    /// This version with `quarantined` ranges added.
    pub fn with_quarantined(mut self, quarantined: impl IntoIterator<Item = SegmentDescriptor>) -> Self {
        self.quarantined.extend(quarantined);
        self
    }

    /// New version with segment `desc` dropped and its range fenced off.
    pub fn quarantine(&self, desc: &SegmentDescriptor) -> Version {
        let mut next = self.apply(Vec::new(), &[desc.id]);
        next.quarantined.retain(|q| q.id != desc.id);
        next.quarantined.push(desc.clone());
        next
    }

    /// New version with `repaired` installed and quarantined segment `id`'s
    /// range readable again.
    pub fn repair(&self, id: u64, repaired: Vec<LiveSegment>) -> Version {
        let mut next = self.apply(repaired, &[]);
        next.quarantined.retain(|q| q.id != id);
        next
    }

    /// This version with `counts` more entries marked overwritten, per live
    /// segment id. Ids no longer live are ignored.
    pub fn with_shadowed(mut self, counts: impl IntoIterator<Item = (u64, u64)>) -> Self {
        for (id, n) in counts {
            if self.find(id).is_some() {
                *self.shadowed.entry(id).or_insert(0) += n;
            }
        }
        self
    }

    /// Entries of segment `id` overwritten by newer segments since it was
    /// installed. Counted at flush time and not persisted.
    pub fn shadowed(&self, id: u64) -> u64 {
        self.shadowed.get(&id).copied().unwrap_or(0)
    }

    /// Estimated fraction of `seg`'s entries that are dead: tombstones plus
    /// versions overwritten by newer segments.
    pub fn dead_ratio(&self, seg: &LiveSegment) -> f64 {
        if seg.desc.entries == 0 {
            return 0.0;
        }
        let dead = (seg.desc.tombstones + self.shadowed(seg.id())).min(seg.desc.entries);
        dead as f64 / seg.desc.entries as f64
    }

    /// Descriptors of quarantined segments awaiting repair.
    pub fn quarantined(&self) -> &[SegmentDescriptor] {
        &self.quarantined
    }

    /// First quarantined range intersecting `[start, end)`; `None` bounds are
    /// open.
    pub fn quarantined_in(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Option<&SegmentDescriptor> {
        self.quarantined.iter().find(|q| {
            start.map_or(true, |s| s <= q.max_key.as_slice())
                && end.map_or(true, |e| q.min_key.as_slice() < e)
        })
    }

    fn place(&mut self, seg: LiveSegment) {
        let level = seg.level() as usize;
        if level >= self.levels.len() {
            self.levels.resize(level + 1, Vec::new());
        }
        self.levels[level].push(seg);
    }

    fn sort(&mut self) {
        if let Some(l0) = self.levels.first_mut() {
            l0.sort_by(|a, b| {
                b.desc
                    .max_lsn
                    .cmp(&a.desc.max_lsn)
                    .then(b.id().cmp(&a.id()))
            });
        }
        for level in self.levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.desc.min_key.cmp(&b.desc.min_key));
        }
    }

    /// Newest version of `key` across all levels, tombstones included.
    ///
    /// Fails with [`SegmentError::Quarantined`] if a quarantined segment may
    /// hold a newer version than the one found.
    pub fn get(&self, key: &Key) -> Result<Option<VersionedValue>, SegmentError> {
        let found = self.get_live(key)?;
        let k = key.as_bytes();
        let fenced = self.quarantined.iter().find(|q| {
            q.covers_key(k) && found.as_ref().map_or(true, |v| v.lsn <= q.max_lsn)
        });
        match fenced {
            Some(q) => Err(SegmentError::Quarantined { id: q.id }),
            None => Ok(found),
        }
    }

    fn get_live(&self, key: &Key) -> Result<Option<VersionedValue>, SegmentError> {
        Ok(self.newest(key)?.map(|(_, v)| v))
    }

    /// Id of the live segment holding the newest version of `key`.
    pub fn locate(&self, key: &Key) -> Result<Option<u64>, SegmentError> {
        Ok(self.newest(key)?.map(|(id, _)| id))
    }

    fn newest(&self, key: &Key) -> Result<Option<(u64, VersionedValue)>, SegmentError> {
        let k = key.as_bytes();
        for seg in &self.levels[0] {
            if seg.desc.covers_key(k) {
                if let Some(v) = seg.segment.get(key)? {
                    return Ok(Some((seg.id(), v)));
                }
            }
        }
        for level in self.levels.iter().skip(1) {
            let idx = level.partition_point(|s| s.desc.max_key.as_slice() < k);
            if let Some(seg) = level.get(idx) {
                if seg.desc.covers_key(k) {
                    if let Some(v) = seg.segment.get(key)? {
                        return Ok(Some((seg.id(), v)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Number of levels.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Index of the deepest level.
    pub fn bottom_level(&self) -> u32 {
        (self.levels.len() - 1) as u32
    }

    /// Segments at `level`.
    pub fn level(&self, level: u32) -> &[LiveSegment] {
        self.levels
            .get(level as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Total file bytes at `level`.
    pub fn level_bytes(&self, level: u32) -> u64 {
        self.level(level).iter().map(|s| s.desc.file_size).sum()
    }

    /// Every live segment, shallowest level first.
    pub fn segments(&self) -> impl Iterator<Item = &LiveSegment> {
        self.levels.iter().flatten()
    }

    /// Number of live segments.
    pub fn segment_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Live segment by id.
    pub fn find(&self, id: u64) -> Option<&LiveSegment> {
        self.segments().find(|s| s.id() == id)
    }

    /// Segments at `level` whose key range intersects `[min, max]`.
    pub fn overlapping(&self, level: u32, min: &[u8], max: &[u8]) -> Vec<LiveSegment> {
        self.level(level)
            .iter()
            .filter(|s| s.desc.min_key.as_slice() <= max && min <= s.desc.max_key.as_slice())
            .cloned()
            .collect()
    }

    /// Whether any segment deeper than `level` (and not in `excluding`) may
    /// hold an older version of `key`.
    ///
    /// A quarantined range always counts: its repair may bring older
    /// versions back.
    pub fn has_older_overlap(&self, key: &[u8], level: u32, excluding: &[u64]) -> bool {
        self.quarantined.iter().any(|q| q.covers_key(key))
            || self
                .levels
                .iter()
                .skip(level as usize + 1)
                .flatten()
                .any(|s| !excluding.contains(&s.id()) && s.desc.covers_key(key))
    }
}
