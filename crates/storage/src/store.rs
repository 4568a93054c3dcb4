//! Leveled segment store
//!
//! `LsmStore` owns the segment directory and the MANIFEST. The live segment
//! set is an immutable [`Version`] behind an `ArcSwap`: reads load it without
//! locking, while flush, compaction and quarantine installs are serialized on
//! the manifest lock and publish a new version only after their manifest
//! transaction is durable.
//!
//! A quarantined segment's key range stays fenced off in every later version
//! (and across reopen, via the manifest) until [`LsmStore::install_repair`]
//! resupplies it.
//!
//! # Directory Layout
//!
//! ```text
//! <shard>/
//!   MANIFEST
//!   segments/seg-00000001.qseg (+ sidecars seg-00000001.*)
//!   quarantine/
//! ```

use crate::compaction::CompactionOutput;
use crate::error::{Result, SegmentError, StorageError};
use crate::memtable::MemTable;
use crate::segment::{parse_segment_id, segment_path, Segment, SegmentInfo, SegmentWriter};
use crate::version::{LiveSegment, Version};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use quiver_core::config::CompactionSettings;
use quiver_core::{Key, Lsn, VersionedValue};
use quiver_durability::format::sync_dir;
use quiver_durability::{ManifestEdit, ManifestLog, SegmentDescriptor};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Directory holding live segments
pub const SEGMENTS_DIR: &str = "segments";

/// Directory corrupt segments are moved into
pub const QUARANTINE_DIR: &str = "quarantine";

/// Request for an external replica to resupply a quarantined key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    /// Quarantined segment id
    pub segment_id: u64,
    /// Level it lived on
    pub level: u32,
    /// Smallest key it covered
    pub min_key: Key,
    /// Largest key it covered
    pub max_key: Key,
    /// Smallest LSN it covered
    pub min_lsn: Lsn,
    /// Largest LSN it covered
    pub max_lsn: Lsn,
    /// Why it was quarantined
    pub reason: String,
}

impl RepairRequest {
    fn for_segment(desc: &SegmentDescriptor, reason: &str) -> Self {
        RepairRequest {
            segment_id: desc.id,
            level: desc.level,
            min_key: Key::from(desc.min_key.as_slice()),
            max_key: Key::from(desc.max_key.as_slice()),
            min_lsn: desc.min_lsn,
            max_lsn: desc.max_lsn,
            reason: reason.to_string(),
        }
    }
}

/// Leveled store of immutable segments.
pub struct LsmStore {
    segment_dir: PathBuf,
    quarantine_dir: PathBuf,
    block_size: usize,
    settings: CompactionSettings,
    manifest: Mutex<ManifestLog>,
    version: ArcSwap<Version>,
    repairs: Mutex<Vec<RepairRequest>>,
}

impl LsmStore {
    /// Open the store rooted at `dir`.
    ///
    /// Every segment the manifest references is opened and verified; one that
    /// is missing or fails its checksum is quarantined and a repair requested.
    /// Files the manifest does not reference are leftovers of interrupted
    /// flushes or compactions and are deleted.
    pub fn open(dir: &Path, settings: CompactionSettings, block_size: usize) -> Result<Self> {
        let segment_dir = dir.join(SEGMENTS_DIR);
        let quarantine_dir = dir.join(QUARANTINE_DIR);
        std::fs::create_dir_all(&segment_dir)?;
        let manifest = ManifestLog::open(dir)?;

        let mut live = Vec::new();
        let mut bad = Vec::new();
        for desc in manifest.state().segments.values() {
            let path = segment_path(&segment_dir, desc.id);
            let opened = Segment::open(&path, desc.id).and_then(|seg| {
                seg.verify()?;
                Ok(seg)
            });
            match opened {
                Ok(segment) => live.push(LiveSegment {
                    desc: desc.clone(),
                    segment: Arc::new(segment),
                }),
                Err(e) => {
                    error!(
                        target: "quiver::storage",
                        segment_id = desc.id,
                        error = %e,
                        "Segment failed verification at open"
                    );
                    bad.push((desc.clone(), e.to_string()));
                }
            }
        }

        let store = LsmStore {
            segment_dir,
            quarantine_dir,
            block_size,
            version: ArcSwap::from_pointee(
                Version::from_segments(settings.max_levels, live).with_quarantined(
                    manifest
                        .state()
                        .quarantined
                        .values()
                        .map(|q| q.segment.clone()),
                ),
            ),
            settings,
            manifest: Mutex::new(manifest),
            repairs: Mutex::new(Vec::new()),
        };
        for (desc, reason) in bad {
            store.quarantine_descriptor(&desc, &reason)?;
        }
        store.remove_orphans()?;

        let version = store.version();
        info!(
            target: "quiver::storage",
            segments = version.segment_count(),
            quarantined = version.quarantined().len(),
            checkpoint_lsn = store.checkpoint_lsn(),
            "Opened segment store"
        );
        Ok(store)
    }

    /// Current segment set.
    pub fn version(&self) -> Arc<Version> {
        self.version.load_full()
    }

    /// WAL records at or below this LSN are captured in segments.
    pub fn checkpoint_lsn(&self) -> Lsn {
        self.manifest.lock().checkpoint_lsn()
    }

    /// Newest segment version of `key`, tombstones included.
    pub fn get(&self, key: &Key) -> Result<Option<VersionedValue>> {
        Ok(self.version.load().get(key)?)
    }

    /// Newest segment version of every key in `[start, end)`, ascending.
    ///
    /// Fails if the range intersects a quarantined one.
    pub fn range(&self, start: Option<&Key>, end: Option<&Key>) -> Result<Vec<(Key, VersionedValue)>> {
        let version = self.version();
        if let Some(q) = version.quarantined_in(start.map(Key::as_bytes), end.map(Key::as_bytes)) {
            return Err(SegmentError::Quarantined { id: q.id }.into());
        }
        let mut merged: BTreeMap<Key, VersionedValue> = BTreeMap::new();
        for live in version.segments() {
            for item in live.segment.range(start, end) {
                let (key, value) = item?;
                match merged.get(&key) {
                    Some(existing) if existing.lsn >= value.lsn => {}
                    _ => {
                        merged.insert(key, value);
                    }
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Writer for a fresh segment id.
    pub fn new_segment_writer(&self) -> Result<SegmentWriter> {
        let id = self.manifest.lock().allocate_segment_id();
        Ok(SegmentWriter::create(&self.segment_dir, id, self.block_size)?)
    }

    /// Entries `newer` overwrites, per live segment id.
    fn count_shadowed(&self, newer: &Segment) -> Result<FxHashMap<u64, u64>> {
        let version = self.version();
        let mut counts: FxHashMap<u64, u64> = FxHashMap::default();
        for item in newer.iter() {
            let (key, _) = item?;
            // A corrupt older segment only costs the estimate a key
            if let Ok(Some(id)) = version.locate(&key) {
                *counts.entry(id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Write a frozen MemTable to a new segment. Tombstones are kept.
    ///
    /// Returns `None` for an empty table.
    pub fn flush_memtable(&self, memtable: &MemTable) -> Result<Option<SegmentInfo>> {
        if memtable.is_empty() {
            return Ok(None);
        }
        let mut writer = self.new_segment_writer()?;
        for (key, value) in memtable.iter() {
            writer.add(&key, &value)?;
        }
        let info = writer.finish()?;
        debug!(
            target: "quiver::storage",
            segment_id = info.id,
            entries = info.entries,
            bytes = info.file_size,
            "Flushed MemTable"
        );
        Ok(Some(info))
    }

    /// Install a flushed segment at level 0 and advance the checkpoint, in
    /// one manifest transaction.
    ///
    /// Every key of the new segment marks the version it overwrites as dead
    /// in whichever segment held it, for the compaction picker.
    pub fn install_flush(&self, flushed: Option<&SegmentInfo>, checkpoint: Lsn) -> Result<()> {
        let mut added = Vec::new();
        let mut shadowed = FxHashMap::default();
        if let Some(info) = flushed {
            let segment = Segment::open(&info.path, info.id)?;
            shadowed = self.count_shadowed(&segment)?;
            added.push(LiveSegment {
                desc: info.descriptor(0),
                segment: Arc::new(segment),
            });
        }

        let mut manifest = self.manifest.lock();
        let mut edits: Vec<ManifestEdit> = added
            .iter()
            .map(|live| ManifestEdit::AddSegment(live.desc.clone()))
            .collect();
        edits.push(ManifestEdit::Checkpoint { lsn: checkpoint });
        manifest.commit(edits)?;
        self.version.store(Arc::new(
            self.version.load().apply(added, &[]).with_shadowed(shadowed),
        ));
        manifest.maybe_rewrite(self.settings.manifest_rewrite_after)?;
        info!(
            target: "quiver::storage",
            segment_id = flushed.map(|i| i.id),
            checkpoint_lsn = checkpoint,
            "Installed flush"
        );
        Ok(())
    }

    /// Swap compaction inputs for outputs in one manifest transaction, then
    /// delete the input files.
    ///
    /// Fails with [`StorageError::StaleJob`] (and removes the outputs) if an
    /// input stopped being live while the merge ran.
    pub fn install_compaction(&self, output: &CompactionOutput) -> Result<()> {
        let mut manifest = self.manifest.lock();
        let input_ids = output.job.input_ids();
        if let Some(gone) = input_ids
            .iter()
            .find(|id| !manifest.state().segments.contains_key(id))
        {
            for out in &output.outputs {
                let _ = std::fs::remove_file(&out.path);
            }
            return Err(StorageError::StaleJob(*gone));
        }

        let mut edits = Vec::with_capacity(output.outputs.len() + input_ids.len());
        let mut added = Vec::with_capacity(output.outputs.len());
        for info in &output.outputs {
            let desc = info.descriptor(output.job.target_level);
            let segment = Segment::open(&info.path, info.id)?;
            edits.push(ManifestEdit::AddSegment(desc.clone()));
            added.push(LiveSegment {
                desc,
                segment: Arc::new(segment),
            });
        }
        edits.extend(input_ids.iter().map(|id| ManifestEdit::RemoveSegment { id: *id }));
        manifest.commit(edits)?;
        self.version
            .store(Arc::new(self.version.load().apply(added, &input_ids)));
        manifest.maybe_rewrite(self.settings.manifest_rewrite_after)?;
        drop(manifest);

        for id in &input_ids {
            self.remove_segment_files(*id)?;
        }
        info!(
            target: "quiver::storage",
            removed = input_ids.len(),
            added = output.outputs.len(),
            target_level = output.job.target_level,
            "Installed compaction"
        );
        Ok(())
    }

    /// Move a corrupt segment aside and request repair.
    ///
    /// Returns `false` if the segment is no longer live.
    pub fn quarantine(&self, segment_id: u64, reason: &str) -> Result<bool> {
        let desc = match self.manifest.lock().state().segments.get(&segment_id) {
            Some(desc) => desc.clone(),
            None => return Ok(false),
        };
        self.quarantine_descriptor(&desc, reason)?;
        Ok(true)
    }

    fn quarantine_descriptor(&self, desc: &SegmentDescriptor, reason: &str) -> Result<()> {
        let mut manifest = self.manifest.lock();
        std::fs::create_dir_all(&self.quarantine_dir)?;
        for path in self.segment_files(desc.id)? {
            if let Some(name) = path.file_name() {
                std::fs::rename(&path, self.quarantine_dir.join(name))?;
            }
        }
        sync_dir(&self.segment_dir)?;
        manifest.commit(vec![ManifestEdit::Quarantine {
            segment: desc.clone(),
            reason: reason.to_string(),
        }])?;
        self.version
            .store(Arc::new(self.version.load().quarantine(desc)));
        self.repairs
            .lock()
            .push(RepairRequest::for_segment(desc, reason));
        warn!(
            target: "quiver::storage",
            segment_id = desc.id,
            level = desc.level,
            reason,
            "Quarantined segment, repair requested"
        );
        Ok(())
    }

    /// Install a replica's replacement for quarantined segment `segment_id`
    /// and reopen its key range. `None` means the replica holds nothing in
    /// that range.
    ///
    /// The replacement lands on the quarantined segment's level and must stay
    /// inside its key and LSN bounds. Returns `false` if `segment_id` is not
    /// quarantined.
    pub fn install_repair(&self, segment_id: u64, repaired: Option<&SegmentInfo>) -> Result<bool> {
        let mut manifest = self.manifest.lock();
        let lost = match manifest.state().quarantined.get(&segment_id) {
            Some(q) => q.segment.clone(),
            None => return Ok(false),
        };
        let mut edits = Vec::new();
        let mut added = Vec::new();
        if let Some(info) = repaired {
            let desc = info.descriptor(lost.level);
            if desc.min_key < lost.min_key || desc.max_key > lost.max_key || desc.max_lsn > lost.max_lsn {
                let _ = std::fs::remove_file(&info.path);
                return Err(StorageError::RepairOutOfBounds(segment_id));
            }
            let segment = Segment::open(&info.path, info.id)?;
            segment.verify()?;
            edits.push(ManifestEdit::AddSegment(desc.clone()));
            added.push(LiveSegment {
                desc,
                segment: Arc::new(segment),
            });
        }
        edits.push(ManifestEdit::Repaired { id: segment_id });
        manifest.commit(edits)?;
        self.version
            .store(Arc::new(self.version.load().repair(segment_id, added)));
        drop(manifest);
        self.repairs.lock().retain(|r| r.segment_id != segment_id);
        info!(
            target: "quiver::storage",
            segment_id,
            replacement = repaired.map(|i| i.id),
            "Installed repair"
        );
        Ok(true)
    }

    /// Drain pending repair requests.
    pub fn take_repair_requests(&self) -> Vec<RepairRequest> {
        std::mem::take(&mut *self.repairs.lock())
    }

    /// Repair requests not yet drained.
    pub fn pending_repairs(&self) -> usize {
        self.repairs.lock().len()
    }

    /// Quarantine the segment named by a corruption error, if it is still
    /// live. Returns the id of a newly quarantined segment.
    pub fn quarantine_on_corruption(&self, err: &StorageError) -> Result<Option<u64>> {
        match err {
            StorageError::Segment(SegmentError::Corruption { id, detail }) => {
                Ok(self.quarantine(*id, detail)?.then_some(*id))
            }
            _ => Ok(None),
        }
    }

    /// Directory holding segment files and their sidecars.
    pub fn segment_dir(&self) -> &Path {
        &self.segment_dir
    }

    /// Block size new segments are written with.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Compaction settings.
    pub fn settings(&self) -> &CompactionSettings {
        &self.settings
    }

    /// Segment file plus any sidecars (`seg-NNNNNNNN.*`).
    fn segment_files(&self, id: u64) -> Result<Vec<PathBuf>> {
        let prefix = format!("seg-{:08}.", id);
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.segment_dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    fn remove_segment_files(&self, id: u64) -> Result<()> {
        for path in self.segment_files(id)? {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn remove_orphans(&self) -> Result<()> {
        let live: FxHashSet<u64> = self
            .manifest
            .lock()
            .state()
            .segments
            .keys()
            .copied()
            .collect();
        let mut removed = 0usize;
        for entry in std::fs::read_dir(&self.segment_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let id = name
                .split('.')
                .next()
                .and_then(|stem| parse_segment_id(&format!("{}.qseg", stem)));
            let orphan = match id {
                Some(id) => !live.contains(&id),
                None => name.ends_with(".tmp"),
            };
            if orphan {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            sync_dir(&self.segment_dir)?;
            debug!(target: "quiver::storage", removed, "Removed orphan segment files");
        }
        Ok(())
    }
}
