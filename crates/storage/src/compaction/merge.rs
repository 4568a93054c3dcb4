use super::{CompactInfo, CompactionJob};
use crate::error::{Result, StorageError};
use crate::rate_limit::CompactionThrottle;
use crate::segment::{format::entry_len, SegmentInfo, SegmentIter, SegmentWriter};
use crate::store::LsmStore;
use quiver_core::{Key, VersionedValue};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;
use tracing::{debug, info};

/// Segments written by a compaction, not yet installed.
#[derive(Debug, Clone)]
pub struct CompactionOutput {
    /// The job that produced them
    pub job: CompactionJob,
    /// Finished output segments, ascending key order
    pub outputs: Vec<SegmentInfo>,
    /// Statistics
    pub info: CompactInfo,
}

struct HeapEntry {
    key: Key,
    value: VersionedValue,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap: smallest key first, then highest LSN
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then(self.value.lsn.cmp(&other.value.lsn))
    }
}

/// Merge the job's inputs into new segments at the target level.
///
/// The newest version of each key survives. A tombstone is dropped when no
/// segment deeper than the target level can still hold an older version of
/// its key. Output files are removed again if the merge fails.
pub fn compact(
    store: &LsmStore,
    job: &CompactionJob,
    throttle: &mut CompactionThrottle,
) -> Result<CompactionOutput> {
    let started = Instant::now();
    let waited_before = throttle.waited();
    let mut info = CompactInfo {
        segments_in: job.inputs.len(),
        ..CompactInfo::default()
    };
    let mut outputs = Vec::new();

    match merge_into(store, job, throttle, &mut info, &mut outputs) {
        Ok(()) => {
            info.segments_out = outputs.len();
            info.throttled = throttle.waited().saturating_sub(waited_before);
            info.duration = started.elapsed();
            info!(
                target: "quiver::compaction",
                reason = ?job.reason,
                target_level = job.target_level,
                segments_in = info.segments_in,
                segments_out = info.segments_out,
                entries_in = info.entries_in,
                entries_out = info.entries_out,
                tombstones_dropped = info.tombstones_dropped,
                bytes_written = info.bytes_written,
                throttled_ms = info.throttled.as_millis() as u64,
                "Compaction merged"
            );
            Ok(CompactionOutput {
                job: job.clone(),
                outputs,
                info,
            })
        }
        Err(e) => {
            for out in &outputs {
                let _ = std::fs::remove_file(&out.path);
            }
            Err(e)
        }
    }
}

fn merge_into(
    store: &LsmStore,
    job: &CompactionJob,
    throttle: &mut CompactionThrottle,
    info: &mut CompactInfo,
    outputs: &mut Vec<SegmentInfo>,
) -> Result<()> {
    let version = store.version();
    let input_ids = job.input_ids();
    let target_bytes = store.settings().target_segment_bytes;

    let mut sources: Vec<SegmentIter<'_>> = job.inputs.iter().map(|s| s.segment.iter()).collect();
    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (i, src) in sources.iter_mut().enumerate() {
        push_next(&mut heap, src, i)?;
    }

    let mut writer: Option<SegmentWriter> = None;
    let mut last_key: Option<Key> = None;

    while let Some(top) = heap.pop() {
        push_next(&mut heap, &mut sources[top.source], top.source)?;
        info.entries_in += 1;

        if last_key.as_ref() == Some(&top.key) {
            info.versions_dropped += 1;
            continue;
        }
        last_key = Some(top.key.clone());

        if top.value.value.is_tombstone()
            && !version.has_older_overlap(top.key.as_bytes(), job.target_level, &input_ids)
        {
            info.tombstones_dropped += 1;
            continue;
        }

        if writer.is_none() {
            writer = Some(store.new_segment_writer()?);
        }
        let mut full = false;
        if let Some(w) = writer.as_mut() {
            throttle.charge(entry_len(&top.key, &top.value.value) as u64);
            w.add(&top.key, &top.value)?;
            info.entries_out += 1;
            full = w.bytes_written() >= target_bytes;
        }
        if full {
            if let Some(done) = writer.take() {
                finish_output(done, info, outputs)?;
            }
        }
    }
    if let Some(last) = writer.take() {
        finish_output(last, info, outputs)?;
    }
    Ok(())
}

fn push_next(
    heap: &mut BinaryHeap<HeapEntry>,
    source: &mut SegmentIter<'_>,
    index: usize,
) -> Result<()> {
    if let Some(next) = source.next() {
        let (key, value) = next.map_err(StorageError::from)?;
        heap.push(HeapEntry {
            key,
            value,
            source: index,
        });
    }
    Ok(())
}

fn finish_output(
    writer: SegmentWriter,
    info: &mut CompactInfo,
    outputs: &mut Vec<SegmentInfo>,
) -> Result<()> {
    let seg = writer.finish()?;
    debug!(
        target: "quiver::compaction",
        segment_id = seg.id,
        entries = seg.entries,
        bytes = seg.file_size,
        "Compaction output written"
    );
    info.bytes_written += seg.file_size;
    outputs.push(seg);
    Ok(())
}
