//! Index slices for segments
//!
//! Every live segment has a `.vidx` sidecar next to it holding the HNSW slice
//! of its records. Slices are built when a segment is written and reloaded
//! at startup; a missing, corrupt or mismatched sidecar is rebuilt from the
//! segment.

use quiver_core::{IndexSettings, Key, Result};
use quiver_index::{sidecar_path, HnswBuilder, IndexSlice};
use quiver_storage::{LiveSegment, MemTable, Segment};
use std::sync::Arc;
use tracing::{debug, warn};

/// Build the slice of `segment` and persist it as its sidecar.
pub fn build_for_segment(segment: &Segment, settings: &IndexSettings) -> Result<Arc<IndexSlice>> {
    let mut builder = HnswBuilder::new(settings.clone());
    for item in segment.iter() {
        let (key, entry) = item.map_err(quiver_storage::StorageError::from)?;
        if let Some(record) = entry.value.as_record() {
            insert_record(&mut builder, key, &record.vector, settings)?;
        }
    }
    persist(builder, segment.id(), segment.path())
}

/// Build the slice for a segment just flushed from `memtable`.
///
/// Reads the MemTable instead of the new file; both hold the same records.
pub fn build_for_flush(
    memtable: &MemTable,
    segment_id: u64,
    segment_path: &std::path::Path,
    settings: &IndexSettings,
) -> Result<Arc<IndexSlice>> {
    let mut builder = HnswBuilder::new(settings.clone());
    for (key, entry) in memtable.iter() {
        if let Some(record) = entry.value.as_record() {
            insert_record(&mut builder, key, &record.vector, settings)?;
        }
    }
    persist(builder, segment_id, segment_path)
}

/// Load the sidecar of a live segment, rebuilding it when unusable.
pub fn load_or_rebuild(live: &LiveSegment, settings: &IndexSettings) -> Result<Arc<IndexSlice>> {
    let path = sidecar_path(live.segment.path());
    match IndexSlice::open(&path) {
        Ok(slice)
            if slice.segment_id() == live.id()
                && slice.dimension() == settings.dimension
                && slice.metric() == settings.metric =>
        {
            debug!(
                target: "quiver::index",
                segment_id = live.id(),
                nodes = slice.len(),
                "Loaded index slice"
            );
            Ok(Arc::new(slice))
        }
        Ok(_) => {
            warn!(
                target: "quiver::index",
                segment_id = live.id(),
                "Index slice does not match shard settings, rebuilding"
            );
            build_for_segment(&live.segment, settings)
        }
        Err(e) => {
            warn!(
                target: "quiver::index",
                segment_id = live.id(),
                error = %e,
                "Index slice unusable, rebuilding"
            );
            build_for_segment(&live.segment, settings)
        }
    }
}

fn insert_record(
    builder: &mut HnswBuilder,
    key: Key,
    vector: &[f32],
    settings: &IndexSettings,
) -> Result<()> {
    // Records of another dimension predate a settings change; they stay
    // readable but are not searchable
    if vector.len() != settings.dimension {
        return Ok(());
    }
    builder.insert(key, vector)?;
    Ok(())
}

fn persist(
    builder: HnswBuilder,
    segment_id: u64,
    segment_path: &std::path::Path,
) -> Result<Arc<IndexSlice>> {
    let slice = builder.build(segment_id)?;
    slice.write_to(&sidecar_path(segment_path))?;
    debug!(
        target: "quiver::index",
        segment_id,
        nodes = slice.len(),
        "Built index slice"
    );
    Ok(Arc::new(slice))
}
