//! Segment writer
//!
//! Entries are added in strictly ascending key order. The file is written
//! under a temporary name and renamed into place by [`SegmentWriter::finish`]
//! after an fsync, so a crash never leaves a partial segment under a live
//! name. A writer dropped without finishing removes its temporary file.

use super::format::{
    encode_entry, encode_index, entry_len, frame_block, segment_path, BlockHandle, SegmentFooter,
    BLOCK_HEADER_SIZE, BLOCK_TRAILER_SIZE, FOOTER_SIZE,
};
use crate::error::SegmentError;
use quiver_core::{Key, Lsn, VersionedValue};
use quiver_durability::format::sync_dir;
use quiver_durability::SegmentDescriptor;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Summary of a finished segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Segment id
    pub id: u64,
    /// Final path
    pub path: PathBuf,
    /// Smallest key
    pub min_key: Key,
    /// Largest key
    pub max_key: Key,
    /// Smallest LSN
    pub min_lsn: Lsn,
    /// Largest LSN
    pub max_lsn: Lsn,
    /// Entries, tombstones included
    pub entries: u64,
    /// Tombstones
    pub tombstones: u64,
    /// File size in bytes
    pub file_size: u64,
}

impl SegmentInfo {
    /// Manifest descriptor placing this segment at `level`.
    pub fn descriptor(&self, level: u32) -> SegmentDescriptor {
        SegmentDescriptor {
            id: self.id,
            level,
            min_key: self.min_key.as_bytes().to_vec(),
            max_key: self.max_key.as_bytes().to_vec(),
            min_lsn: self.min_lsn,
            max_lsn: self.max_lsn,
            entries: self.entries,
            tombstones: self.tombstones,
            file_size: self.file_size,
        }
    }
}

/// Streams sorted entries into a new segment file.
pub struct SegmentWriter {
    id: u64,
    tmp_path: PathBuf,
    final_path: PathBuf,
    out: Option<BufWriter<File>>,
    block_size: usize,
    hasher: crc32fast::Hasher,
    offset: u64,

    block: Vec<u8>,
    block_count: u32,
    block_first_key: Option<Key>,
    handles: Vec<BlockHandle>,

    min_key: Option<Key>,
    last_key: Option<Key>,
    entries: u64,
    tombstones: u64,
    min_lsn: Lsn,
    max_lsn: Lsn,
}

impl SegmentWriter {
    /// Start segment `id` in `dir` with `block_size`-aligned blocks.
    pub fn create(dir: &Path, id: u64, block_size: usize) -> Result<Self, SegmentError> {
        let final_path = segment_path(dir, id);
        let tmp_path = final_path.with_extension("qseg.tmp");
        let file = File::create(&tmp_path)?;
        Ok(SegmentWriter {
            id,
            tmp_path,
            final_path,
            out: Some(BufWriter::new(file)),
            block_size: block_size.max(FOOTER_SIZE),
            hasher: crc32fast::Hasher::new(),
            offset: 0,
            block: Vec::with_capacity(block_size),
            block_count: 0,
            block_first_key: None,
            handles: Vec::new(),
            min_key: None,
            last_key: None,
            entries: 0,
            tombstones: 0,
            min_lsn: Lsn::MAX,
            max_lsn: 0,
        })
    }

    /// Append one entry. Keys must be strictly ascending.
    pub fn add(&mut self, key: &Key, entry: &VersionedValue) -> Result<(), SegmentError> {
        if self.last_key.as_ref().is_some_and(|last| last >= key) {
            return Err(SegmentError::OutOfOrder);
        }
        let len = entry_len(key, &entry.value);
        if self.block_count > 0
            && BLOCK_HEADER_SIZE + self.block.len() + len + BLOCK_TRAILER_SIZE > self.block_size
        {
            self.flush_block()?;
        }
        if self.block_count == 0 {
            self.block_first_key = Some(key.clone());
        }
        encode_entry(&mut self.block, key, entry);
        self.block_count += 1;

        if self.min_key.is_none() {
            self.min_key = Some(key.clone());
        }
        self.last_key = Some(key.clone());
        self.entries += 1;
        if entry.value.is_tombstone() {
            self.tombstones += 1;
        }
        self.min_lsn = self.min_lsn.min(entry.lsn);
        self.max_lsn = self.max_lsn.max(entry.lsn);
        Ok(())
    }

    /// Entries added so far.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Bytes written plus bytes buffered in the open block.
    pub fn bytes_written(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    /// Segment id being written.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Write the index and footer, fsync, and rename into place.
    pub fn finish(mut self) -> Result<SegmentInfo, SegmentError> {
        let (Some(min_key), Some(max_key)) = (self.min_key.clone(), self.last_key.clone()) else {
            return Err(SegmentError::Empty);
        };
        self.flush_block()?;

        let index_offset = self.offset;
        let index = frame_block(
            self.handles.len() as u32,
            &encode_index(&self.handles),
            self.block_size,
        );
        self.write_region(&index)?;

        let fill = vec![0u8; self.block_size - FOOTER_SIZE];
        self.write_region(&fill)?;
        let footer = SegmentFooter {
            block_size: self.block_size as u32,
            entries: self.entries,
            tombstones: self.tombstones,
            min_lsn: self.min_lsn,
            max_lsn: self.max_lsn,
            index_offset,
            index_len: index.len() as u64,
            segment_crc: self.hasher.clone().finalize(),
        };
        self.write_region(&footer.to_bytes())?;

        let out = self
            .out
            .take()
            .ok_or_else(|| SegmentError::corruption(self.id, "writer already finished"))?;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.tmp_path, &self.final_path)?;
        if let Some(dir) = self.final_path.parent() {
            sync_dir(dir)?;
        }

        Ok(SegmentInfo {
            id: self.id,
            path: self.final_path.clone(),
            min_key,
            max_key,
            min_lsn: self.min_lsn,
            max_lsn: self.max_lsn,
            entries: self.entries,
            tombstones: self.tombstones,
            file_size: self.offset,
        })
    }

    fn flush_block(&mut self) -> Result<(), SegmentError> {
        if self.block_count == 0 {
            return Ok(());
        }
        let framed = frame_block(self.block_count, &self.block, self.block_size);
        let first_key = self
            .block_first_key
            .take()
            .unwrap_or_else(|| Key::new(Vec::new()));
        self.handles.push(BlockHandle {
            first_key,
            offset: self.offset,
            len: framed.len() as u32,
        });
        self.write_region(&framed)?;
        self.block.clear();
        self.block_count = 0;
        Ok(())
    }

    fn write_region(&mut self, bytes: &[u8]) -> Result<(), SegmentError> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| SegmentError::corruption(self.id, "writer already finished"))?;
        out.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        self.hasher.update(bytes);
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if self.out.is_some() {
            self.out = None;
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
