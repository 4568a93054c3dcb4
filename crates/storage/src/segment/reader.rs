//! Memory-mapped segment reader
//!
//! Opening a segment checks the footer and the sparse index. Every block is
//! verified against its own checksum when it is read, so corruption surfaces
//! as [`SegmentError::Corruption`] on whichever access touches it.
//! [`Segment::verify`] additionally checks the whole-segment checksum.

use super::format::{decode_entries, decode_index, unframe_block, BlockHandle, SegmentFooter, FOOTER_SIZE};
use crate::error::SegmentError;
use memmap2::Mmap;
use quiver_core::{Key, Lsn, VersionedValue};
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};

/// An open, immutable segment.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    path: PathBuf,
    mmap: Mmap,
    footer: SegmentFooter,
    index: Vec<BlockHandle>,
    max_key: Key,
}

impl Segment {
    /// Map and validate the segment at `path`.
    pub fn open(path: &Path, id: u64) -> Result<Self, SegmentError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < FOOTER_SIZE {
            return Err(SegmentError::corruption(id, "file shorter than footer"));
        }
        // SAFETY: segments are immutable once renamed into place; the map is read-only.
        let mmap = unsafe { Mmap::map(&file) }?;
        let footer = SegmentFooter::from_bytes(id, &mmap[len - FOOTER_SIZE..])?;

        let block_size = footer.block_size as usize;
        let index_end = footer.index_offset.saturating_add(footer.index_len) as usize;
        if block_size < FOOTER_SIZE || len % block_size != 0 || index_end + block_size > len {
            return Err(SegmentError::corruption(id, "footer describes impossible layout"));
        }
        let (count, payload) = unframe_block(
            id,
            footer.index_offset,
            &mmap[footer.index_offset as usize..index_end],
        )?;
        let index = decode_index(id, payload)?;
        if index.is_empty() || index.len() != count as usize {
            return Err(SegmentError::corruption(id, "empty or inconsistent index"));
        }

        let mut segment = Segment {
            id,
            path: path.to_path_buf(),
            mmap,
            footer,
            index,
            max_key: Key::new(Vec::new()),
        };
        let last = segment.index.len() - 1;
        segment.max_key = segment
            .read_block(last)?
            .pop()
            .map(|(k, _)| k)
            .ok_or_else(|| SegmentError::corruption(id, "last block is empty"))?;
        Ok(segment)
    }

    /// Check the whole-segment checksum and every block.
    pub fn verify(&self) -> Result<(), SegmentError> {
        let body = &self.mmap[..self.mmap.len() - FOOTER_SIZE];
        let computed = crc32fast::hash(body);
        if computed != self.footer.segment_crc {
            return Err(SegmentError::corruption(
                self.id,
                format!(
                    "segment checksum mismatch (expected {:#x}, computed {:#x})",
                    self.footer.segment_crc, computed
                ),
            ));
        }
        let mut entries = 0u64;
        for i in 0..self.index.len() {
            entries += self.read_block(i)?.len() as u64;
        }
        if entries != self.footer.entries {
            return Err(SegmentError::corruption(self.id, "entry count mismatch"));
        }
        Ok(())
    }

    /// Version of `key` stored in this segment, tombstones included.
    pub fn get(&self, key: &Key) -> Result<Option<VersionedValue>, SegmentError> {
        if key < self.min_key() || *key > self.max_key {
            return Ok(None);
        }
        let idx = self.index.partition_point(|h| h.first_key <= *key);
        if idx == 0 {
            return Ok(None);
        }
        let entries = self.read_block(idx - 1)?;
        Ok(entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|i| entries[i].1.clone()))
    }

    /// Every entry in ascending key order.
    pub fn iter(&self) -> SegmentIter<'_> {
        self.range(None, None)
    }

    /// Entries in `[start, end)` in ascending key order.
    pub fn range(&self, start: Option<&Key>, end: Option<&Key>) -> SegmentIter<'_> {
        let next_block = match start {
            Some(s) => self.index.partition_point(|h| h.first_key <= *s).saturating_sub(1),
            None => 0,
        };
        SegmentIter {
            segment: self,
            next_block,
            buffered: VecDeque::new(),
            start: start.cloned(),
            end: end.cloned(),
            done: false,
        }
    }

    fn read_block(&self, i: usize) -> Result<Vec<(Key, VersionedValue)>, SegmentError> {
        let handle = &self.index[i];
        let start = handle.offset as usize;
        let end = start + handle.len as usize;
        let block = self.mmap.get(start..end).ok_or_else(|| {
            SegmentError::corruption(self.id, format!("block {} beyond end of file", i))
        })?;
        let (count, payload) = unframe_block(self.id, handle.offset, block)?;
        decode_entries(self.id, payload, count)
    }

    /// Segment id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Smallest key.
    pub fn min_key(&self) -> &Key {
        &self.index[0].first_key
    }

    /// Largest key.
    pub fn max_key(&self) -> &Key {
        &self.max_key
    }

    /// Smallest LSN.
    pub fn min_lsn(&self) -> Lsn {
        self.footer.min_lsn
    }

    /// Largest LSN.
    pub fn max_lsn(&self) -> Lsn {
        self.footer.max_lsn
    }

    /// Entries, tombstones included.
    pub fn entries(&self) -> u64 {
        self.footer.entries
    }

    /// Tombstones.
    pub fn tombstones(&self) -> u64 {
        self.footer.tombstones
    }

    /// File size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Number of data blocks.
    pub fn block_count(&self) -> usize {
        self.index.len()
    }
}

/// Lazy ascending iterator over a segment, one block at a time.
pub struct SegmentIter<'a> {
    segment: &'a Segment,
    next_block: usize,
    buffered: VecDeque<(Key, VersionedValue)>,
    start: Option<Key>,
    end: Option<Key>,
    done: bool,
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = Result<(Key, VersionedValue), SegmentError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some((key, value)) = self.buffered.pop_front() {
                if self.start.as_ref().is_some_and(|s| key < *s) {
                    continue;
                }
                if self.end.as_ref().is_some_and(|e| key >= *e) {
                    self.done = true;
                    return None;
                }
                return Some(Ok((key, value)));
            }
            if self.next_block >= self.segment.index.len() {
                self.done = true;
                return None;
            }
            match self.segment.read_block(self.next_block) {
                Ok(entries) => {
                    self.next_block += 1;
                    self.buffered.extend(entries);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
