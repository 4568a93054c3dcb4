//! `.vidx` slice file layout
//!
//! ```text
//! HEADER (64 bytes, little-endian):
//!   magic "QVIX" | version u32 | metric u8 | pad 3 | dimension u32
//!   node_count u32 | m u32 | max_level u32 | entry_point u32 (MAX = none)
//!   upper_slots u32 | keys_bytes u32 | segment_id u64 | reserved 16
//!
//! SECTIONS (each starts 4-byte aligned):
//!   magnitudes   f32 × n
//!   levels       u32 × n
//!   upper_start  u32 × n        first upper slot of each node (MAX = level 0 only)
//!   layer0       u32 × n × 2m   neighbor positions, MAX = empty
//!   upper        u32 × slots    m slots per upper layer per node
//!   key_offsets  u32 × (n + 1)
//!   keys         keys_bytes
//!   codes        u8 × n × dimension
//!
//! TRAILER: crc32 u32 over everything before it
//! ```

use super::MAX_LEVEL;
use crate::error::{IndexError, Result};
use byteorder::{ByteOrder, LittleEndian};
use quiver_core::DistanceMetric;
use std::path::{Path, PathBuf};

/// Slice file magic
pub const SLICE_MAGIC: &[u8; 4] = b"QVIX";

/// Slice format version
pub const SLICE_VERSION: u32 = 1;

/// Sidecar extension next to a segment file
pub const SLICE_EXTENSION: &str = "vidx";

pub(crate) const HEADER_SIZE: usize = 64;
pub(crate) const NONE: u32 = u32::MAX;
const MAX_M: u32 = 1024;
const MAX_DIMENSION: u32 = 65_536;

/// `seg-00000007.qseg` → `seg-00000007.vidx`
pub fn sidecar_path(segment_path: &Path) -> PathBuf {
    segment_path.with_extension(SLICE_EXTENSION)
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Fixed header fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SliceHeader {
    pub metric: DistanceMetric,
    pub dimension: u32,
    pub node_count: u32,
    pub m: u32,
    pub max_level: u32,
    pub entry_point: u32,
    pub upper_slots: u32,
    pub keys_bytes: u32,
    pub segment_id: u64,
}

impl SliceHeader {
    pub(crate) fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(SLICE_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], SLICE_VERSION);
        buf[8] = self.metric.to_byte();
        LittleEndian::write_u32(&mut buf[12..16], self.dimension);
        LittleEndian::write_u32(&mut buf[16..20], self.node_count);
        LittleEndian::write_u32(&mut buf[20..24], self.m);
        LittleEndian::write_u32(&mut buf[24..28], self.max_level);
        LittleEndian::write_u32(&mut buf[28..32], self.entry_point);
        LittleEndian::write_u32(&mut buf[32..36], self.upper_slots);
        LittleEndian::write_u32(&mut buf[36..40], self.keys_bytes);
        LittleEndian::write_u64(&mut buf[40..48], self.segment_id);
    }

    pub(crate) fn read(name: &str, buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE + 4 {
            return Err(IndexError::corruption(name, "file shorter than header"));
        }
        if &buf[0..4] != SLICE_MAGIC {
            return Err(IndexError::corruption(name, "bad magic"));
        }
        let version = LittleEndian::read_u32(&buf[4..8]);
        if version != SLICE_VERSION {
            return Err(IndexError::corruption(name, format!("unsupported version {}", version)));
        }
        let metric = DistanceMetric::from_byte(buf[8])
            .ok_or_else(|| IndexError::corruption(name, format!("unknown metric {}", buf[8])))?;
        let header = SliceHeader {
            metric,
            dimension: LittleEndian::read_u32(&buf[12..16]),
            node_count: LittleEndian::read_u32(&buf[16..20]),
            m: LittleEndian::read_u32(&buf[20..24]),
            max_level: LittleEndian::read_u32(&buf[24..28]),
            entry_point: LittleEndian::read_u32(&buf[28..32]),
            upper_slots: LittleEndian::read_u32(&buf[32..36]),
            keys_bytes: LittleEndian::read_u32(&buf[36..40]),
            segment_id: LittleEndian::read_u64(&buf[40..48]),
        };
        // Bound every count by the file size before any offset arithmetic
        let len = buf.len();
        if header.m == 0
            || header.m > MAX_M
            || header.dimension > MAX_DIMENSION
            || header.max_level as usize > MAX_LEVEL
            || header.node_count as usize > len / 12
            || header.upper_slots as usize > len / 4
            || header.keys_bytes as usize > len
        {
            return Err(IndexError::corruption(name, "header counts out of range"));
        }
        Ok(header)
    }
}

/// Byte offsets of each section, derived from the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    pub magnitudes: usize,
    pub levels: usize,
    pub upper_start: usize,
    pub layer0: usize,
    pub upper: usize,
    pub key_offsets: usize,
    pub keys: usize,
    pub codes: usize,
    pub crc: usize,
    pub total: usize,
}

impl Layout {
    pub(crate) fn new(header: &SliceHeader) -> Self {
        let n = header.node_count as usize;
        let m0 = 2 * header.m as usize;
        let magnitudes = HEADER_SIZE;
        let levels = magnitudes + n * 4;
        let upper_start = levels + n * 4;
        let layer0 = upper_start + n * 4;
        let upper = layer0 + n * m0 * 4;
        let key_offsets = upper + header.upper_slots as usize * 4;
        let keys = key_offsets + (n + 1) * 4;
        let codes = align4(keys + header.keys_bytes as usize);
        let crc = align4(codes + n * header.dimension as usize);
        Layout {
            magnitudes,
            levels,
            upper_start,
            layer0,
            upper,
            key_offsets,
            keys,
            codes,
            crc,
            total: crc + 4,
        }
    }
}

/// Read the `i`th u32 of the section starting at `base`.
#[inline]
pub(crate) fn u32_at(buf: &[u8], base: usize, i: usize) -> u32 {
    let at = base + i * 4;
    LittleEndian::read_u32(&buf[at..at + 4])
}

#[inline]
pub(crate) fn f32_at(buf: &[u8], base: usize, i: usize) -> f32 {
    let at = base + i * 4;
    LittleEndian::read_f32(&buf[at..at + 4])
}

/// Whole-file checksum over everything before the trailer.
pub(crate) fn checksum(buf: &[u8], layout: &Layout) -> u32 {
    crc32fast::hash(&buf[..layout.crc])
}
