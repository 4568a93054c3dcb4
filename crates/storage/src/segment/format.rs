//! Segment file format
//!
//! Segments are named `seg-NNNNNNNN.qseg`. Every region is a whole number of
//! blocks (the shard's sector size), so each block can be read and verified
//! on its own.
//!
//! # File Structure
//!
//! ```text
//! +--------------------+ 0
//! | Data Block 1       | k * block_size bytes
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | Data Block N       |
//! +--------------------+ index_offset
//! | Index Region       | sparse index: first key of every data block
//! +--------------------+
//! | Footer Block       | zero fill, then the 72-byte footer at the very end
//! +--------------------+
//! ```
//!
//! # Block Layout
//!
//! ```text
//! +--------------------+
//! | Entry count        | 4 bytes (u32 LE)
//! | Payload length     | 4 bytes (u32 LE)
//! +--------------------+
//! | Entries            | payload length bytes
//! +--------------------+
//! | Zero padding       |
//! | CRC32              | 4 bytes, over everything before it in the block
//! +--------------------+
//! ```
//!
//! An entry is `key_len u16 | tag u8 | lsn u64 | value_len u32 | key | value`,
//! where tag 0 is a record (value is the shared vector encoding) and tag 1 is
//! a tombstone (empty value). A single entry larger than one block gets a
//! block spanning as many sectors as it needs.

use crate::error::SegmentError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use quiver_core::{Key, Lsn, Value, VectorRecord, VersionedValue};
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Footer magic bytes: "QSEG"
pub const SEGMENT_MAGIC: [u8; 4] = *b"QSEG";

/// Segment format version
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Footer size in bytes
pub const FOOTER_SIZE: usize = 72;

/// Block header: entry count + payload length
pub const BLOCK_HEADER_SIZE: usize = 8;

/// Trailing block checksum
pub const BLOCK_TRAILER_SIZE: usize = 4;

/// Fixed bytes per entry before key and value
pub const ENTRY_HEADER_SIZE: usize = 2 + 1 + 8 + 4;

const TAG_RECORD: u8 = 0;
const TAG_TOMBSTONE: u8 = 1;

/// Path of segment `id` in `dir`.
pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("seg-{:08}.qseg", id))
}

/// Parse a segment id out of a file name.
pub fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix("seg-")?
        .strip_suffix(".qseg")?
        .parse()
        .ok()
}

/// Encoded size of one entry.
pub fn entry_len(key: &Key, value: &Value) -> usize {
    ENTRY_HEADER_SIZE
        + key.len()
        + match value {
            Value::Record(r) => r.encoded_len(),
            Value::Tombstone => 0,
        }
}

/// Append one entry to `buf`.
pub fn encode_entry(buf: &mut Vec<u8>, key: &Key, entry: &VersionedValue) {
    let (tag, value_len) = match &entry.value {
        Value::Record(r) => (TAG_RECORD, r.encoded_len()),
        Value::Tombstone => (TAG_TOMBSTONE, 0),
    };
    // Writes into a Vec cannot fail
    let _ = buf.write_u16::<LittleEndian>(key.len() as u16);
    let _ = buf.write_u8(tag);
    let _ = buf.write_u64::<LittleEndian>(entry.lsn);
    let _ = buf.write_u32::<LittleEndian>(value_len as u32);
    buf.extend_from_slice(key.as_bytes());
    if let Value::Record(r) = &entry.value {
        r.encode_into(buf);
    }
}

/// Decode every entry of a verified block payload.
pub fn decode_entries(
    segment_id: u64,
    payload: &[u8],
    count: u32,
) -> Result<Vec<(Key, VersionedValue)>, SegmentError> {
    let bad = |detail: &str| SegmentError::corruption(segment_id, detail);
    let mut cursor = Cursor::new(payload);
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key_len = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| bad("truncated entry header"))? as usize;
        let tag = cursor.read_u8().map_err(|_| bad("truncated entry header"))?;
        let lsn: Lsn = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| bad("truncated entry header"))?;
        let value_len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| bad("truncated entry header"))? as usize;
        let start = cursor.position() as usize;
        let key_end = start + key_len;
        let value_end = key_end + value_len;
        if value_end > payload.len() {
            return Err(bad("entry overruns block"));
        }
        let key = Key::from(&payload[start..key_end]);
        let value = match tag {
            TAG_RECORD => Value::Record(
                VectorRecord::decode(&payload[key_end..value_end])
                    .map_err(|e| bad(&format!("bad record encoding: {}", e)))?,
            ),
            TAG_TOMBSTONE => Value::Tombstone,
            _ => return Err(bad("unknown entry tag")),
        };
        cursor.set_position(value_end as u64);
        entries.push((key, VersionedValue { value, lsn }));
    }
    Ok(entries)
}

/// Location of one data block, keyed by its first key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHandle {
    /// First key stored in the block
    pub first_key: Key,
    /// Byte offset of the block
    pub offset: u64,
    /// Block length in bytes (a multiple of the block size)
    pub len: u32,
}

/// Serialize the sparse index payload.
pub fn encode_index(handles: &[BlockHandle]) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = buf.write_u32::<LittleEndian>(handles.len() as u32);
    for h in handles {
        let _ = buf.write_u16::<LittleEndian>(h.first_key.len() as u16);
        buf.extend_from_slice(h.first_key.as_bytes());
        let _ = buf.write_u64::<LittleEndian>(h.offset);
        let _ = buf.write_u32::<LittleEndian>(h.len);
    }
    buf
}

/// Parse the sparse index payload.
pub fn decode_index(segment_id: u64, payload: &[u8]) -> Result<Vec<BlockHandle>, SegmentError> {
    let bad = || SegmentError::corruption(segment_id, "truncated index");
    let mut cursor = Cursor::new(payload);
    let count = cursor.read_u32::<LittleEndian>().map_err(|_| bad())? as usize;
    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
        let key_len = cursor.read_u16::<LittleEndian>().map_err(|_| bad())? as usize;
        let start = cursor.position() as usize;
        let key_bytes = payload.get(start..start + key_len).ok_or_else(bad)?;
        cursor.set_position((start + key_len) as u64);
        let offset = cursor.read_u64::<LittleEndian>().map_err(|_| bad())?;
        let len = cursor.read_u32::<LittleEndian>().map_err(|_| bad())?;
        handles.push(BlockHandle {
            first_key: Key::from(key_bytes),
            offset,
            len,
        });
    }
    Ok(handles)
}

/// Wrap a payload into a checksummed, block-aligned region.
pub fn frame_block(count: u32, payload: &[u8], block_size: usize) -> Vec<u8> {
    let raw = BLOCK_HEADER_SIZE + payload.len() + BLOCK_TRAILER_SIZE;
    let total = quiver_core::platform::align_up(raw, block_size);
    let mut block = Vec::with_capacity(total);
    let _ = block.write_u32::<LittleEndian>(count);
    let _ = block.write_u32::<LittleEndian>(payload.len() as u32);
    block.extend_from_slice(payload);
    block.resize(total - BLOCK_TRAILER_SIZE, 0);
    let crc = crc32fast::hash(&block);
    let _ = block.write_u32::<LittleEndian>(crc);
    block
}

/// Verify a framed block and return `(count, payload)`.
pub fn unframe_block(segment_id: u64, offset: u64, block: &[u8]) -> Result<(u32, &[u8]), SegmentError> {
    if block.len() < BLOCK_HEADER_SIZE + BLOCK_TRAILER_SIZE {
        return Err(SegmentError::corruption(
            segment_id,
            format!("block at {} too short", offset),
        ));
    }
    let body_end = block.len() - BLOCK_TRAILER_SIZE;
    let stored = u32::from_le_bytes([
        block[body_end],
        block[body_end + 1],
        block[body_end + 2],
        block[body_end + 3],
    ]);
    let computed = crc32fast::hash(&block[..body_end]);
    if stored != computed {
        return Err(SegmentError::corruption(
            segment_id,
            format!(
                "block at {} checksum mismatch (expected {:#x}, computed {:#x})",
                offset, stored, computed
            ),
        ));
    }
    let count = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    let len = u32::from_le_bytes([block[4], block[5], block[6], block[7]]) as usize;
    let payload = block
        .get(BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + len)
        .filter(|_| BLOCK_HEADER_SIZE + len <= body_end)
        .ok_or_else(|| {
            SegmentError::corruption(segment_id, format!("block at {} payload overruns", offset))
        })?;
    Ok((count, payload))
}

/// Segment footer, stored in the last [`FOOTER_SIZE`] bytes of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFooter {
    /// Block size the segment was written with
    pub block_size: u32,
    /// Entries, tombstones included
    pub entries: u64,
    /// Tombstones
    pub tombstones: u64,
    /// Smallest LSN in the segment
    pub min_lsn: Lsn,
    /// Largest LSN in the segment
    pub max_lsn: Lsn,
    /// Offset of the index region
    pub index_offset: u64,
    /// Length of the index region
    pub index_len: u64,
    /// CRC32 over every byte before the footer
    pub segment_crc: u32,
}

impl SegmentFooter {
    /// Serialize, footer CRC included.
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut bytes = [0u8; FOOTER_SIZE];
        bytes[0..4].copy_from_slice(&SEGMENT_MAGIC);
        bytes[4..8].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        // 12..16 reserved
        bytes[16..24].copy_from_slice(&self.entries.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.tombstones.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.min_lsn.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.max_lsn.to_le_bytes());
        bytes[48..56].copy_from_slice(&self.index_offset.to_le_bytes());
        bytes[56..64].copy_from_slice(&self.index_len.to_le_bytes());
        bytes[64..68].copy_from_slice(&self.segment_crc.to_le_bytes());
        let crc = crc32fast::hash(&bytes[0..68]);
        bytes[68..72].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Parse and validate.
    pub fn from_bytes(segment_id: u64, bytes: &[u8]) -> Result<Self, SegmentError> {
        if bytes.len() != FOOTER_SIZE {
            return Err(SegmentError::corruption(segment_id, "footer size"));
        }
        if bytes[0..4] != SEGMENT_MAGIC {
            return Err(SegmentError::corruption(segment_id, "invalid footer magic"));
        }
        let mut cursor = Cursor::new(&bytes[4..]);
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != SEGMENT_FORMAT_VERSION {
            return Err(SegmentError::corruption(
                segment_id,
                format!("unsupported segment version {}", version),
            ));
        }
        let stored_crc = u32::from_le_bytes([bytes[68], bytes[69], bytes[70], bytes[71]]);
        if crc32fast::hash(&bytes[0..68]) != stored_crc {
            return Err(SegmentError::corruption(segment_id, "footer checksum mismatch"));
        }
        let block_size = cursor.read_u32::<LittleEndian>()?;
        let _reserved = cursor.read_u32::<LittleEndian>()?;
        Ok(SegmentFooter {
            block_size,
            entries: read_u64(&mut cursor)?,
            tombstones: read_u64(&mut cursor)?,
            min_lsn: read_u64(&mut cursor)?,
            max_lsn: read_u64(&mut cursor)?,
            index_offset: read_u64(&mut cursor)?,
            index_len: read_u64(&mut cursor)?,
            segment_crc: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u64> {
    cursor.read_u64::<LittleEndian>()
}
