//! Storage layer for Quiver
//!
//! Each shard keeps its key space in an LSM tree:
//! - MemTable: lock-free skip list absorbing writes until flush
//! - Segment: immutable, block-checksummed, memory-mapped sorted file
//! - Version: the live segment set, levels 0..N, swapped atomically
//! - LsmStore: segment directory plus MANIFEST, flush and compaction installs
//! - Compaction: leveled picker and k-way merge behind a token bucket
//!
//! Writers never mutate a published [`Version`]; readers load it through an
//! `ArcSwap` and see either the old or the new segment set, never a mix.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compaction;
pub mod error;
pub mod memtable;
pub mod rate_limit;
pub mod segment;
pub mod store;
pub mod version;

pub use compaction::{
    compact, CompactInfo, CompactionJob, CompactionOutput, CompactionPicker, CompactionReason,
};
pub use error::{Result, SegmentError, StorageError};
pub use memtable::MemTable;
pub use rate_limit::{CompactionThrottle, ForegroundLoad, TokenBucket};
pub use segment::{Segment, SegmentInfo, SegmentIter, SegmentWriter};
pub use store::{LsmStore, RepairRequest, QUARANTINE_DIR, SEGMENTS_DIR};
pub use version::{LiveSegment, Version};
