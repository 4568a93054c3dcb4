//! Leveled compaction
//!
//! # Algorithm
//!
//! 1. [`CompactionPicker::pick`] inspects the current [`Version`] and chooses
//!    a job: all of level 0 once it reaches its trigger, an oversized level,
//!    or a tombstone-heavy segment forced down to the bottom level.
//! 2. [`compact`] k-way merges the inputs, keeping the newest version of
//!    each key, and writes rate-limited output segments.
//! 3. The store installs outputs and removes inputs in one manifest
//!    transaction, then deletes the input files.
//!
//! [`Version`]: crate::Version

mod merge;
mod picker;

pub use merge::{compact, CompactionOutput};
pub use picker::CompactionPicker;

use crate::version::LiveSegment;
use std::time::Duration;

/// Why a job was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    /// Level 0 reached its segment-count trigger
    Level0,
    /// The level exceeded its byte budget
    LevelSize(u32),
    /// A segment's dead-entry ratio (tombstones plus overwritten versions)
    /// exceeded the threshold
    DeadEntries {
        /// The segment with the most dead entries
        segment: u64,
    },
}

/// Input segments and the level their merged output lands on.
#[derive(Debug, Clone)]
pub struct CompactionJob {
    /// Segments to merge
    pub inputs: Vec<LiveSegment>,
    /// Output level
    pub target_level: u32,
    /// Why the job was picked
    pub reason: CompactionReason,
}

impl CompactionJob {
    /// Ids of the input segments.
    pub fn input_ids(&self) -> Vec<u64> {
        self.inputs.iter().map(LiveSegment::id).collect()
    }

    /// Total input bytes.
    pub fn input_bytes(&self) -> u64 {
        self.inputs.iter().map(|s| s.desc.file_size).sum()
    }
}

/// Statistics for one finished compaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactInfo {
    /// Input segments consumed
    pub segments_in: usize,
    /// Output segments written
    pub segments_out: usize,
    /// Entries read
    pub entries_in: u64,
    /// Entries written
    pub entries_out: u64,
    /// Shadowed versions dropped
    pub versions_dropped: u64,
    /// Tombstones dropped
    pub tombstones_dropped: u64,
    /// Bytes written
    pub bytes_written: u64,
    /// Time spent waiting on the rate limiter
    pub throttled: Duration,
    /// Wall-clock duration
    pub duration: Duration,
}
