//! Shard statistics
//!
//! Plain counters owned by the shard loop. The loop is single-threaded, so
//! nothing here is atomic; [`crate::Shard::stats`] hands out a copy.

use quiver_core::Lsn;

/// Counters and gauges for one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardStats {
    /// Commands admitted by `submit`
    pub accepted: u64,
    /// Rejected by backpressure
    pub rejected_overloaded: u64,
    /// Rejected by validation
    pub rejected_invalid: u64,
    /// Mutations rejected while read-only
    pub rejected_read_only: u64,
    /// Commands forwarded to their owning shard
    pub routed_out: u64,
    /// Commands received from other shards
    pub routed_in: u64,
    /// Mutations acknowledged durable
    pub committed: u64,
    /// Mutations captured in an installed segment
    pub archived: u64,
    /// Commands that failed after admission
    pub failed: u64,
    /// Commands dropped before reaching the WAL
    pub aborted: u64,
    /// Searches answered
    pub searches: u64,
    /// Point reads answered
    pub gets: u64,
    /// Times a queued mutation waited for WAL capacity
    pub throttle_events: u64,
    /// Defects contained at the loop boundary
    pub faults: u64,
    /// Installed flushes
    pub flushes: u64,
    /// Installed compactions
    pub compactions: u64,
    /// Segments moved to quarantine
    pub quarantined: u64,

    /// Mutations admitted and not yet durable or failed
    pub outstanding: usize,
    /// Whether admission is currently closed by the high watermark
    pub throttled: bool,
    /// Whether the shard degraded to read-only
    pub read_only: bool,
    /// Highest durable LSN
    pub durable_lsn: Lsn,
    /// Manifest checkpoint
    pub checkpoint_lsn: Lsn,
    /// Active MemTable size
    pub memtable_bytes: usize,
    /// Frozen MemTables awaiting flush
    pub frozen_memtables: usize,
    /// Live segments
    pub segments: usize,
    /// Nodes across index slices
    pub index_nodes: usize,
}
