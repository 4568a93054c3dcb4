//! Durability layer for Quiver
//!
//! This crate handles everything a shard must get onto disk before it may
//! acknowledge a mutation, and everything needed to rebuild state afterwards:
//!
//! - WAL: sector-aligned, group-committed, segmented write-ahead log
//! - I/O drivers: completion-based submission (threaded, manual for tests)
//! - MANIFEST: append-only log of atomic segment-set transactions
//! - Recovery: torn-tail truncation and replay above the checkpoint
//! - Crash-simulation helpers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;
pub mod manifest;
pub mod recovery;
pub mod testing;
pub mod wal;

pub use format::{WalRecord, WalRecordError};
pub use manifest::{
    ManifestEdit, ManifestError, ManifestLog, ManifestState, QuarantinedSegment, SegmentDescriptor,
    MANIFEST_FILE_NAME,
};
pub use recovery::{RecoveryError, RecoveryManager, RecoveryResult, TruncateInfo};
pub use wal::{
    BatchId, Completion, IoDriver, ManualDriver, ReadStopReason, ThreadedDriver, Wal,
    WalConfig, WalCounters, WalError, WalEvent, WalLayout, WalReader, WalReaderError,
    WriteRequest,
};
