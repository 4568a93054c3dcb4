//! Recovery manager
//!
//! Recovery algorithm:
//! 1. Scan the WAL: validate every file, find where valid data ends
//! 2. Truncate the torn tail of the final file (a partial record is absent, not corrupt)
//! 3. Replay records with LSN > checkpoint through the caller's replay path
//!
//! # Recovery Properties
//!
//! - **Deterministic**: same files, same checkpoint -> same record sequence
//! - **Idempotent**: a second recovery replays exactly what the first did
//! - **Fail-stop**: corruption anywhere but the tail aborts startup, and a
//!   bad record in the final file counts as the tail only when no valid
//!   record with a later LSN follows it

use crate::format::{sync_dir, WalRecord};
use crate::wal::{ReadStopReason, WalLayout, WalReader, WalReaderError};
use quiver_core::platform::align_up;
use quiver_core::{Lsn, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Torn tail removed from the final WAL file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncateInfo {
    /// File that was truncated (or removed)
    pub file_number: u64,
    /// End of valid data
    pub valid_end: u64,
    /// File length before truncation
    pub original_len: u64,
    /// What ended the valid prefix
    pub reason: ReadStopReason,
    /// The file had no readable header and was deleted
    pub removed: bool,
}

impl TruncateInfo {
    /// Bytes dropped.
    pub fn bytes_discarded(&self) -> u64 {
        self.original_len.saturating_sub(self.valid_end)
    }
}

/// Result of recovery
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    /// WAL layout after truncation, ready for `Wal::open`
    pub layout: WalLayout,
    /// Checkpoint the replay started above
    pub checkpoint_lsn: Lsn,
    /// Records handed to the replay callback
    pub records_replayed: u64,
    /// Highest LSN in the WAL after truncation
    pub last_lsn: Lsn,
    /// Torn tail that was removed, if any
    pub truncated: Option<TruncateInfo>,
}

/// Recovery errors
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// WAL reader error
    #[error("WAL reader error: {0}")]
    WalReader(#[from] WalReaderError),

    /// A logged payload failed to decode despite a valid checksum
    #[error("Undecodable WAL record at LSN {lsn}")]
    BadRecord {
        /// LSN of the record
        lsn: Lsn,
    },

    /// The manifest checkpoint is beyond the end of the log
    #[error("Checkpoint LSN {checkpoint} is ahead of the WAL (next LSN {next_lsn})")]
    CheckpointAhead {
        /// Manifest checkpoint
        checkpoint: Lsn,
        /// Next LSN the WAL would assign
        next_lsn: Lsn,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Apply error (from callbacks)
    #[error("Apply error: {0}")]
    Apply(String),
}

impl RecoveryError {
    /// Create an apply error
    pub fn apply(msg: impl Into<String>) -> Self {
        RecoveryError::Apply(msg.into())
    }
}

/// Rebuilds volatile state from the WAL above a checkpoint.
pub struct RecoveryManager {
    wal_dir: PathBuf,
}

impl RecoveryManager {
    /// Recovery over the WAL in `wal_dir`.
    pub fn new(wal_dir: impl Into<PathBuf>) -> Self {
        RecoveryManager {
            wal_dir: wal_dir.into(),
        }
    }

    /// WAL directory.
    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    /// Scan, truncate the torn tail, then replay every record above
    /// `checkpoint_lsn` in LSN order through `on_record`.
    pub fn recover<R>(
        &self,
        checkpoint_lsn: Lsn,
        mut on_record: R,
    ) -> Result<RecoveryResult, RecoveryError>
    where
        R: FnMut(&WalRecord, Value) -> Result<(), RecoveryError>,
    {
        let reader = WalReader::new(&self.wal_dir);
        let mut layout = reader.scan()?;
        let truncated = self.truncate_torn_tail(&mut layout)?;

        if let Some(next_lsn) = layout.next_lsn() {
            if checkpoint_lsn >= next_lsn {
                return Err(RecoveryError::CheckpointAhead {
                    checkpoint: checkpoint_lsn,
                    next_lsn,
                });
            }
        }

        let mut records_replayed = 0u64;
        if !layout.files.is_empty() {
            for record in reader.replay(checkpoint_lsn)? {
                let record = record?;
                let value = record
                    .value()
                    .map_err(|_| RecoveryError::BadRecord { lsn: record.lsn })?;
                on_record(&record, value)?;
                records_replayed += 1;
            }
        }

        let last_lsn = layout.last_lsn();
        info!(
            target: "quiver::recovery",
            checkpoint_lsn,
            records_replayed,
            last_lsn,
            truncated_bytes = truncated.as_ref().map_or(0, |t| t.bytes_discarded()),
            "WAL recovery complete"
        );
        Ok(RecoveryResult {
            layout,
            checkpoint_lsn,
            records_replayed,
            last_lsn,
            truncated,
        })
    }

    /// Cut the final file back to its last valid record.
    ///
    /// The file is re-extended with zeros to the next sector boundary so the
    /// next batch starts aligned. A final file without a readable header is
    /// deleted.
    pub fn truncate_torn_tail(
        &self,
        layout: &mut WalLayout,
    ) -> Result<Option<TruncateInfo>, RecoveryError> {
        let Some(last) = layout.files.last_mut() else {
            return Ok(None);
        };
        if last.stop.is_clean() {
            return Ok(None);
        }

        if last.header.is_none() {
            std::fs::remove_file(&last.path)?;
            sync_dir(&self.wal_dir)?;
            let info = TruncateInfo {
                file_number: last.file_number,
                valid_end: 0,
                original_len: last.file_len,
                reason: last.stop.clone(),
                removed: true,
            };
            warn!(
                target: "quiver::recovery",
                file_number = info.file_number,
                "Removed WAL file with torn header"
            );
            layout.files.pop();
            return Ok(Some(info));
        }

        let sector = last.sector_size().unwrap_or(quiver_core::platform::DEFAULT_SECTOR_SIZE);
        let aligned_end = align_up(last.valid_end as usize, sector) as u64;
        let file = OpenOptions::new().write(true).open(&last.path)?;
        file.set_len(last.valid_end)?;
        file.set_len(aligned_end)?;
        file.sync_all()?;

        let info = TruncateInfo {
            file_number: last.file_number,
            valid_end: last.valid_end,
            original_len: last.file_len,
            reason: last.stop.clone(),
            removed: false,
        };
        warn!(
            target: "quiver::recovery",
            file_number = info.file_number,
            valid_end = info.valid_end,
            discarded = info.bytes_discarded(),
            reason = ?info.reason,
            "Truncated torn WAL tail"
        );
        last.file_len = aligned_end;
        last.stop = ReadStopReason::EndOfFile;
        Ok(Some(info))
    }
}

impl From<RecoveryError> for quiver_core::Error {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::Io(io) => quiver_core::Error::Io(io),
            RecoveryError::WalReader(WalReaderError::Io(io)) => quiver_core::Error::Io(io),
            RecoveryError::Apply(msg) => quiver_core::Error::Internal(msg),
            other => quiver_core::Error::Corruption(other.to_string()),
        }
    }
}
