//! WAL configuration.

use quiver_core::WalSettings;
use std::time::Duration;

/// WAL configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalConfig {
    /// Physical sector size; every batch starts and ends on a multiple of it.
    pub sector_size: usize,

    /// Maximum file size in bytes (default: 64MB).
    ///
    /// Rotation happens at the next batch boundary with nothing in flight.
    pub segment_size: u64,

    /// Bytes coalesced into one group-commit write (default: 256KB).
    pub group_commit_bytes: usize,

    /// Batches handed to the I/O driver concurrently (default: 4).
    pub max_in_flight_batches: usize,

    /// Resubmissions of a failed batch before it is failed (default: 3).
    pub max_write_retries: u32,

    /// Backoff before the first resubmission; doubles per attempt.
    pub retry_backoff: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            sector_size: 4096,
            segment_size: 64 * 1024 * 1024,
            group_commit_bytes: 256 * 1024,
            max_in_flight_batches: 4,
            max_write_retries: 3,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

impl WalConfig {
    /// Create a new WAL configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from shard settings and a resolved sector size.
    pub fn from_settings(settings: &WalSettings, sector_size: usize) -> Self {
        WalConfig {
            sector_size,
            segment_size: settings.segment_size,
            group_commit_bytes: settings.group_commit_bytes,
            max_in_flight_batches: settings.max_in_flight_batches,
            max_write_retries: settings.max_write_retries,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }

    /// Set sector size (builder pattern).
    pub fn with_sector_size(mut self, size: usize) -> Self {
        self.sector_size = size;
        self
    }

    /// Set file size (builder pattern).
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Set group commit size (builder pattern).
    pub fn with_group_commit_bytes(mut self, bytes: usize) -> Self {
        self.group_commit_bytes = bytes;
        self
    }

    /// Set retry budget (builder pattern).
    pub fn with_max_write_retries(mut self, retries: u32) -> Self {
        self.max_write_retries = retries;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), WalConfigError> {
        if self.sector_size < 512 || !self.sector_size.is_power_of_two() {
            return Err(WalConfigError::InvalidSectorSize(self.sector_size));
        }
        if self.segment_size < 2 * self.sector_size as u64 {
            return Err(WalConfigError::SegmentSizeTooSmall);
        }
        if self.max_in_flight_batches == 0 {
            return Err(WalConfigError::NoInFlightCapacity);
        }
        Ok(())
    }

    /// Small files and sectors for fast rotation in tests.
    pub fn for_testing() -> Self {
        WalConfig {
            sector_size: 512,
            segment_size: 64 * 1024,
            group_commit_bytes: 8 * 1024,
            max_in_flight_batches: 2,
            max_write_retries: 2,
            retry_backoff: Duration::ZERO,
        }
    }
}

/// WAL configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalConfigError {
    /// Sector size is not a power of two of at least 512.
    #[error("Invalid sector size {0}")]
    InvalidSectorSize(usize),

    /// File size cannot hold a header and one batch.
    #[error("Segment size must hold at least two sectors")]
    SegmentSizeTooSmall,

    /// Zero in-flight batches would never make progress.
    #[error("max_in_flight_batches must be positive")]
    NoInFlightCapacity,
}
