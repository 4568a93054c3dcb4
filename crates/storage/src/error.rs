//! Storage error types

use quiver_durability::ManifestError;
use std::io;
use thiserror::Error;

/// Errors from reading or writing one segment file.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// I/O error
    #[error("Segment I/O error: {0}")]
    Io(#[from] io::Error),

    /// A checksum or structural check failed
    #[error("Segment {id} is corrupt: {detail}")]
    Corruption {
        /// Segment id
        id: u64,
        /// What failed
        detail: String,
    },

    /// The key falls in a quarantined range awaiting repair
    #[error("Segment {id} is quarantined pending repair")]
    Quarantined {
        /// Quarantined segment id
        id: u64,
    },

    /// Keys were added out of ascending order
    #[error("Segment keys must be strictly ascending")]
    OutOfOrder,

    /// `finish` was called with no entries
    #[error("Segment has no entries")]
    Empty,
}

impl SegmentError {
    pub(crate) fn corruption(id: u64, detail: impl Into<String>) -> Self {
        SegmentError::Corruption {
            id,
            detail: detail.into(),
        }
    }

    /// Id of the corrupt segment, if this is a corruption error.
    pub fn corrupt_segment(&self) -> Option<u64> {
        match self {
            SegmentError::Corruption { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Errors from the leveled store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Segment error
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// Manifest error
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// I/O error
    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// The MemTable no longer accepts writes
    #[error("MemTable is frozen")]
    Frozen,

    /// A compaction input disappeared before its outputs were installed
    #[error("Compaction input segment {0} is no longer live")]
    StaleJob(u64),

    /// A repair segment reaches outside the quarantined range it replaces
    #[error("Repair for segment {0} is outside its quarantined range")]
    RepairOutOfBounds(u64),
}

impl StorageError {
    /// Id of the corrupt segment, if this error is segment corruption.
    pub fn corrupt_segment(&self) -> Option<u64> {
        match self {
            StorageError::Segment(e) => e.corrupt_segment(),
            _ => None,
        }
    }
}

impl From<StorageError> for quiver_core::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Segment(
                SegmentError::Corruption { .. } | SegmentError::Quarantined { .. },
            ) => {
                quiver_core::Error::Corruption(e.to_string())
            }
            StorageError::Io(io) | StorageError::Segment(SegmentError::Io(io)) => {
                quiver_core::Error::Io(io)
            }
            other => quiver_core::Error::Internal(other.to_string()),
        }
    }
}

/// Result alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
