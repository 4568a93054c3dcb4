//! Index error types

use std::io;
use thiserror::Error;

/// Errors from building, loading or searching an index slice.
#[derive(Debug, Error)]
pub enum IndexError {
    /// I/O error reading or writing a slice file
    #[error("Index I/O error: {0}")]
    Io(#[from] io::Error),

    /// A slice file failed its checksum or structural checks
    #[error("Index slice {path} is corrupt: {detail}")]
    Corruption {
        /// File that failed
        path: String,
        /// What failed
        detail: String,
    },

    /// Vector length differs from the index dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Index dimension
        expected: usize,
        /// Offending vector length
        actual: usize,
    },

    /// The slice has more nodes than a `u32` position can address
    #[error("Index slice is full")]
    Full,

    /// The vector source failed while reranking
    #[error("Vector source failed: {0}")]
    Source(String),
}

impl IndexError {
    pub(crate) fn corruption(path: impl Into<String>, detail: impl Into<String>) -> Self {
        IndexError::Corruption {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

impl From<IndexError> for quiver_core::Error {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Io(e) => quiver_core::Error::Io(e),
            IndexError::Corruption { .. } => quiver_core::Error::Corruption(e.to_string()),
            IndexError::DimensionMismatch { .. } => {
                quiver_core::Error::InvalidCommand(e.to_string())
            }
            IndexError::Full | IndexError::Source(_) => quiver_core::Error::Internal(e.to_string()),
        }
    }
}

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, IndexError>;
