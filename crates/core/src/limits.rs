//! Logical limits re-validated on every command
//!
//! Ingress already checks framing; these bounds are the shard's own invariants
//! and are enforced again before anything reaches the WAL.

use crate::command::{Command, CommandPayload};
use crate::types::Key;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard ceiling on key length imposed by the WAL record header (`u16`).
pub const MAX_ENCODABLE_KEY_BYTES: usize = u16::MAX as usize;

/// Size limits for keys, vectors and metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum key length in bytes (default: 1024)
    pub max_key_bytes: usize,

    /// Maximum vector dimension (default: 8192)
    pub max_vector_dim: usize,

    /// Maximum metadata length in bytes (default: 64KB)
    pub max_metadata_bytes: usize,

    /// Maximum `k` accepted by a search (default: 1024)
    pub max_search_k: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_key_bytes: 1024,
            max_vector_dim: 8192,
            max_metadata_bytes: 64 * 1024,
            max_search_k: 1024,
        }
    }
}

impl Limits {
    /// Small limits for unit tests that exercise enforcement.
    pub fn with_small_limits() -> Self {
        Limits {
            max_key_bytes: 16,
            max_vector_dim: 32,
            max_metadata_bytes: 64,
            max_search_k: 16,
        }
    }

    /// Validate key length bounds (non-empty, at most `max_key_bytes`).
    pub fn validate_key(&self, key: &Key) -> Result<(), LimitError> {
        if key.is_empty() {
            return Err(LimitError::EmptyKey);
        }
        if key.len() > self.max_key_bytes {
            return Err(LimitError::KeyTooLong {
                actual: key.len(),
                max: self.max_key_bytes,
            });
        }
        Ok(())
    }

    /// Validate a vector: non-empty, within the dimension bound, matching the
    /// shard dimension, and finite.
    pub fn validate_vector(&self, vec: &[f32], expected_dim: usize) -> Result<(), LimitError> {
        if vec.is_empty() {
            return Err(LimitError::EmptyVector);
        }
        if vec.len() > self.max_vector_dim {
            return Err(LimitError::VectorDimExceeded {
                actual: vec.len(),
                max: self.max_vector_dim,
            });
        }
        if vec.len() != expected_dim {
            return Err(LimitError::VectorDimMismatch {
                expected: expected_dim,
                actual: vec.len(),
            });
        }
        if let Some(position) = vec.iter().position(|x| !x.is_finite()) {
            return Err(LimitError::NonFiniteComponent { position });
        }
        Ok(())
    }

    /// Validate metadata length.
    pub fn validate_metadata(&self, metadata: &[u8]) -> Result<(), LimitError> {
        if metadata.len() > self.max_metadata_bytes {
            return Err(LimitError::MetadataTooLarge {
                actual: metadata.len(),
                max: self.max_metadata_bytes,
            });
        }
        Ok(())
    }

    /// Validate every logical invariant of a command.
    pub fn validate_command(&self, command: &Command, dimension: usize) -> Result<(), LimitError> {
        match &command.payload {
            CommandPayload::Upsert { key, record } => {
                self.validate_key(key)?;
                self.validate_vector(&record.vector, dimension)?;
                self.validate_metadata(&record.metadata)
            }
            CommandPayload::Delete { key } | CommandPayload::Get { key } => {
                self.validate_key(key)
            }
            CommandPayload::Search(req) => {
                self.validate_vector(&req.query, dimension)?;
                if req.k == 0 || req.k > self.max_search_k {
                    return Err(LimitError::InvalidK {
                        k: req.k,
                        max: self.max_search_k,
                    });
                }
                if req.breadth == Some(0) {
                    return Err(LimitError::InvalidBreadth);
                }
                Ok(())
            }
        }
    }
}

/// Limit validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimitError {
    /// Empty keys are not addressable
    #[error("Key is empty")]
    EmptyKey,

    /// Key exceeds maximum length
    #[error("Key too long: {actual} bytes exceeds maximum {max}")]
    KeyTooLong {
        /// Actual key length in bytes
        actual: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Zero-dimension vector
    #[error("Vector is empty")]
    EmptyVector,

    /// Vector dimension exceeds maximum
    #[error("Vector dimension exceeded: {actual} exceeds maximum {max}")]
    VectorDimExceeded {
        /// Actual vector dimension
        actual: usize,
        /// Maximum allowed dimension
        max: usize,
    },

    /// Vector dimension differs from the shard dimension
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    VectorDimMismatch {
        /// Shard dimension
        expected: usize,
        /// Actual dimension
        actual: usize,
    },

    /// NaN or infinite component
    #[error("Vector component {position} is not finite")]
    NonFiniteComponent {
        /// Index of the first offending component
        position: usize,
    },

    /// Metadata exceeds maximum length
    #[error("Metadata too large: {actual} bytes exceeds maximum {max}")]
    MetadataTooLarge {
        /// Actual length
        actual: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// `k` outside `1..=max`
    #[error("Invalid k {k}: must be between 1 and {max}")]
    InvalidK {
        /// Requested k
        k: usize,
        /// Maximum k
        max: usize,
    },

    /// Zero search breadth
    #[error("Search breadth must be positive")]
    InvalidBreadth,
}

impl LimitError {
    /// Short reason code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            LimitError::EmptyKey => "empty_key",
            LimitError::KeyTooLong { .. } => "key_too_long",
            LimitError::EmptyVector => "empty_vector",
            LimitError::VectorDimExceeded { .. } => "vector_dim_exceeded",
            LimitError::VectorDimMismatch { .. } => "vector_dim_mismatch",
            LimitError::NonFiniteComponent { .. } => "non_finite",
            LimitError::MetadataTooLarge { .. } => "metadata_too_large",
            LimitError::InvalidK { .. } => "invalid_k",
            LimitError::InvalidBreadth => "invalid_breadth",
        }
    }
}
