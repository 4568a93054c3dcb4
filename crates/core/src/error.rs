//! Shard-level error taxonomy
//!
//! Every layer keeps its own `thiserror` enum; they all fold into [`Error`]
//! at the shard boundary. [`ErrorKind`] is the coarse class carried on
//! responses so callers can decide whether to retry.

use crate::limits::LimitError;
use std::io;
use thiserror::Error;

/// Result type alias for shard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error class reported on responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Rejected before reaching the WAL; never has side effects
    Validation,
    /// Physical write failed after bounded retries
    Durability,
    /// Checksum or structural failure in persisted data
    Corruption,
    /// Admission refused by backpressure; retry later
    Overloaded,
    /// Shard degraded to read-only after a durability failure
    ReadOnly,
    /// Defect contained at the loop boundary
    Internal,
    /// Command abandoned before reaching the WAL
    Aborted,
    /// Referenced entity does not exist
    NotFound,
}

impl ErrorKind {
    /// Stable lowercase name, used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Durability => "durability",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::ReadOnly => "read_only",
            ErrorKind::Internal => "internal",
            ErrorKind::Aborted => "aborted",
            ErrorKind::NotFound => "not_found",
        }
    }
}

/// Shard errors
#[derive(Debug, Error)]
pub enum Error {
    /// Logical limit violated (key length, dimension, ...)
    #[error("Validation failed: {0}")]
    Limit(#[from] LimitError),

    /// Command is structurally invalid for reasons other than size limits
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Configuration rejected by `ShardConfig::validate`
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error outside the WAL retry path
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// WAL write failed after all retries
    #[error("Durability failure: {0}")]
    Durability(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Admission control rejected the command
    #[error("Shard overloaded: {outstanding} outstanding operations (high watermark {high_watermark})")]
    Overloaded {
        /// Outstanding durability operations at rejection time
        outstanding: usize,
        /// Configured high watermark
        high_watermark: usize,
    },

    /// Cross-shard routing queue is full
    #[error("Routing queue to shard {0} is full")]
    RouteFull(usize),

    /// Shard is read-only after a durability failure
    #[error("Shard is read-only: {0}")]
    ReadOnly(String),

    /// Internal defect caught at the loop boundary
    #[error("Internal error: {0}")]
    Internal(String),

    /// Command dropped before durability (volatile state reset or shutdown)
    #[error("Command aborted: {0}")]
    Aborted(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Coarse class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Limit(_) | Error::InvalidCommand(_) | Error::InvalidConfig(_) => {
                ErrorKind::Validation
            }
            Error::Io(_) | Error::Durability(_) => ErrorKind::Durability,
            Error::Corruption(_) => ErrorKind::Corruption,
            Error::Overloaded { .. } | Error::RouteFull(_) => ErrorKind::Overloaded,
            Error::ReadOnly(_) => ErrorKind::ReadOnly,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Aborted(_) => ErrorKind::Aborted,
            Error::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Whether resubmitting the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Overloaded | ErrorKind::Aborted)
    }

    /// Build a corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Build an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Build an invalid-command error.
    pub fn invalid_command(msg: impl Into<String>) -> Self {
        Error::InvalidCommand(msg.into())
    }
}
