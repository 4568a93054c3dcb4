//! Core types for Quiver
//!
//! This crate defines the vocabulary shared by every layer of a shard:
//! - Lsn, ShardId, CommandId, CorrelationToken, Key
//! - VectorRecord, Value (record or tombstone), DistanceMetric
//! - Command / Response: typed ingress and egress
//! - Error / ErrorKind: the shard-level error taxonomy
//! - Limits: logical invariants re-validated on every command
//! - ShardConfig: `quiver.toml` configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod config;
pub mod error;
pub mod limits;
pub mod platform;
pub mod types;
pub mod value;

pub use command::{
    Command, CommandKind, CommandPayload, Response, ResponsePayload, SearchHit, SearchRequest,
    Status,
};
pub use config::{
    CompactionSettings, IndexSettings, MemTableSettings, SchedulerSettings, ShardConfig,
    WalSettings, CONFIG_FILE_NAME,
};
pub use error::{Error, ErrorKind, Result};
pub use limits::{LimitError, Limits};
pub use types::{CommandId, CorrelationToken, Key, Lsn, ShardId};
pub use value::{DistanceMetric, Value, ValueDecodeError, VectorRecord, VersionedValue};
