//! Quiver - shard-per-core durable vector database engine
//!
//! Each shard owns a write-ahead log, a MemTable, leveled segments and an
//! HNSW index over quantized vectors, all driven from a single thread.
//! Mutations are acknowledged only once their WAL record is durable;
//! searches rerank quantized candidates with exact distances.
//!
//! # Quick Start
//!
//! ```ignore
//! use quiver::{Command, ShardConfig, ShardRuntime, VectorRecord};
//! use std::time::Duration;
//!
//! let runtime = ShardRuntime::spawn(path, 4, ShardConfig::default())?;
//! runtime.submit(Command::upsert(1, "doc-1", VectorRecord::from_vector(vec![0.1; 128])))?;
//! let (shard, response) = runtime.recv_response(Duration::from_secs(1)).unwrap();
//! ```
//!
//! # Crates
//!
//! - `quiver-core`: commands, responses, keys, configuration and errors
//! - `quiver-durability`: the WAL, its I/O drivers and crash recovery
//! - `quiver-storage`: MemTables, segments, the manifest and compaction
//! - `quiver-index`: HNSW slices, quantization and distance kernels
//! - `quiver-engine`: shards, maintenance and the per-core runtime

pub use quiver_core::{
    Command, CommandKind, CorrelationToken, DistanceMetric, Error, ErrorKind, Key, Lsn, Response,
    ResponsePayload, Result, SearchHit, ShardConfig, ShardId, Status, VectorRecord,
};
pub use quiver_engine::{
    init_tracing, merge_hits, shard_dir, shard_for, RecoveryReport, Shard, ShardPhase,
    ShardRuntime, ShardStats,
};

pub use quiver_durability as durability;
pub use quiver_engine as engine;
pub use quiver_index as index;
pub use quiver_storage as storage;
