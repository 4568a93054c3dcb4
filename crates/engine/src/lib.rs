//! Shard engine for Quiver
//!
//! This crate ties the lower layers into running shards:
//! - CommandMachine: per-command lifecycle state
//! - ShardContext: everything one shard owns, opened through recovery
//! - Shard: the single-threaded coordinator loop with backpressure and
//!   fault isolation
//! - MaintenanceWorker: background flush, compaction and index slice builds
//! - ShardMesh: bounded SPSC queues forwarding misrouted commands
//! - ShardRuntime: one thread per shard
//!
//! The engine is the only component that knows about:
//! - Command admission and acknowledgment order
//! - Cross-layer coordination (WAL + MemTable + segments + index)
//! - When maintenance runs

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod maintenance;
pub mod mesh;
pub mod reader;
pub mod runtime;
pub mod shard;
pub mod slices;
pub mod state;
pub mod stats;

pub use context::{RecoveryReport, ShardContext, WAL_DIR};
pub use maintenance::{MaintenanceEvent, MaintenanceTask, MaintenanceWorker};
pub use mesh::{shard_for, RouteError, ShardLink, ShardMesh};
pub use reader::ShardReader;
pub use runtime::{merge_hits, shard_dir, ShardRuntime, ThreadHook};
pub use shard::{CommandHook, Shard, ShardPhase};
pub use state::{CommandMachine, CommandState, TransitionError};
pub use stats::ShardStats;

use std::sync::OnceLock;

static TRACING: OnceLock<()> = OnceLock::new();

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; only the first call has an effect, and it
/// does nothing if another global subscriber is already set.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
