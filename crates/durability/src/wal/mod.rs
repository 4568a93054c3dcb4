//! Write-ahead log
//!
//! - `config`: sizing, retry and in-flight window parameters
//! - `batch`: group-commit accumulator producing sector-aligned batches
//! - `io`: completion-based drivers (threaded and manual)
//! - `writer`: the [`Wal`] itself
//! - `reader`: torn-tail aware scanning and lazy replay

pub mod batch;
pub mod config;
pub mod io;
pub mod reader;
pub mod writer;

pub use batch::{BatchAccumulator, RecordBoundary, SealedBatch};
pub use config::{WalConfig, WalConfigError};
pub use io::{BatchId, Completion, IoDriver, ManualDriver, ThreadedDriver, WriteRequest};
pub use reader::{ReadStopReason, WalFileInfo, WalLayout, WalReader, WalReaderError, WalReplay};
pub use writer::{Wal, WalCounters, WalError, WalEvent};
