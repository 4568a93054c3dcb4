//! Vector index for Quiver
//!
//! - `kernels`: runtime-selected f32 and integer distance kernels
//! - `quantizer`: 8-bit scalar quantization of stored vectors and queries
//! - `hnsw`: per-segment HNSW slices, built in memory and persisted as `.vidx`
//! - `snapshot`: the immutable slice set searched by a shard, with exact rerank
//!
//! Graph nodes refer to each other by `u32` position only, so a slice is the
//! same bytes in memory and on disk.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hnsw;
pub mod kernels;
pub mod quantizer;
pub mod snapshot;

pub use error::{IndexError, Result};
pub use hnsw::{sidecar_path, Candidate, HnswBuilder, IndexSlice};
pub use kernels::DistanceKernels;
pub use quantizer::{QuantizedQuery, ScalarQuantizer};
pub use snapshot::{IndexSnapshot, SearchParams, SnapshotCell, VectorSource};
