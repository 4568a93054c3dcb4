//! HNSW graph slices
//!
//! A slice indexes the live records of one segment. It is built once by
//! [`HnswBuilder`] from full-precision vectors and then frozen into
//! [`IndexSlice`], whose nodes, neighbor lists, codes and keys all live in one
//! flat byte buffer addressed by `u32` node positions. The same buffer is the
//! on-disk `.vidx` format, so a slice can be written, memory-mapped and
//! searched again without any fix-ups.
//!
//! Layer 0 holds every node with up to `2 * m` neighbors; higher layers hold
//! a geometrically thinning subset with up to `m` neighbors each.

mod builder;
mod format;
mod slice;

pub use builder::HnswBuilder;
pub use format::{sidecar_path, SLICE_EXTENSION, SLICE_MAGIC, SLICE_VERSION};
pub use slice::IndexSlice;

use std::cmp::Ordering;

/// Upper bound on assigned node levels.
pub(crate) const MAX_LEVEL: usize = 16;

/// Node position plus its distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Node position in the slice
    pub node: u32,
    /// Distance to the query; lower is closer
    pub distance: f32,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Closer first, then lower position
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.node.cmp(&other.node))
    }
}

/// Visited marks for graph traversal.
///
/// Clearing bumps a generation counter instead of zeroing the array.
#[derive(Debug)]
pub(crate) struct VisitedSet {
    marks: Vec<u16>,
    generation: u16,
}

impl VisitedSet {
    pub(crate) fn new(capacity: usize) -> Self {
        VisitedSet {
            marks: vec![0; capacity],
            generation: 1,
        }
    }

    pub(crate) fn clear(&mut self) {
        if self.generation == u16::MAX {
            self.marks.fill(0);
            self.generation = 1;
        } else {
            self.generation += 1;
        }
    }

    pub(crate) fn ensure_capacity(&mut self, capacity: usize) {
        if capacity > self.marks.len() {
            self.marks.resize(capacity, 0);
        }
    }

    /// Mark `node`; true if it was not yet visited.
    #[inline]
    pub(crate) fn insert(&mut self, node: u32) -> bool {
        let slot = &mut self.marks[node as usize];
        if *slot == self.generation {
            false
        } else {
            *slot = self.generation;
            true
        }
    }
}

/// SplitMix64 step, used for reproducible level assignment.
pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}
