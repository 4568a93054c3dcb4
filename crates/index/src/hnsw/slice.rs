use super::format::{checksum, f32_at, u32_at, Layout, SliceHeader, HEADER_SIZE, NONE};
use super::{Candidate, VisitedSet};
use crate::error::{IndexError, Result};
use crate::kernels::DistanceKernels;
use crate::quantizer::QuantizedQuery;
use memmap2::Mmap;
use quiver_core::{DistanceMetric, Key};
use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::fs::File;
use std::io::Write;
use std::ops::Deref;
use std::path::Path;

enum SliceBytes {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Deref for SliceBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            SliceBytes::Owned(v) => v,
            SliceBytes::Mapped(m) => m,
        }
    }
}

/// Immutable, searchable HNSW graph over one segment's records.
///
/// All structure lives in one byte buffer (see the format module); node
/// references are `u32` positions into it, validated once when the slice is
/// constructed so traversal never leaves the buffer.
pub struct IndexSlice {
    bytes: SliceBytes,
    header: SliceHeader,
    layout: Layout,
}

impl std::fmt::Debug for IndexSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSlice")
            .field("segment_id", &self.header.segment_id)
            .field("nodes", &self.header.node_count)
            .field("mapped", &matches!(self.bytes, SliceBytes::Mapped(_)))
            .finish()
    }
}

impl IndexSlice {
    pub(crate) fn from_owned(bytes: Vec<u8>) -> Result<Self> {
        Self::validate(SliceBytes::Owned(bytes), "<memory>")
    }

    /// Memory-map and validate a slice file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: slice files are written once to a temporary name and renamed
        // into place; nothing modifies them while mapped.
        let mmap = unsafe { Mmap::map(&file)? };
        Self::validate(SliceBytes::Mapped(mmap), &path.display().to_string())
    }

    fn validate(bytes: SliceBytes, name: &str) -> Result<Self> {
        let header = SliceHeader::read(name, &bytes)?;
        let layout = Layout::new(&header);
        if layout.total != bytes.len() {
            return Err(IndexError::corruption(
                name,
                format!("expected {} bytes, found {}", layout.total, bytes.len()),
            ));
        }
        let stored = u32_at(&bytes, layout.crc, 0);
        if stored != checksum(&bytes, &layout) {
            return Err(IndexError::corruption(name, "checksum mismatch"));
        }

        let slice = IndexSlice {
            bytes,
            header,
            layout,
        };
        slice.check_structure(name)?;
        Ok(slice)
    }

    /// Positions, levels and key offsets must all stay in bounds.
    fn check_structure(&self, name: &str) -> Result<()> {
        let n = self.header.node_count;
        let m = self.header.m as usize;
        let bad = |detail: &str| IndexError::corruption(name, detail);

        if n == 0 {
            return if self.header.entry_point == NONE {
                Ok(())
            } else {
                Err(bad("entry point in empty slice"))
            };
        }
        if self.header.entry_point >= n {
            return Err(bad("entry point out of range"));
        }
        for node in 0..n {
            let level = self.level(node);
            if level > self.header.max_level as usize {
                return Err(bad("node level above max level"));
            }
            let start = u32_at(&self.bytes, self.layout.upper_start, node as usize);
            if level > 0 {
                let end = start as u64 + (level * m) as u64;
                if start == NONE || end > self.header.upper_slots as u64 {
                    return Err(bad("upper neighbor range out of bounds"));
                }
            }
            for layer in 0..=level {
                if self.neighbors(node, layer).any(|nb| nb >= n) {
                    return Err(bad("neighbor position out of range"));
                }
            }
        }
        let mut prev = 0;
        for i in 0..=n as usize {
            let off = u32_at(&self.bytes, self.layout.key_offsets, i);
            if off < prev || off > self.header.keys_bytes {
                return Err(bad("key offsets not monotonic"));
            }
            prev = off;
        }
        Ok(())
    }

    /// Write the slice to `path` atomically.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("vidx.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&self.bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        if let Some(dir) = path.parent() {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }

    /// Segment this slice indexes.
    pub fn segment_id(&self) -> u64 {
        self.header.segment_id
    }

    /// Node count.
    pub fn len(&self) -> usize {
        self.header.node_count as usize
    }

    /// Whether the slice has no nodes.
    pub fn is_empty(&self) -> bool {
        self.header.node_count == 0
    }

    /// Vector dimension.
    pub fn dimension(&self) -> usize {
        self.header.dimension as usize
    }

    /// Metric the graph was built under.
    pub fn metric(&self) -> DistanceMetric {
        self.header.metric
    }

    /// Whether the slice is backed by a mapped file.
    pub fn is_mapped(&self) -> bool {
        matches!(self.bytes, SliceBytes::Mapped(_))
    }

    /// Raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Origin key bytes of `node`.
    pub fn key_bytes(&self, node: u32) -> &[u8] {
        let i = node as usize;
        let start = u32_at(&self.bytes, self.layout.key_offsets, i) as usize;
        let end = u32_at(&self.bytes, self.layout.key_offsets, i + 1) as usize;
        &self.bytes[self.layout.keys + start..self.layout.keys + end]
    }

    /// Origin key of `node`.
    pub fn key(&self, node: u32) -> Key {
        Key::from(self.key_bytes(node))
    }

    /// Quantized codes of `node`.
    pub fn codes(&self, node: u32) -> &[u8] {
        let dim = self.dimension();
        let at = self.layout.codes + node as usize * dim;
        &self.bytes[at..at + dim]
    }

    /// Original magnitude of `node`.
    pub fn magnitude(&self, node: u32) -> f32 {
        f32_at(&self.bytes, self.layout.magnitudes, node as usize)
    }

    /// Highest layer `node` appears on.
    pub fn level(&self, node: u32) -> usize {
        u32_at(&self.bytes, self.layout.levels, node as usize) as usize
    }

    /// Neighbor positions of `node` on `layer`.
    pub fn neighbors(&self, node: u32, layer: usize) -> impl Iterator<Item = u32> + '_ {
        let m = self.header.m as usize;
        let (base, count) = if layer == 0 {
            (self.layout.layer0 + node as usize * 2 * m * 4, 2 * m)
        } else {
            let start = u32_at(&self.bytes, self.layout.upper_start, node as usize) as usize;
            (self.layout.upper + (start + (layer - 1) * m) * 4, m)
        };
        (0..count)
            .map(move |i| u32_at(&self.bytes, base, i))
            .take_while(|&nb| nb != NONE)
    }

    fn distance(&self, kernels: &DistanceKernels, query: &QuantizedQuery, node: u32) -> f32 {
        query.approx_distance(kernels, self.header.metric, self.codes(node), self.magnitude(node))
    }

    /// Approximate `k` nearest nodes by graph traversal with beam width `ef`.
    pub fn search(
        &self,
        kernels: &DistanceKernels,
        query: &QuantizedQuery,
        k: usize,
        ef: usize,
    ) -> Vec<Candidate> {
        if self.is_empty() || k == 0 {
            return Vec::new();
        }
        let mut visited = VisitedSet::new(self.len());
        let mut current = self.header.entry_point;
        let mut current_dist = self.distance(kernels, query, current);

        for layer in (1..=self.header.max_level as usize).rev() {
            let mut improved = true;
            while improved {
                improved = false;
                for nb in self.neighbors(current, layer) {
                    let d = self.distance(kernels, query, nb);
                    if d < current_dist || (d == current_dist && nb < current) {
                        current = nb;
                        current_dist = d;
                        improved = true;
                    }
                }
            }
        }

        let mut results = self.search_layer0(kernels, query, current, ef.max(k), &mut visited);
        results.truncate(k);
        results
    }

    fn search_layer0(
        &self,
        kernels: &DistanceKernels,
        query: &QuantizedQuery,
        entry: u32,
        ef: usize,
        visited: &mut VisitedSet,
    ) -> Vec<Candidate> {
        let start = Candidate {
            node: entry,
            distance: self.distance(kernels, query, entry),
        };
        visited.insert(entry);
        let mut frontier = BinaryHeap::from([Reverse(start)]);
        let mut best = BinaryHeap::from([start]);

        while let Some(Reverse(nearest)) = frontier.pop() {
            if best.len() >= ef && best.peek().map_or(false, |worst| nearest > *worst) {
                break;
            }
            for nb in self.neighbors(nearest.node, 0) {
                if !visited.insert(nb) {
                    continue;
                }
                let cand = Candidate {
                    node: nb,
                    distance: self.distance(kernels, query, nb),
                };
                if best.len() < ef || best.peek().map_or(true, |worst| cand < *worst) {
                    frontier.push(Reverse(cand));
                    best.push(cand);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }
        best.into_sorted_vec()
    }

    /// Nodes whose exact distance could be at most `threshold()`, given the
    /// quantization error bound. `threshold` is consulted per node, so a
    /// caller that tightens it while consuming the iterator prunes the rest.
    pub fn within_bound<'a>(
        &'a self,
        kernels: &'a DistanceKernels,
        query: &'a QuantizedQuery,
        threshold: impl Fn() -> f32 + 'a,
    ) -> impl Iterator<Item = u32> + 'a {
        (0..self.header.node_count).filter(move |&node| {
            let lower = self.distance(kernels, query, node)
                - query.error_bound(self.header.metric, self.magnitude(node));
            lower <= threshold()
        })
    }

    /// Approximate distance to every node, closest `k` returned.
    pub fn scan(&self, kernels: &DistanceKernels, query: &QuantizedQuery, k: usize) -> Vec<Candidate> {
        let mut all: Vec<Candidate> = (0..self.header.node_count)
            .map(|node| Candidate {
                node,
                distance: self.distance(kernels, query, node),
            })
            .collect();
        all.sort();
        all.truncate(k);
        all
    }
}
