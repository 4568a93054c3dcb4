//! Index snapshots
//!
//! An [`IndexSnapshot`] is the immutable set of slices covering a shard's
//! live segments. Flushes and compactions build slices off the hot path and
//! publish a new snapshot through [`SnapshotCell`]; searches load the current
//! one without locking and keep it alive for as long as they run.
//!
//! Slices only ever yield candidates. Final distances are exact, computed
//! against whatever [`VectorSource`] reports as the key's current vector, so
//! an outdated slice entry can neither resurrect a deleted key nor rank a key
//! by a vector it no longer has.
//!
//! The result is the exact top `k`. Graph traversal gathers a candidate pool
//! whose reranked distances set a threshold; every slice is then swept on its
//! quantized codes and any node whose approximate distance, less the
//! quantization error bound, does not clear the threshold is reranked too.
//! A good pool makes that sweep rerank almost nothing.

use crate::error::{IndexError, Result};
use crate::hnsw::IndexSlice;
use crate::kernels::DistanceKernels;
use crate::quantizer::ScalarQuantizer;
use arc_swap::ArcSwap;
use quiver_core::{DistanceMetric, IndexSettings, Key, SearchHit};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::Cell;
use std::sync::Arc;

/// Full-precision vectors backing a search.
pub trait VectorSource {
    /// Current vector of `key`, or `None` if it is deleted or absent.
    fn current(&self, key: &Key) -> Result<Option<Vec<f32>>>;

    /// Visit every live record not yet covered by any slice.
    fn for_each_unindexed(&self, visit: &mut dyn FnMut(&Key, &[f32])) -> Result<()>;
}

/// Parameters of one search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    /// Results wanted
    pub k: usize,
    /// Beam width per slice
    pub ef: usize,
    /// Candidates gathered per wanted result before rerank
    pub rerank_factor: usize,
    /// Slices this small are scanned instead of traversed
    pub exhaustive_threshold: usize,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Expected query dimension
    pub dimension: usize,
}

impl SearchParams {
    /// Parameters for a `k` search, with `breadth` overriding the default beam.
    pub fn new(settings: &IndexSettings, k: usize, breadth: Option<usize>) -> Self {
        SearchParams {
            k,
            ef: breadth.unwrap_or(settings.ef_search),
            rerank_factor: settings.rerank_factor.max(1),
            exhaustive_threshold: settings.exhaustive_threshold,
            metric: settings.metric,
            dimension: settings.dimension,
        }
    }

    fn pool(&self) -> usize {
        self.k.saturating_mul(self.rerank_factor).max(self.k)
    }
}

/// The `k` smallest exact distances seen so far.
struct KthBest {
    k: usize,
    best: Vec<f32>,
}

impl KthBest {
    fn new(k: usize) -> Self {
        KthBest {
            k,
            best: Vec::with_capacity(k + 1),
        }
    }

    fn push(&mut self, distance: f32) {
        let at = self.best.partition_point(|d| d.total_cmp(&distance).is_le());
        if at < self.k {
            self.best.insert(at, distance);
            self.best.truncate(self.k);
        }
    }

    /// Distance a key must not exceed to make the top `k`.
    fn threshold(&self) -> f32 {
        if self.best.len() < self.k {
            f32::INFINITY
        } else {
            self.best[self.k - 1]
        }
    }
}

/// Immutable set of slices, ordered by segment id.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    slices: Vec<Arc<IndexSlice>>,
}

impl IndexSnapshot {
    /// Empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot with `added` slices and without slices of `removed` segments.
    pub fn with_changes(&self, added: Vec<Arc<IndexSlice>>, removed: &[u64]) -> IndexSnapshot {
        let mut slices: Vec<Arc<IndexSlice>> = self
            .slices
            .iter()
            .filter(|s| !removed.contains(&s.segment_id()))
            .cloned()
            .collect();
        for slice in added {
            slices.retain(|s| s.segment_id() != slice.segment_id());
            slices.push(slice);
        }
        slices.sort_by_key(|s| s.segment_id());
        IndexSnapshot { slices }
    }

    /// Slices in segment id order.
    pub fn slices(&self) -> &[Arc<IndexSlice>] {
        &self.slices
    }

    /// Whether a slice for `segment_id` is present.
    pub fn contains(&self, segment_id: u64) -> bool {
        self.slices.iter().any(|s| s.segment_id() == segment_id)
    }

    /// Total nodes across slices.
    pub fn node_count(&self) -> usize {
        self.slices.iter().map(|s| s.len()).sum()
    }

    /// The `k` keys closest to `query`, exact distances, ties to the lower key.
    pub fn search(
        &self,
        query: &[f32],
        params: &SearchParams,
        source: &dyn VectorSource,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != params.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: params.dimension,
                actual: query.len(),
            });
        }
        if params.k == 0 {
            return Ok(Vec::new());
        }
        let kernels = DistanceKernels::global();
        let exact = |v: &[f32]| kernels.distance(params.metric, query, v);

        // Recent records are exact already and shadow any slice entry
        let mut scored: FxHashMap<Key, f32> = FxHashMap::default();
        source.for_each_unindexed(&mut |key, vector| {
            if vector.len() == params.dimension {
                scored.insert(key.clone(), exact(vector));
            }
        })?;
        let unindexed = scored.len();

        let quantized = ScalarQuantizer::quantize_query(query);
        let pool = params.pool();
        let mut candidates: FxHashSet<Key> = FxHashSet::default();
        for slice in &self.slices {
            if slice.dimension() != params.dimension {
                continue;
            }
            let found = if slice.len() <= params.exhaustive_threshold {
                slice.scan(kernels, &quantized, pool)
            } else {
                slice.search(kernels, &quantized, pool, params.ef.max(pool))
            };
            for c in found {
                let key = slice.key(c.node);
                if !scored.contains_key(&key) {
                    candidates.insert(key);
                }
            }
        }

        let rerank = |key: &Key| -> Result<Option<f32>> {
            Ok(source
                .current(key)?
                .filter(|v| v.len() == params.dimension)
                .map(|v| exact(&v)))
        };
        for key in &candidates {
            if let Some(d) = rerank(key)? {
                scored.insert(key.clone(), d);
            }
        }
        let pooled = candidates.len();

        let mut best = KthBest::new(params.k);
        for d in scored.values() {
            best.push(*d);
        }
        let threshold = Cell::new(best.threshold());
        for slice in &self.slices {
            if slice.dimension() != params.dimension {
                continue;
            }
            for node in slice.within_bound(kernels, &quantized, || threshold.get()) {
                let key = slice.key(node);
                if scored.contains_key(&key) || !candidates.insert(key.clone()) {
                    continue;
                }
                if let Some(d) = rerank(&key)? {
                    scored.insert(key, d);
                    best.push(d);
                    threshold.set(best.threshold());
                }
            }
        }
        let reranked = candidates.len();

        let mut hits: Vec<SearchHit> = scored
            .into_iter()
            .map(|(key, distance)| SearchHit { key, distance })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.key.cmp(&b.key)));
        hits.truncate(params.k);

        tracing::debug!(
            target: "quiver::index",
            slices = self.slices.len(),
            unindexed,
            pooled,
            reranked,
            returned = hits.len(),
            "Search complete"
        );
        Ok(hits)
    }
}

/// Atomically swappable current snapshot.
#[derive(Debug)]
pub struct SnapshotCell {
    current: ArcSwap<IndexSnapshot>,
}

impl Default for SnapshotCell {
    fn default() -> Self {
        SnapshotCell {
            current: ArcSwap::from_pointee(IndexSnapshot::new()),
        }
    }
}

impl SnapshotCell {
    /// Cell holding `snapshot`.
    pub fn new(snapshot: IndexSnapshot) -> Self {
        SnapshotCell {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<IndexSnapshot> {
        self.current.load_full()
    }

    /// Replace the current snapshot.
    pub fn install(&self, snapshot: IndexSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    /// Apply slice changes on top of the current snapshot.
    pub fn apply(&self, added: Vec<Arc<IndexSlice>>, removed: &[u64]) {
        self.current
            .rcu(|current| current.with_changes(added.clone(), removed));
    }
}
