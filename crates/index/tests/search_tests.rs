//! End-to-end search tests: several slices, persisted and reloaded, searched
//! through a snapshot against a brute-force oracle.

use proptest::prelude::*;
use quiver_core::{DistanceMetric, IndexSettings, Key};
use quiver_index::{
    sidecar_path, DistanceKernels, HnswBuilder, IndexSlice, IndexSnapshot, SearchParams,
    VectorSource,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

struct Corpus {
    vectors: BTreeMap<Key, Vec<f32>>,
}

impl VectorSource for Corpus {
    fn current(&self, key: &Key) -> quiver_index::Result<Option<Vec<f32>>> {
        Ok(self.vectors.get(key).cloned())
    }

    fn for_each_unindexed(&self, _visit: &mut dyn FnMut(&Key, &[f32])) -> quiver_index::Result<()> {
        Ok(())
    }
}

/// Default tuning, so the graph path (not the exhaustive scan) is what runs.
fn settings(metric: DistanceMetric) -> IndexSettings {
    IndexSettings {
        dimension: 32,
        metric,
        ..IndexSettings::default()
    }
}

fn random_corpus(seed: u64, n: usize, dim: usize) -> Vec<(Key, Vec<f32>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let v = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            (Key::from(format!("key-{:05}", i)), v)
        })
        .collect()
}

/// Split the corpus into `parts` slices, write each and map it back.
fn persisted_snapshot(
    dir: &Path,
    settings: &IndexSettings,
    corpus: &[(Key, Vec<f32>)],
    parts: usize,
) -> IndexSnapshot {
    let mut slices = Vec::new();
    for (i, chunk) in corpus.chunks((corpus.len() + parts - 1) / parts).enumerate() {
        let mut builder = HnswBuilder::new(settings.clone());
        for (key, v) in chunk {
            builder.insert(key.clone(), v).unwrap();
        }
        let id = i as u64 + 1;
        let path = sidecar_path(&dir.join(format!("seg-{:08}.qseg", id)));
        builder.build(id).unwrap().write_to(&path).unwrap();
        slices.push(Arc::new(IndexSlice::open(&path).unwrap()));
    }
    IndexSnapshot::new().with_changes(slices, &[])
}

fn brute_force(
    metric: DistanceMetric,
    corpus: &[(Key, Vec<f32>)],
    query: &[f32],
    k: usize,
) -> Vec<(Key, f32)> {
    let kernels = DistanceKernels::global();
    let mut all: Vec<(f32, &Key)> = corpus
        .iter()
        .map(|(key, v)| (kernels.distance(metric, query, v), key))
        .collect();
    all.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    all.into_iter().take(k).map(|(d, key)| (key.clone(), d)).collect()
}

#[test]
fn test_search_matches_brute_force_across_persisted_slices() {
    let dir = tempfile::tempdir().unwrap();
    for (metric, n, queries) in [
        (DistanceMetric::Euclidean, 3000, 100),
        (DistanceMetric::Cosine, 900, 30),
        (DistanceMetric::DotProduct, 900, 30),
    ] {
        let settings = settings(metric);
        let corpus = random_corpus(17, n, settings.dimension);
        let snapshot = persisted_snapshot(dir.path(), &settings, &corpus, 3);
        assert!(snapshot.slices().iter().all(|s| s.is_mapped()));
        assert!(snapshot
            .slices()
            .iter()
            .all(|s| s.len() > settings.exhaustive_threshold));
        let source = Corpus {
            vectors: corpus.iter().cloned().collect(),
        };

        let mut rng = StdRng::seed_from_u64(99);
        let k = 10;
        for _ in 0..queries {
            let q: Vec<f32> = (0..settings.dimension)
                .map(|_| rng.gen_range(-1.0..1.0))
                .collect();
            let params = SearchParams::new(&settings, k, None);
            let hits: Vec<(Key, f32)> = snapshot
                .search(&q, &params, &source)
                .unwrap()
                .into_iter()
                .map(|h| (h.key, h.distance))
                .collect();
            assert_eq!(hits, brute_force(metric, &corpus, &q, k), "{:?}", metric);
        }
    }
}

#[test]
fn test_corrupt_sidecar_detected_and_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(DistanceMetric::Euclidean);
    let corpus = random_corpus(5, 50, settings.dimension);
    let path = sidecar_path(&dir.path().join("seg-00000001.qseg"));

    let build = || {
        let mut b = HnswBuilder::new(settings.clone());
        for (key, v) in &corpus {
            b.insert(key.clone(), v).unwrap();
        }
        b.build(1).unwrap()
    };
    build().write_to(&path).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 10;
    bytes[last] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();
    assert!(IndexSlice::open(&path).is_err());

    // Rebuilding from the same records reproduces the original bytes
    let rebuilt = build();
    rebuilt.write_to(&path).unwrap();
    let reopened = IndexSlice::open(&path).unwrap();
    assert_eq!(reopened.as_bytes(), rebuilt.as_bytes());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// With every node reachable by exhaustive scan the result is exactly the
    /// brute-force answer, ties included.
    #[test]
    fn prop_exhaustive_matches_brute_force(
        points in prop::collection::vec((-4i8..4, -4i8..4), 1..40),
        qx in -4i8..4,
        qy in -4i8..4,
        k in 1usize..8,
    ) {
        let settings = IndexSettings {
            dimension: 2,
            exhaustive_threshold: usize::MAX,
            rerank_factor: 64,
            ..IndexSettings::default()
        };
        let corpus: Vec<(Key, Vec<f32>)> = points
            .iter()
            .enumerate()
            .map(|(i, (x, y))| (Key::from(format!("p{:03}", i)), vec![*x as f32, *y as f32]))
            .collect();
        let mut b = HnswBuilder::new(settings.clone());
        for (key, v) in &corpus {
            b.insert(key.clone(), v).unwrap();
        }
        let snapshot = IndexSnapshot::new().with_changes(vec![Arc::new(b.build(1).unwrap())], &[]);
        let source = Corpus { vectors: corpus.iter().cloned().collect() };
        let query = [qx as f32, qy as f32];
        let hits = snapshot
            .search(&query, &SearchParams::new(&settings, k, None), &source)
            .unwrap();
        let got: Vec<(Key, f32)> = hits.into_iter().map(|h| (h.key, h.distance)).collect();
        prop_assert_eq!(got, brute_force(settings.metric, &corpus, &query, k));
    }
}
