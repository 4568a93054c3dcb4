//! Flush, compaction and search working together on one shard

use quiver_core::{Command, CorrelationToken, Key, Response, ResponsePayload, SearchHit, ShardConfig, VectorRecord};
use quiver_engine::Shard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tempfile::TempDir;

const SETTLE: Duration = Duration::from_secs(30);

fn random_vector(rng: &mut StdRng) -> Vec<f32> {
    (0..8).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn settle(shard: &mut Shard) -> Vec<Response> {
    assert!(shard.run_until_idle(SETTLE), "shard did not settle: {:?}", shard.stats());
    shard.drain_responses()
}

fn hits(responses: &[Response], id: u64) -> Vec<SearchHit> {
    let response = responses
        .iter()
        .find(|r| r.correlation == CorrelationToken(id))
        .unwrap_or_else(|| panic!("no response for {}", id));
    match &response.payload {
        ResponsePayload::Hits(h) => h.clone(),
        other => panic!("expected hits, got {:?}", other),
    }
}

fn l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Write `batches` batches, flushing after each, so level 0 overflows.
fn load(shard: &mut Shard, rng: &mut StdRng, batches: usize, per_batch: usize) -> Vec<(Key, Vec<f32>)> {
    let mut written = Vec::new();
    let mut id = 0u64;
    for b in 0..batches {
        for i in 0..per_batch {
            id += 1;
            let key = Key::from(format!("b{}-{:03}", b, i));
            let v = random_vector(rng);
            shard
                .submit(Command::upsert(id, key.clone(), VectorRecord::from_vector(v.clone())))
                .unwrap();
            written.push((key, v));
        }
        settle(shard);
        assert!(shard.force_flush());
        settle(shard);
    }
    written
}

#[test]
fn test_compaction_merges_level0_and_search_survives() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let mut shard = Shard::open(0, dir.path(), ShardConfig::for_testing()).unwrap();

    let written = load(&mut shard, &mut rng, 4, 50);
    let stats = shard.stats();
    assert_eq!(stats.flushes, 4);
    assert!(stats.compactions >= 1, "no compaction ran: {:?}", stats);
    assert!(stats.segments < 4);
    assert_eq!(stats.checkpoint_lsn, 200);

    // Exact self-match for a sample of keys from every batch
    let mut id = 10_000;
    let sample: Vec<_> = written.iter().step_by(17).cloned().collect();
    for (_, v) in &sample {
        id += 1;
        shard.submit(Command::search(id, v.clone(), 5)).unwrap();
    }
    let responses = settle(&mut shard);
    for (n, (key, _)) in sample.iter().enumerate() {
        let found = hits(&responses, 10_001 + n as u64);
        assert_eq!(&found[0].key, key);
        assert!(found[0].distance.abs() < 1e-5);
        assert!(found.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    shard.submit(Command::get(20_000, written[3].0.clone())).unwrap();
    let responses = settle(&mut shard);
    assert_eq!(
        responses[0].payload,
        ResponsePayload::Value(Some(VectorRecord::from_vector(written[3].1.clone())))
    );
}

#[test]
fn test_overwrites_and_deletes_survive_compaction() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let mut shard = Shard::open(0, dir.path(), ShardConfig::for_testing()).unwrap();

    let written = load(&mut shard, &mut rng, 2, 40);
    let replaced = written[5].0.clone();
    let deleted = written[45].0.clone();
    let fresh = random_vector(&mut rng);
    shard
        .submit(Command::upsert(500, replaced.clone(), VectorRecord::from_vector(fresh.clone())))
        .unwrap();
    shard.submit(Command::delete(501, deleted.clone())).unwrap();
    settle(&mut shard);
    assert!(shard.force_flush());
    settle(&mut shard);
    shard.request_compaction();
    settle(&mut shard);
    assert!(shard.stats().compactions >= 1);

    shard.submit(Command::get(600, replaced.clone())).unwrap();
    shard.submit(Command::get(601, deleted.clone())).unwrap();
    shard.submit(Command::search(602, written[45].1.clone(), 80)).unwrap();
    shard.submit(Command::search(603, written[5].1.clone(), 80)).unwrap();
    let responses = settle(&mut shard);

    let value = |id| {
        responses
            .iter()
            .find(|r| r.correlation == CorrelationToken(id))
            .map(|r| r.payload.clone())
            .unwrap()
    };
    assert_eq!(
        value(600),
        ResponsePayload::Value(Some(VectorRecord::from_vector(fresh.clone())))
    );
    assert_eq!(value(601), ResponsePayload::Value(None));

    // Search is exact: every one of the 79 live keys comes back
    let around_deleted = hits(&responses, 602);
    assert_eq!(around_deleted.len(), 79);
    assert!(around_deleted.iter().all(|h| h.key != deleted));

    // The replaced key is scored by its new vector, and appears once
    let around_old = hits(&responses, 603);
    let entries: Vec<_> = around_old.iter().filter(|h| h.key == replaced).collect();
    assert_eq!(entries.len(), 1);
    assert!((entries[0].distance - l2(&written[5].1, &fresh)).abs() < 1e-4);
}

#[test]
fn test_reopen_after_compaction_loads_slices() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let (written, segments) = {
        let mut shard = Shard::open(0, dir.path(), ShardConfig::for_testing()).unwrap();
        let written = load(&mut shard, &mut rng, 3, 30);
        let segments = shard.stats().segments;
        shard.shutdown(SETTLE).unwrap();
        (written, segments)
    };

    let mut shard = Shard::open(0, dir.path(), ShardConfig::for_testing()).unwrap();
    let report = shard.recovery_report().clone();
    assert_eq!(report.segments, segments);
    assert_eq!(report.records_replayed, 0);
    assert_eq!(shard.stats().index_nodes, written.len());

    shard.submit(Command::search(1, written[77].1.clone(), 1)).unwrap();
    let responses = settle(&mut shard);
    assert_eq!(hits(&responses, 1)[0].key, written[77].0);
}
