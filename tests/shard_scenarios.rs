//! End-to-end shard scenarios
//!
//! Each test drives shards through the public `quiver` API only: torn WAL
//! tails, delete-then-flush, backpressure, and a multi-shard restart.

use quiver::durability::testing::{find_record, truncate_to};
use quiver::durability::ManualDriver;
use quiver::engine::WAL_DIR;
use quiver::{
    merge_hits, shard_for, Command, CorrelationToken, ErrorKind, Key, Response, ResponsePayload,
    SearchHit, Shard, ShardConfig, ShardId, ShardRuntime, VectorRecord,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::TempDir;

const SETTLE: Duration = Duration::from_secs(20);

fn vector(seed: u64) -> Vec<f32> {
    (0..8).map(|i| ((seed * 29 + i * 11) % 113) as f32 / 113.0).collect()
}

fn upsert(id: u64, key: &str) -> Command {
    Command::upsert(id, key, VectorRecord::from_vector(vector(id)))
}

fn settle(shard: &mut Shard) -> Vec<Response> {
    assert!(shard.run_until_idle(SETTLE), "shard did not settle: {:?}", shard.stats());
    shard.drain_responses()
}

fn payload_of(responses: &[Response], id: u64) -> ResponsePayload {
    responses
        .iter()
        .find(|r| r.correlation == CorrelationToken(id))
        .map(|r| r.payload.clone())
        .unwrap_or_else(|| panic!("no response for {}", id))
}

#[test]
fn test_torn_record_seven_recovers_one_through_six() {
    let dir = TempDir::new().unwrap();
    {
        let mut shard = Shard::open(0, dir.path(), ShardConfig::for_testing()).unwrap();
        for id in 1..=10 {
            shard.submit(upsert(id, &format!("t{}", id))).unwrap();
        }
        let responses = settle(&mut shard);
        assert_eq!(responses.len(), 10);
        assert_eq!(shard.stats().durable_lsn, 10);
    }

    // Crash mid-write of record 7: its second half never reached disk
    let wal_dir = dir.path().join(WAL_DIR);
    let (path, loc) = find_record(&wal_dir, 7).unwrap().expect("record 7 on disk");
    truncate_to(&path, loc.offset + loc.len / 2).unwrap();

    let mut shard = Shard::open(0, dir.path(), ShardConfig::for_testing()).unwrap();
    let report = shard.recovery_report().clone();
    assert_eq!(report.records_replayed, 6);
    assert_eq!(report.last_lsn, 6);
    assert!(report.truncated_bytes > 0);

    for id in 1..=10 {
        shard.submit(Command::get(100 + id, format!("t{}", id))).unwrap();
    }
    shard.submit(upsert(11, "after-crash")).unwrap();
    let responses = settle(&mut shard);
    for id in 1..=6 {
        assert!(matches!(payload_of(&responses, 100 + id), ResponsePayload::Value(Some(_))));
    }
    for id in 7..=10 {
        assert_eq!(payload_of(&responses, 100 + id), ResponsePayload::Value(None));
    }
    // The LSN sequence resumes right after the last intact record
    assert_eq!(payload_of(&responses, 11), ResponsePayload::Committed { lsn: 7 });
}

#[test]
fn test_put_delete_flush_reads_not_found() {
    let dir = TempDir::new().unwrap();
    let mut shard = Shard::open(0, dir.path(), ShardConfig::for_testing()).unwrap();

    shard.submit(upsert(1, "a")).unwrap();
    shard.submit(upsert(2, "b")).unwrap();
    shard.submit(Command::delete(3, "a")).unwrap();
    let responses = settle(&mut shard);
    assert_eq!(payload_of(&responses, 3), ResponsePayload::Committed { lsn: 3 });

    assert!(shard.force_flush());
    settle(&mut shard);
    assert_eq!(shard.stats().checkpoint_lsn, 3);

    shard.submit(Command::get(10, "a")).unwrap();
    shard.submit(Command::get(11, "b")).unwrap();
    shard.submit(Command::search(12, vector(1), 5)).unwrap();
    let responses = settle(&mut shard);
    assert_eq!(payload_of(&responses, 10), ResponsePayload::Value(None));
    assert_eq!(
        payload_of(&responses, 11),
        ResponsePayload::Value(Some(VectorRecord::from_vector(vector(2))))
    );
    match payload_of(&responses, 12) {
        ResponsePayload::Hits(hits) => {
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].key, Key::from("b"));
        }
        other => panic!("expected hits, got {:?}", other),
    }

    // Deleting a key that never existed still commits
    shard.submit(Command::delete(20, "ghost")).unwrap();
    let responses = settle(&mut shard);
    assert_eq!(payload_of(&responses, 20), ResponsePayload::Committed { lsn: 4 });
}

#[test]
fn test_backpressure_rejects_beyond_high_watermark() {
    let dir = TempDir::new().unwrap();
    let driver = ManualDriver::new();
    let mut shard = Shard::open_with_driver(
        0,
        dir.path(),
        ShardConfig::for_testing(),
        Box::new(driver.clone()),
    )
    .unwrap();

    let mut accepted = 0;
    let mut overloaded = 0;
    for id in 1..=300 {
        match shard.submit(upsert(id, &format!("bp{}", id))) {
            Ok(()) => accepted += 1,
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::Overloaded);
                overloaded += 1;
            }
        }
    }
    assert_eq!(accepted, 256);
    assert_eq!(overloaded, 44);
    assert!(shard.stats().throttled);

    // Searches are never throttled
    shard.submit(Command::search(999, vector(3), 1)).unwrap();

    for _ in 0..20_000 {
        driver.complete_all();
        if shard.tick() {
            continue;
        }
        if shard.is_idle() {
            break;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    assert!(shard.is_idle());
    let stats = shard.stats();
    assert_eq!(stats.committed, 256);
    assert_eq!(stats.outstanding, 0);
    assert!(!stats.throttled);
    shard.submit(upsert(1000, "after")).unwrap();
}

#[test]
fn test_restart_across_shards_keeps_contents() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let shards = 3;
    let mut model: BTreeMap<String, Option<Vec<f32>>> = BTreeMap::new();

    let collect = |runtime: &ShardRuntime, n: usize| -> Vec<(ShardId, Response)> {
        (0..n)
            .map(|_| runtime.recv_response(SETTLE).expect("response"))
            .collect()
    };

    {
        let mut runtime = ShardRuntime::spawn(dir.path(), shards, ShardConfig::for_testing()).unwrap();
        let mut expected = 0;
        for id in 0..200u64 {
            let key = format!("doc-{}", rng.gen_range(0..80));
            let command = if rng.gen_bool(0.2) {
                model.insert(key.clone(), None);
                Command::delete(id, key)
            } else {
                let v: Vec<f32> = (0..8).map(|_| rng.gen_range(-1.0..1.0)).collect();
                model.insert(key.clone(), Some(v.clone()));
                Command::upsert(id, key, VectorRecord::from_vector(v))
            };
            expected += runtime.submit(command).unwrap();
        }
        let responses = collect(&runtime, expected);
        assert!(responses.iter().all(|(_, r)| r.status.is_ok()));
        for (shard, response) in &responses {
            assert!(*shard < shards);
            assert!(matches!(response.payload, ResponsePayload::Committed { .. }));
        }
        runtime.shutdown().unwrap();
    }

    let mut runtime = ShardRuntime::spawn(dir.path(), shards, ShardConfig::for_testing()).unwrap();
    let keys: Vec<String> = model.keys().cloned().collect();
    for (i, key) in keys.iter().enumerate() {
        runtime.submit(Command::get(10_000 + i as u64, key.as_str())).unwrap();
    }
    let responses = collect(&runtime, keys.len());
    for (shard, response) in &responses {
        let key = &keys[(response.correlation.0 - 10_000) as usize];
        assert_eq!(*shard, shard_for(&Key::from(key.as_str()), shards));
        let got = match &response.payload {
            ResponsePayload::Value(v) => v.as_ref().map(|r| r.vector.clone()),
            other => panic!("unexpected payload {:?}", other),
        };
        assert_eq!(&got, &model[key], "key {}", key);
    }

    // A live vector is its own nearest neighbour across the merged shards
    let (query_key, query) = model
        .iter()
        .find_map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
        .expect("at least one live key");
    let expected = runtime.submit(Command::search(20_000, query, 4)).unwrap();
    let parts: Vec<Vec<SearchHit>> = collect(&runtime, expected)
        .into_iter()
        .map(|(_, r)| match r.payload {
            ResponsePayload::Hits(h) => h,
            other => panic!("expected hits, got {:?}", other),
        })
        .collect();
    let hits = merge_hits(parts, 4);
    assert_eq!(hits[0].key, Key::from(query_key.as_str()));
    runtime.shutdown().unwrap();
}
