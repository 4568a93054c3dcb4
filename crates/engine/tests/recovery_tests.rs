//! Crash and replay tests for a single shard
//!
//! Every acknowledged mutation must be visible after reopening, whether the
//! shard stopped cleanly or was simply dropped, and reopening twice in a row
//! must land in the same state.

use proptest::prelude::*;
use quiver_core::{Command, CorrelationToken, Response, ResponsePayload, ShardConfig, VectorRecord};
use quiver_engine::Shard;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const KEYS: usize = 12;
const SETTLE: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
enum Op {
    Upsert { key: usize, seed: u32 },
    Delete { key: usize },
    Flush,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..KEYS, any::<u32>()).prop_map(|(key, seed)| Op::Upsert { key, seed }),
        2 => (0..KEYS).prop_map(|key| Op::Delete { key }),
        1 => Just(Op::Flush),
    ]
}

fn key_name(i: usize) -> String {
    format!("key-{:02}", i)
}

fn vector(seed: u32) -> Vec<f32> {
    (0..8u32)
        .map(|i| (seed.wrapping_mul(2654435761).wrapping_add(i * 97) % 1000) as f32 / 1000.0)
        .collect()
}

fn open(path: &Path) -> Shard {
    Shard::open(0, path, ShardConfig::for_testing()).unwrap()
}

fn settle(shard: &mut Shard) -> Vec<Response> {
    assert!(shard.run_until_idle(SETTLE), "shard did not settle: {:?}", shard.stats());
    shard.drain_responses()
}

/// Read every key back through the shard.
fn snapshot(shard: &mut Shard) -> BTreeMap<String, Option<Vec<f32>>> {
    let base = 1_000_000;
    for i in 0..KEYS {
        shard
            .submit(Command::get(base + i as u64, key_name(i)))
            .unwrap();
    }
    let responses = settle(shard);
    (0..KEYS)
        .map(|i| {
            let token = CorrelationToken(base + i as u64);
            let response = responses
                .iter()
                .find(|r| r.correlation == token)
                .unwrap_or_else(|| panic!("no response for get {}", i));
            let value = match &response.payload {
                ResponsePayload::Value(v) => v.as_ref().map(|r| r.vector.clone()),
                other => panic!("unexpected payload {:?}", other),
            };
            (key_name(i), value)
        })
        .collect()
}

/// Apply `ops`, returning the expected final contents.
fn apply(shard: &mut Shard, ops: &[Op]) -> BTreeMap<String, Option<Vec<f32>>> {
    let mut model: BTreeMap<String, Option<Vec<f32>>> =
        (0..KEYS).map(|i| (key_name(i), None)).collect();
    for (n, op) in ops.iter().enumerate() {
        let id = n as u64 + 1;
        match op {
            Op::Upsert { key, seed } => {
                let v = vector(*seed);
                shard
                    .submit(Command::upsert(id, key_name(*key), VectorRecord::from_vector(v.clone())))
                    .unwrap();
                model.insert(key_name(*key), Some(v));
            }
            Op::Delete { key } => {
                shard.submit(Command::delete(id, key_name(*key))).unwrap();
                model.insert(key_name(*key), None);
            }
            Op::Flush => {
                settle(shard);
                shard.force_flush();
            }
        }
    }
    let responses = settle(shard);
    assert!(
        responses.iter().all(|r| r.status.is_ok()),
        "mutation failed: {:?}",
        responses.iter().find(|r| !r.status.is_ok())
    );
    model
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_dropped_shard_replays_to_same_state(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let dir = TempDir::new().unwrap();
        let expected = {
            let mut shard = open(dir.path());
            let expected = apply(&mut shard, &ops);
            prop_assert_eq!(&snapshot(&mut shard), &expected);
            expected
        };

        let mut shard = open(dir.path());
        prop_assert_eq!(&snapshot(&mut shard), &expected);
        let first = shard.recovery_report().clone();
        drop(shard);

        let mut shard = open(dir.path());
        prop_assert_eq!(&snapshot(&mut shard), &expected);
        prop_assert_eq!(shard.recovery_report().records_replayed, first.records_replayed);
        prop_assert_eq!(shard.recovery_report().checkpoint_lsn, first.checkpoint_lsn);
    }
}

#[test]
fn test_clean_shutdown_then_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let mut shard = open(dir.path());
        for id in 1..=30u64 {
            shard
                .submit(Command::upsert(
                    id,
                    format!("doc-{}", id),
                    VectorRecord::new(vector(id as u32), format!("meta-{}", id).into_bytes()),
                ))
                .unwrap();
        }
        settle(&mut shard);
        shard.shutdown(SETTLE).unwrap();
    }

    let mut shard = open(dir.path());
    assert_eq!(shard.recovery_report().records_replayed, 30);
    assert_eq!(shard.recovery_report().last_lsn, 30);
    shard.submit(Command::get(100, "doc-17")).unwrap();
    let responses = settle(&mut shard);
    match &responses[0].payload {
        ResponsePayload::Value(Some(record)) => {
            assert_eq!(record.vector, vector(17));
            assert_eq!(record.metadata, b"meta-17".to_vec());
        }
        other => panic!("unexpected payload {:?}", other),
    }

    // New mutations continue the LSN sequence
    shard
        .submit(Command::upsert(101, "doc-31", VectorRecord::from_vector(vector(31))))
        .unwrap();
    let responses = settle(&mut shard);
    assert_eq!(responses[0].payload, ResponsePayload::Committed { lsn: 31 });
}

#[test]
fn test_flushed_data_not_replayed() {
    let dir = TempDir::new().unwrap();
    {
        let mut shard = open(dir.path());
        for id in 1..=20u64 {
            shard
                .submit(Command::upsert(id, format!("a-{}", id), VectorRecord::from_vector(vector(id as u32))))
                .unwrap();
        }
        settle(&mut shard);
        assert!(shard.force_flush());
        settle(&mut shard);
        for id in 21..=25u64 {
            shard
                .submit(Command::upsert(id, format!("a-{}", id), VectorRecord::from_vector(vector(id as u32))))
                .unwrap();
        }
        settle(&mut shard);
    }

    let mut shard = open(dir.path());
    let report = shard.recovery_report().clone();
    assert_eq!(report.checkpoint_lsn, 20);
    assert_eq!(report.records_replayed, 5);
    assert_eq!(report.segments, 1);

    shard.submit(Command::get(100, "a-3")).unwrap();
    shard.submit(Command::get(101, "a-24")).unwrap();
    let responses = settle(&mut shard);
    assert!(responses
        .iter()
        .all(|r| matches!(r.payload, ResponsePayload::Value(Some(_)))));
    assert_eq!(shard.stats().segments, 1);
    assert!(shard.stats().index_nodes >= 20);
}
