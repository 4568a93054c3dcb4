//! Recovery invariants
//!
//! - Every record reported durable before a crash is replayed
//! - Replay never yields a record that was not appended, and keeps LSN order
//! - Replay above a checkpoint yields exactly the suffix, across rotated files

use proptest::prelude::*;
use quiver_core::{Key, Lsn, Value, VectorRecord};
use quiver_durability::{ManualDriver, RecoveryManager, ThreadedDriver, Wal, WalConfig, WalLayout};
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Put(u8, Vec<f32>),
    Delete(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..8, prop::collection::vec(-10.0f32..10.0, 1..6)).prop_map(|(k, v)| Op::Put(k, v)),
        1 => (0u8..8).prop_map(Op::Delete),
    ]
}

fn op_key(op: &Op) -> Key {
    let k = match op {
        Op::Put(k, _) | Op::Delete(k) => *k,
    };
    Key::from(format!("k{}", k).as_str())
}

fn op_value(op: &Op) -> Value {
    match op {
        Op::Put(_, v) => Value::Record(VectorRecord::from_vector(v.clone())),
        Op::Delete(_) => Value::Tombstone,
    }
}

fn apply(state: &mut BTreeMap<Key, Value>, key: Key, value: Value) {
    match value {
        Value::Tombstone => {
            state.remove(&key);
        }
        v => {
            state.insert(key, v);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_crash_replay_yields_prefix_covering_durable(
        ops in prop::collection::vec(op_strategy(), 1..40),
        durable_fraction in 0.0f64..1.0,
        keep in 0usize..600,
    ) {
        let dir = TempDir::new().unwrap();
        let driver = ManualDriver::new();
        let mut wal = Wal::open(
            dir.path(),
            WalConfig::for_testing(),
            Box::new(driver.clone()),
            &WalLayout::default(),
        ).unwrap();

        let durable_count = ((ops.len() as f64) * durable_fraction) as usize;
        for (i, op) in ops.iter().enumerate() {
            wal.append(&op_key(op), &op_value(op)).unwrap();
            if i + 1 <= durable_count {
                wal.submit().unwrap();
                driver.complete_all();
                wal.poll_completions();
            }
        }
        prop_assert_eq!(wal.durable_lsn(), durable_count as Lsn);

        // Everything after the durable prefix goes out as one batch that tears
        wal.submit().unwrap();
        driver.tear_next(keep).unwrap();
        drop(wal);

        let mut replayed = Vec::new();
        RecoveryManager::new(dir.path()).recover(0, |r, v| {
            replayed.push((r.lsn, r.key.clone(), v));
            Ok(())
        }).unwrap();

        prop_assert!(replayed.len() >= durable_count);
        prop_assert!(replayed.len() <= ops.len());
        for (i, (lsn, key, value)) in replayed.iter().enumerate() {
            prop_assert_eq!(*lsn, i as Lsn + 1);
            prop_assert_eq!(key, &op_key(&ops[i]));
            prop_assert_eq!(value, &op_value(&ops[i]));
        }

        // Replayed state equals the model over the same prefix
        let mut expected = BTreeMap::new();
        for op in &ops[..replayed.len()] {
            apply(&mut expected, op_key(op), op_value(op));
        }
        let mut actual = BTreeMap::new();
        for (_, key, value) in replayed {
            apply(&mut actual, key, value);
        }
        prop_assert_eq!(actual, expected);
    }
}

#[test]
fn test_replay_above_checkpoint_across_rotated_files() {
    let dir = TempDir::new().unwrap();
    let config = WalConfig::for_testing().with_segment_size(2048);
    let driver = ThreadedDriver::spawn("wal-test").unwrap();
    let mut wal = Wal::open(dir.path(), config, Box::new(driver), &WalLayout::default()).unwrap();
    for i in 1..=40u64 {
        let value = Value::Record(VectorRecord::from_vector(vec![i as f32]));
        wal.append(&Key::from(format!("k{}", i).as_str()), &value).unwrap();
        wal.rotate_if_needed().unwrap();
        wal.sync_all(Duration::from_secs(5)).unwrap();
    }
    assert!(wal.file_count() > 2);
    let removed = wal.remove_segments_through(20).unwrap();
    assert!(removed > 0);
    drop(wal);

    let mut lsns = Vec::new();
    let result = RecoveryManager::new(dir.path())
        .recover(20, |r, _| {
            lsns.push(r.lsn);
            Ok(())
        })
        .unwrap();
    assert_eq!(lsns, (21..=40).collect::<Vec<_>>());
    assert_eq!(result.last_lsn, 40);
}
