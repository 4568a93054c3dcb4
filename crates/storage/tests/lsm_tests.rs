//! LSM store tests
//!
//! Flush, compaction and reopen through `LsmStore`, checked against a
//! simple in-memory model.

use proptest::prelude::*;
use quiver_core::config::{CompactionSettings, ShardConfig};
use quiver_core::{Key, Lsn, Value, VectorRecord};
use quiver_storage::{
    compact, CompactionPicker, CompactionReason, CompactionThrottle, LsmStore, MemTable,
    StorageError,
};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::tempdir;

fn settings() -> CompactionSettings {
    ShardConfig::for_testing().compaction
}

fn open(dir: &Path) -> LsmStore {
    LsmStore::open(dir, settings(), 512).unwrap()
}

fn record(x: f32) -> Value {
    Value::Record(VectorRecord::from_vector(vec![x, x + 1.0, x + 2.0]))
}

/// Write `ops` to a fresh MemTable and install it as a level 0 segment.
fn flush(store: &LsmStore, ops: &[(&str, Value, Lsn)]) {
    let memtable = MemTable::new();
    for (key, value, lsn) in ops {
        memtable.insert(Key::from(*key), value.clone(), *lsn).unwrap();
    }
    memtable.freeze();
    let info = store.flush_memtable(&memtable).unwrap();
    let checkpoint = memtable.max_lsn().unwrap_or_else(|| store.checkpoint_lsn());
    store.install_flush(info.as_ref(), checkpoint).unwrap();
}

/// Run compactions until the picker finds nothing to do.
fn compact_all(store: &LsmStore) -> usize {
    let picker = CompactionPicker::new(store.settings().clone());
    let mut throttle = CompactionThrottle::unlimited();
    let mut jobs = 0;
    while let Some(job) = picker.pick(&store.version()) {
        let output = compact(store, &job, &mut throttle).unwrap();
        store.install_compaction(&output).unwrap();
        jobs += 1;
        assert!(jobs < 100, "compaction did not converge");
    }
    jobs
}

fn live(store: &LsmStore, key: &str) -> Option<Value> {
    store
        .get(&Key::from(key))
        .unwrap()
        .map(|v| v.value)
        .filter(|v| !v.is_tombstone())
}

#[test]
fn test_delete_then_flush_reads_not_found() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    flush(&store, &[("a", record(1.0), 5)]);
    flush(&store, &[("a", Value::Tombstone, 9)]);

    let newest = store.get(&Key::from("a")).unwrap().unwrap();
    assert_eq!(newest.lsn, 9);
    assert!(newest.value.is_tombstone());
    assert_eq!(live(&store, "a"), None);
    assert_eq!(store.checkpoint_lsn(), 9);
}

#[test]
fn test_level0_compaction_drops_shadowed_versions_and_tombstones() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    flush(&store, &[("a", record(1.0), 1), ("b", record(2.0), 2)]);
    flush(&store, &[("a", record(10.0), 3), ("c", record(3.0), 4)]);
    flush(&store, &[("b", Value::Tombstone, 5)]);
    assert_eq!(store.version().level(0).len(), 3);

    let picker = CompactionPicker::new(settings());
    let job = picker.pick(&store.version()).unwrap();
    assert_eq!(job.reason, CompactionReason::Level0);
    let output = compact(&store, &job, &mut CompactionThrottle::unlimited()).unwrap();
    assert_eq!(output.info.entries_in, 5);
    assert_eq!(output.info.versions_dropped, 2);
    assert_eq!(output.info.tombstones_dropped, 1);
    assert_eq!(output.info.entries_out, 2);
    store.install_compaction(&output).unwrap();

    let version = store.version();
    assert!(version.level(0).is_empty());
    assert_eq!(version.level(1).len(), 1);
    assert_eq!(live(&store, "a"), Some(record(10.0)));
    assert_eq!(store.get(&Key::from("b")).unwrap(), None);
    assert_eq!(live(&store, "c"), Some(record(3.0)));

    // Input files are gone once the compaction is installed
    for id in job.input_ids() {
        assert!(!store
            .segment_dir()
            .join(format!("seg-{:08}.qseg", id))
            .exists());
    }
}

#[test]
fn test_tombstone_kept_while_deeper_level_holds_older_version() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    // Push "k" down to level 1
    flush(&store, &[("k", record(1.0), 1)]);
    flush(&store, &[("x", record(1.0), 2)]);
    flush(&store, &[("y", record(1.0), 3)]);
    compact_all(&store);
    assert_eq!(store.version().level(1).len(), 1);

    // Delete "k" and compact level 0 into level 1 again: level 1 is the
    // target and nothing deeper holds "k", so the tombstone can go.
    flush(&store, &[("k", Value::Tombstone, 4)]);
    flush(&store, &[("m", record(2.0), 5)]);
    flush(&store, &[("n", record(3.0), 6)]);
    compact_all(&store);
    assert_eq!(store.get(&Key::from("k")).unwrap(), None);
    assert_eq!(live(&store, "m"), Some(record(2.0)));
}

#[test]
fn test_compaction_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path());
        for round in 0..6u64 {
            let key = format!("key-{}", round % 3);
            flush(&store, &[(key.as_str(), record(round as f32), round + 1)]);
        }
        compact_all(&store);
    }

    let store = open(dir.path());
    assert_eq!(store.checkpoint_lsn(), 6);
    assert_eq!(live(&store, "key-0"), Some(record(3.0)));
    assert_eq!(live(&store, "key-1"), Some(record(4.0)));
    assert_eq!(live(&store, "key-2"), Some(record(5.0)));
    assert!(store.take_repair_requests().is_empty());
}

#[test]
fn test_stale_compaction_is_rejected_and_cleaned_up() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    flush(&store, &[("a", record(1.0), 1)]);
    flush(&store, &[("b", record(2.0), 2)]);
    flush(&store, &[("c", record(3.0), 3)]);

    let job = CompactionPicker::new(settings())
        .pick(&store.version())
        .unwrap();
    let output = compact(&store, &job, &mut CompactionThrottle::unlimited()).unwrap();

    // An input disappears while the merge result waits to be installed
    let victim = job.input_ids()[0];
    assert!(store.quarantine(victim, "test").unwrap());

    match store.install_compaction(&output) {
        Err(StorageError::StaleJob(id)) => assert_eq!(id, victim),
        other => panic!("expected stale job, got {:?}", other.map(|_| ())),
    }
    for out in &output.outputs {
        assert!(!out.path.exists());
    }
    // The surviving inputs are still live and readable
    assert_eq!(store.version().level(0).len(), 2);
    assert_eq!(store.take_repair_requests().len(), 1);
}

#[test]
fn test_range_hides_nothing_and_orders_keys() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    flush(&store, &[("b", record(1.0), 1), ("d", record(1.0), 2)]);
    flush(&store, &[("a", record(2.0), 3), ("c", Value::Tombstone, 4)]);

    let start = Key::from("b");
    let end = Key::from("d");
    let keys: Vec<String> = store
        .range(Some(&start), Some(&end))
        .unwrap()
        .into_iter()
        .map(|(k, _)| k.to_string())
        .collect();
    assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
}

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u8),
    Delete(u8),
    Flush,
    Compact,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..24, any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
        2 => (0u8..24).prop_map(Op::Delete),
        1 => Just(Op::Flush),
        1 => Just(Op::Compact),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_store_matches_model(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let mut model: BTreeMap<String, Option<Value>> = BTreeMap::new();
        let mut pending: Vec<(String, Value, Lsn)> = Vec::new();
        let mut lsn: Lsn = 0;

        for op in ops {
            match op {
                Op::Put(k, v) => {
                    lsn += 1;
                    let key = format!("k{:02}", k);
                    model.insert(key.clone(), Some(record(v as f32)));
                    pending.push((key, record(v as f32), lsn));
                }
                Op::Delete(k) => {
                    lsn += 1;
                    let key = format!("k{:02}", k);
                    model.insert(key.clone(), None);
                    pending.push((key, Value::Tombstone, lsn));
                }
                Op::Flush => {
                    let batch: Vec<(&str, Value, Lsn)> = pending
                        .iter()
                        .map(|(k, v, l)| (k.as_str(), v.clone(), *l))
                        .collect();
                    flush(&store, &batch);
                    pending.clear();
                }
                Op::Compact => {
                    compact_all(&store);
                }
            }
        }
        let batch: Vec<(&str, Value, Lsn)> = pending
            .iter()
            .map(|(k, v, l)| (k.as_str(), v.clone(), *l))
            .collect();
        flush(&store, &batch);
        compact_all(&store);

        for (key, expected) in &model {
            prop_assert_eq!(&live(&store, key), expected);
        }
        drop(store);

        let reopened = open(dir.path());
        for (key, expected) in &model {
            prop_assert_eq!(&live(&reopened, key), expected);
        }
    }
}
