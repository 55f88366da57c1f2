//! Property tests for the universal invariants named in spec §8
//! (1: put/delete/get, 3: compaction preserves semantics, 6: sort spill
//! correctness, 7: hash join correctness).

use std::collections::{BTreeMap, HashMap};

use proptest::prelude::*;
use serengeti_core::lsm_storage::{LsmStorageOptions, MiniLsm};
use serengeti_core::query::ast::{OrderByItem, SortDirection};
use serengeti_core::query::executor::Row;
use serengeti_core::spill::hash_join::PartitionedHashJoin;
use serengeti_core::spill::sort::ExternalSorter;
use serengeti_core::value::Value;
use uuid::Uuid;

fn small_options() -> LsmStorageOptions {
    LsmStorageOptions {
        block_size: 256,
        target_sst_size: 2048,
        max_memtable_limit: 2,
        compaction_options: serengeti_core::compact::CompactionOptions::NoCompaction,
        enable_wal: false,
        wal_sync_mode: serengeti_core::wal::SyncMode::Sync,
        cache: Default::default(),
    }
}

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u8),
    Delete(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
        any::<u8>().prop_map(Op::Delete),
    ]
}

proptest! {
    /// Invariant 1: `get(K)` always reflects the last put/delete on K,
    /// regardless of how many flushes happened along the way.
    #[test]
    fn invariant1_get_reflects_latest_write(ops in prop::collection::vec(op_strategy(), 0..200), flush_every in 1usize..40) {
        let dir = tempfile::tempdir().unwrap();
        let lsm = MiniLsm::open(dir.path(), small_options()).unwrap();
        let mut model: HashMap<u8, Option<u8>> = HashMap::new();

        for (i, op) in ops.iter().enumerate() {
            match op {
                Op::Put(k, v) => {
                    lsm.put(&[*k], &[*v]).unwrap();
                    model.insert(*k, Some(*v));
                }
                Op::Delete(k) => {
                    lsm.delete(&[*k]).unwrap();
                    model.insert(*k, None);
                }
            }
            if i % flush_every == 0 {
                lsm.force_flush().unwrap();
            }
        }

        for (k, expected) in &model {
            let got = lsm.get(&[*k]).unwrap();
            prop_assert_eq!(got.as_deref(), expected.as_ref().map(|v| std::slice::from_ref(v)));
        }
    }

    /// Invariant 3: compaction never changes what `get` returns.
    #[test]
    fn invariant3_compaction_preserves_semantics(ops in prop::collection::vec(op_strategy(), 0..150)) {
        let dir = tempfile::tempdir().unwrap();
        let lsm = MiniLsm::open(dir.path(), small_options()).unwrap();
        let mut keys: std::collections::BTreeSet<u8> = std::collections::BTreeSet::new();

        for op in &ops {
            match op {
                Op::Put(k, v) => {
                    lsm.put(&[*k], &[*v]).unwrap();
                    keys.insert(*k);
                }
                Op::Delete(k) => {
                    lsm.delete(&[*k]).unwrap();
                    keys.insert(*k);
                }
            }
        }
        lsm.force_flush().unwrap();

        let before: Vec<_> = keys.iter().map(|k| lsm.get(&[*k]).unwrap()).collect();
        lsm.force_compact().unwrap();
        let after: Vec<_> = keys.iter().map(|k| lsm.get(&[*k]).unwrap()).collect();
        prop_assert_eq!(before, after);
    }
}

fn row_with(n: i64) -> Row {
    let mut columns = BTreeMap::new();
    columns.insert("n".to_string(), Value::Int(n));
    Row { id: Uuid::new_v4(), columns }
}

proptest! {
    /// Invariant 6: the external sorter's output is a permutation of its
    /// input and is non-decreasing under the comparator.
    #[test]
    fn invariant6_sort_is_permutation_and_ordered(values in prop::collection::vec(any::<i32>(), 0..300)) {
        let dir = tempfile::tempdir().unwrap();
        let keys = vec![OrderByItem { column: "n".to_string(), direction: SortDirection::Asc }];
        let mut sorter = ExternalSorter::new(dir.path().to_path_buf(), Uuid::new_v4(), 1, keys, 16);
        for v in &values {
            sorter.push(row_with(*v as i64)).unwrap();
        }
        let sorted = sorter.finish().unwrap();

        let mut expected: Vec<i64> = values.iter().map(|v| *v as i64).collect();
        expected.sort();
        let actual: Vec<i64> = sorted.iter().map(|r| r.columns["n"].as_int().unwrap()).collect();
        prop_assert_eq!(actual.clone(), expected);
        prop_assert!(actual.windows(2).all(|w| w[0] <= w[1]));
    }
}

proptest! {
    /// Invariant 7: the join output is exactly the multiset of pairs
    /// whose join-column values are equal.
    #[test]
    fn invariant7_hash_join_matches_expected_multiset(
        build_keys in prop::collection::vec(0i64..8, 0..60),
        probe_keys in prop::collection::vec(0i64..8, 0..60),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut join = PartitionedHashJoin::new(dir.path().to_path_buf(), Uuid::new_v4(), 1, "n".to_string(), 4);
        for k in &build_keys {
            join.build(row_with(*k));
        }
        let probe_rows: Vec<Row> = probe_keys.iter().map(|k| row_with(*k)).collect();
        let matched = join.probe(probe_rows).unwrap();

        let mut expected_counts: HashMap<i64, usize> = HashMap::new();
        for b in &build_keys {
            for p in &probe_keys {
                if b == p {
                    *expected_counts.entry(*b).or_insert(0) += 1;
                }
            }
        }
        let mut actual_counts: HashMap<i64, usize> = HashMap::new();
        for (build_row, probe_row) in &matched {
            let bk = build_row.columns["n"].as_int().unwrap();
            let pk = probe_row.columns["n"].as_int().unwrap();
            prop_assert_eq!(bk, pk);
            *actual_counts.entry(bk).or_insert(0) += 1;
        }
        prop_assert_eq!(actual_counts, expected_counts);
    }
}
