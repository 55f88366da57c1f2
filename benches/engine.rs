//! Hot-path benches (SPEC_FULL §10/A5): point get/put, compaction, the
//! external sort, and the partitioned hash join.

use std::collections::BTreeMap;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serengeti_core::compact::{CompactionOptions, LeveledCompactionOptions};
use serengeti_core::lsm_storage::{LsmStorageOptions, MiniLsm};
use serengeti_core::memory::OperatorId;
use serengeti_core::query::ast::{OrderByItem, SortDirection};
use serengeti_core::query::executor::Row;
use serengeti_core::spill::hash_join::PartitionedHashJoin;
use serengeti_core::spill::sort::ExternalSorter;
use serengeti_core::value::Value;
use uuid::Uuid;

fn leveled_options() -> LsmStorageOptions {
    LsmStorageOptions {
        block_size: 4096,
        target_sst_size: 256 << 10,
        max_memtable_limit: 2,
        compaction_options: CompactionOptions::Leveled(LeveledCompactionOptions {
            level_size_multiplier: 4,
            level0_files_num_compaction_threshold: 2,
            max_levels: 3,
            base_level_size_mb: 1,
        }),
        enable_wal: false,
        wal_sync_mode: serengeti_core::wal::SyncMode::Sync,
        cache: Default::default(),
    }
}

fn bench_point_ops(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let lsm = MiniLsm::open(dir.path(), leveled_options()).unwrap();
    for i in 0..10_000u64 {
        lsm.put(format!("key{i:08}").as_bytes(), format!("value{i}").as_bytes()).unwrap();
    }

    c.bench_function("engine_put", |b| {
        let mut i = 10_000u64;
        b.iter(|| {
            lsm.put(format!("key{i:08}").as_bytes(), format!("value{i}").as_bytes()).unwrap();
            i += 1;
        })
    });

    c.bench_function("engine_get_hit", |b| {
        b.iter(|| lsm.get(b"key00005000").unwrap());
    });

    c.bench_function("engine_get_miss", |b| {
        b.iter(|| lsm.get(b"key99999999").unwrap());
    });
}

fn bench_compaction(c: &mut Criterion) {
    c.bench_function("engine_force_compact", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let lsm = MiniLsm::open(dir.path(), leveled_options()).unwrap();
                for i in 0..5_000u64 {
                    lsm.put(format!("key{i:08}").as_bytes(), format!("value{i}").as_bytes()).unwrap();
                }
                lsm.force_flush().unwrap();
                (dir, lsm)
            },
            |(_dir, lsm)| lsm.force_compact().unwrap(),
            BatchSize::LargeInput,
        )
    });
}

fn row(n: i64) -> Row {
    let mut columns = BTreeMap::new();
    columns.insert("n".to_string(), Value::Int(n));
    Row { id: Uuid::new_v4(), columns }
}

fn bench_external_sort(c: &mut Criterion) {
    c.bench_function("spill_external_sort_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let rows: Vec<Row> = (0..10_000).rev().map(row).collect();
                (dir, rows)
            },
            |(dir, rows)| {
                let keys = vec![OrderByItem { column: "n".to_string(), direction: SortDirection::Asc }];
                let mut sorter =
                    ExternalSorter::new(dir.path().to_path_buf(), Uuid::new_v4(), 1 as OperatorId, keys, 1_000);
                for r in rows {
                    sorter.push(r).unwrap();
                }
                sorter.finish().unwrap()
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_hash_join(c: &mut Criterion) {
    c.bench_function("spill_hash_join_probe_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let mut join =
                    PartitionedHashJoin::new(dir.path().to_path_buf(), Uuid::new_v4(), 1, "n".to_string(), 16);
                for i in 0..10_000 {
                    join.build(row(i));
                }
                let probe: Vec<Row> = (0..10_000).map(row).collect();
                (dir, join, probe)
            },
            |(_dir, join, probe)| join.probe(probe).unwrap(),
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_point_ops, bench_compaction, bench_external_sort, bench_hash_join);
criterion_main!(benches);
