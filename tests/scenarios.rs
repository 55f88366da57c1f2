//! End-to-end acceptance scenarios (spec §8, S1-S6).

use std::collections::BTreeMap;

use serengeti_core::compact::{CompactionOptions, LeveledCompactionOptions};
use serengeti_core::config::EngineConfig;
use serengeti_core::db::Database;
use serengeti_core::lsm_storage::{LsmStorageOptions, MiniLsm};
use serengeti_core::memory::MemoryManager;
use serengeti_core::query::ast::{OrderByItem, SortDirection};
use serengeti_core::query::executor::{execute, Row};
use serengeti_core::spill::sort::ExternalSorter;
use serengeti_core::wal::SyncMode;
use uuid::Uuid;

fn leveled_options() -> LsmStorageOptions {
    LsmStorageOptions {
        block_size: 4096,
        target_sst_size: 4096,
        max_memtable_limit: 2,
        compaction_options: CompactionOptions::Leveled(LeveledCompactionOptions {
            level_size_multiplier: 4,
            level0_files_num_compaction_threshold: 2,
            max_levels: 4,
            base_level_size_mb: 1,
        }),
        enable_wal: true,
        wal_sync_mode: SyncMode::Sync,
        cache: Default::default(),
    }
}

fn dir_bytes(dir: &std::path::Path) -> u64 {
    let mut total = 0;
    for entry in std::fs::read_dir(dir).unwrap().flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "sst").unwrap_or(false) {
            total += entry.metadata().unwrap().len();
        }
    }
    total
}

#[test]
fn s1_durability_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let lsm = MiniLsm::open(dir.path(), leveled_options()).unwrap();
        lsm.put(b"k1", b"v1").unwrap();
        lsm.put(b"k2", b"v2").unwrap();
        lsm.delete(b"k1").unwrap();
        lsm.close().unwrap();
    }
    let lsm = MiniLsm::open(dir.path(), leveled_options()).unwrap();
    assert_eq!(lsm.get(b"k1").unwrap(), None);
    assert_eq!(lsm.get(b"k2").unwrap().as_deref(), Some(&b"v2"[..]));
}

#[test]
fn s2_compaction_merges_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let lsm = MiniLsm::open(dir.path(), leveled_options()).unwrap();
    for i in 0..1000u32 {
        let key = format!("k{i:04}");
        let value = format!("v{i}");
        lsm.put(key.as_bytes(), value.as_bytes()).unwrap();
    }
    for i in (0..1000u32).step_by(2) {
        lsm.delete(format!("k{i:04}").as_bytes()).unwrap();
    }
    lsm.force_flush().unwrap();
    let before = dir_bytes(dir.path());
    lsm.force_compact().unwrap();
    let after = dir_bytes(dir.path());

    for i in 0..1000u32 {
        let key = format!("k{i:04}");
        let got = lsm.get(key.as_bytes()).unwrap();
        if i % 2 == 0 {
            assert_eq!(got, None, "even key {key} should be gone");
        } else {
            assert_eq!(got.as_deref(), Some(format!("v{i}").as_bytes()));
        }
    }
    assert!(after <= before, "compaction should not grow total SSTable bytes");
}

#[test]
fn s3_range_query_with_index() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path(), "db", &EngineConfig::default()).unwrap();
    db.create_table("users").unwrap();
    for age in 10..100 {
        let resp = execute(&format!("INSERT INTO db.users (age) VALUES ({age})"), &db);
        assert!(resp.executed, "{:?}", resp.error);
    }
    let resp = execute("CREATE INDEX ON db.users(age)", &db);
    assert!(resp.executed, "{:?}", resp.error);

    let explained = serengeti_core::query::executor::explain(
        "SELECT * FROM db.users WHERE age>=50 AND age<60",
        &db,
    );
    assert!(explained.explain.unwrap().contains("RangeScan"));

    let resp = execute("SELECT * FROM db.users WHERE age>=50 AND age<60", &db);
    assert!(resp.executed, "{:?}", resp.error);
    let mut ages: Vec<i64> = resp
        .list
        .unwrap()
        .iter()
        .map(|v| v.as_object().unwrap()["age"].as_int().unwrap())
        .collect();
    ages.sort();
    assert_eq!(ages, (50..60).collect::<Vec<_>>());
}

#[test]
fn s4_fulltext_search_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path(), "db", &EngineConfig::default()).unwrap();
    db.create_table("docs").unwrap();
    execute("INSERT INTO db.docs (content) VALUES ('database storage engine')", &db);
    execute("INSERT INTO db.docs (content) VALUES ('storage only')", &db);
    execute("INSERT INTO db.docs (content) VALUES ('engine tuning')", &db);
    let resp = execute("CREATE FULLTEXT INDEX ON db.docs(content)", &db);
    assert!(resp.executed, "{:?}", resp.error);

    let resp = execute("SELECT * FROM db.docs WHERE content CONTAINS 'storage engine'", &db);
    assert!(resp.executed, "{:?}", resp.error);
    let list = resp.list.unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list[0].as_object().unwrap()["content"].as_str(), Some("database storage engine"));
    for row in &list {
        let relevance = row.as_object().unwrap()["__relevance"].as_float().unwrap();
        assert!(relevance > 0.0);
    }
}

fn row_of(n: i64, payload: &str) -> Row {
    let mut columns = BTreeMap::new();
    columns.insert("col".to_string(), serengeti_core::value::Value::Int(n));
    columns.insert("payload".to_string(), serengeti_core::value::Value::Str(payload.to_string()));
    Row { id: Uuid::new_v4(), columns }
}

#[test]
fn s5_external_sort_spills_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let budget = MemoryManager::new(1 << 20);
    let query = Uuid::new_v4();
    budget.begin_query(query);

    let keys = vec![OrderByItem { column: "col".to_string(), direction: SortDirection::Asc }];
    let padding = "x".repeat(64);
    let mut sorter = ExternalSorter::new(dir.path().to_path_buf(), query, 1, keys, 2_000);
    for n in (0..100_000i64).rev() {
        sorter.push(row_of(n, &padding)).unwrap();
    }
    let before_finish_entries = std::fs::read_dir(dir.path()).unwrap().count();
    assert!(before_finish_entries > 0, "at least one spill chunk should exist mid-sort");

    let sorted = sorter.finish().unwrap();
    assert_eq!(sorted.len(), 100_000);
    let values: Vec<i64> = sorted.iter().map(|r| r.columns["col"].as_int().unwrap()).collect();
    assert!(values.windows(2).all(|w| w[0] <= w[1]));

    let remaining_spill_files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(remaining_spill_files, 0, "no spill files should remain after finish()");
    budget.release_query(query);
}

#[test]
fn s6_cache_resists_scan_pollution() {
    use serengeti_core::block::builder::BlockBuilder;
    use serengeti_core::cache::{BlockCache, CacheConfig};
    use serengeti_core::key::KeySlice;
    use std::sync::Arc;

    // Small L1 so a one-pass scan over many blocks evicts itself before
    // the hot set is revisited.
    let cache = BlockCache::new(CacheConfig { l1_bytes: 4096 * 20, l2_bytes: 4096 * 20, ..CacheConfig::default() });
    let mut builder = BlockBuilder::new(4096);
    builder.add(KeySlice::from_slice(b"k"), b"v", false, 0);
    let block = Arc::new(builder.build());

    for sst_id in 0..10_000usize {
        cache.insert(sst_id, 0, block.clone());
        cache.get(sst_id, 0);
    }

    for _ in 0..20 {
        for hot in 0..100usize {
            cache.insert(hot, 1, block.clone());
        }
    }
    let mut hot_hits = 0u64;
    let mut hot_total = 0u64;
    for _ in 0..20 {
        for hot in 0..100usize {
            hot_total += 1;
            if cache.get(hot, 1).is_some() {
                hot_hits += 1;
            }
        }
    }
    let hot_ratio = hot_hits as f64 / hot_total as f64;
    assert!(hot_ratio > 0.95, "hot-key hit ratio was {hot_ratio}");

    let mut cold_hits = 0;
    for sst_id in 0..1000usize {
        if cache.get(sst_id, 0).is_some() {
            cold_hits += 1;
        }
    }
    assert!(cold_hits < 500, "cold scan keys should be largely evicted, got {cold_hits}/1000");
}

