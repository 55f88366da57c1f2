//! The LSM engine (C4): ties the WAL, memtables and SSTables together
//! behind a single `get`/`put`/`delete`/`scan` surface, plus the
//! flush and compaction pipelines and snapshot/release for consistent
//! reads (spec §3 "Ownership", §4.4).

use bytes::Bytes;
use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::{
    cache::{BlockCache, CacheConfig},
    compact::{CompactionController, CompactionOptions},
    error::{Result, SerengetiError},
    iterators::concat_iterator::SstConcatIterator,
    iterators::merge_iterator::MergeIterator,
    iterators::two_merge_iterator::TwoMergeIterator,
    iterators::StorageIterator,
    key::KeySlice,
    lsm_iterator::{LsmIterator, LsmIteratorInner},
    manifest::{Manifest, ManifestRecord},
    mem_table::MemTable,
    table::iterator::SsTableIterator,
    table::SsTable,
    wal::SyncMode,
};
use std::{
    collections::HashMap,
    ops::Bound,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

/// Process-wide write sequence counter (spec §3: "strictly increasing,
/// process-wide, starting at 1").
pub(crate) static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone)]
pub struct LsmStroageState {
    pub memtable: Arc<MemTable>,
    pub imm_memtables: Vec<Arc<MemTable>>,
    pub l0_sstables: Vec<usize>,
    pub levels: Vec<(usize, Vec<usize>)>,
    pub sstables: HashMap<usize, Arc<SsTable>>,
}

pub type LsmStorageState = LsmStroageState;

impl LsmStroageState {
    fn create(options: &LsmStorageOptions) -> Self {
        let mut levels = Vec::new();
        if let CompactionOptions::Leveled(opts) = &options.compaction_options {
            for i in 1..=opts.max_levels {
                levels.push((i, Vec::new()));
            }
        } else {
            levels.push((1, Vec::new()));
        }
        Self {
            memtable: Arc::new(MemTable::create(0)),
            imm_memtables: Vec::new(),
            l0_sstables: Vec::new(),
            levels,
            sstables: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LsmStorageOptions {
    pub block_size: usize,
    pub target_sst_size: usize,
    pub max_memtable_limit: usize,
    pub compaction_options: CompactionOptions,
    pub enable_wal: bool,
    pub wal_sync_mode: SyncMode,
    pub cache: CacheConfig,
}

impl Default for LsmStorageOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            target_sst_size: 2 << 20,
            max_memtable_limit: 2,
            compaction_options: CompactionOptions::NoCompaction,
            enable_wal: true,
            wal_sync_mode: SyncMode::Sync,
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum CompactionFilter {
    Prefix(Bytes),
}

fn key_within(user_key: &[u8], table_begin: KeySlice, table_end: KeySlice) -> bool {
    table_begin.raw_ref() <= user_key && user_key <= table_end.raw_ref()
}

/// A consistent read view: the memtable chain plus SSTable handle list
/// at the moment of acquisition. Holding one keeps its SSTables' `Arc`s
/// alive; the files themselves may still be unlinked by compaction, but
/// the already-open file handle keeps serving reads (standard Unix
/// unlink-while-open semantics), so correctness does not depend on
/// waiting out the refcount.
pub struct Snapshot {
    state: Arc<LsmStroageState>,
}

pub(crate) struct LsmStorageInner {
    pub(crate) state: Arc<RwLock<Arc<LsmStroageState>>>,
    pub(crate) state_lock: Mutex<()>,
    path: PathBuf,
    pub(crate) block_cache: Arc<BlockCache>,
    next_sst_id: AtomicUsize,
    pub(crate) options: Arc<LsmStorageOptions>,
    pub(crate) compaction_controller: CompactionController,
    pub(crate) manifest: Option<Manifest>,
    pub(crate) compaction_filters: Arc<Mutex<Vec<CompactionFilter>>>,
    read_only: AtomicBool,
}

pub enum WriteBatchRecord<T: AsRef<[u8]>> {
    Put(T, T),
    Del(T),
}

impl LsmStorageInner {
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let snapshot = {
            let guard = self.state.read();
            Arc::clone(&guard)
        };
        self.get_from_state(&snapshot, key)
    }

    fn get_from_state(&self, snapshot: &Arc<LsmStroageState>, key: &[u8]) -> Result<Option<Bytes>> {
        if let Some(entry) = snapshot.memtable.get(KeySlice::from_slice(key)) {
            return Ok(entry.value.as_bytes().cloned());
        }
        for memtable in snapshot.imm_memtables.iter() {
            if let Some(entry) = memtable.get(KeySlice::from_slice(key)) {
                return Ok(entry.value.as_bytes().cloned());
            }
        }

        let keep_table = |key: &[u8], table: &SsTable| {
            key_within(key, table.first_key().as_key_slice(), table.last_key().as_key_slice())
                && table.may_contain(key)
        };

        let mut l0_iters = Vec::with_capacity(snapshot.l0_sstables.len());
        for id in &snapshot.l0_sstables {
            let table = snapshot.sstables[id].clone();
            if keep_table(key, &table) {
                l0_iters.push(Box::new(SsTableIterator::create_and_seek_to_key(
                    table,
                    KeySlice::from_slice(key),
                )?));
            }
        }
        let l0_iter = MergeIterator::create(l0_iters);

        let mut level_iters = Vec::with_capacity(snapshot.levels.len());
        for (_, level_sst_ids) in &snapshot.levels {
            let mut level_ssts = Vec::with_capacity(level_sst_ids.len());
            for id in level_sst_ids {
                let table = snapshot.sstables[id].clone();
                if keep_table(key, &table) {
                    level_ssts.push(table);
                }
            }
            level_iters.push(Box::new(SstConcatIterator::create_and_seek_to_key(
                level_ssts,
                KeySlice::from_slice(key),
            )?));
        }
        let iter = TwoMergeIterator::create(l0_iter, MergeIterator::create(level_iters))?;
        if iter.is_valid() && iter.key().raw_ref() == key {
            if iter.is_tombstone() {
                return Ok(None);
            }
            return Ok(Some(Bytes::copy_from_slice(iter.value())));
        }
        Ok(None)
    }

    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<LsmIterator> {
        let snapshot = {
            let guard = self.state.read();
            Arc::clone(&guard)
        };
        self.scan_snapshot(&snapshot, lower, upper)
    }

    fn scan_snapshot(
        &self,
        snapshot: &Arc<LsmStroageState>,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<LsmIterator> {
        let mem_lower = lower.map(KeySlice::from_slice);
        let mem_upper = upper.map(KeySlice::from_slice);
        let mut memtable_iters = Vec::with_capacity(snapshot.imm_memtables.len() + 1);
        memtable_iters.push(Box::new(snapshot.memtable.scan(mem_lower, mem_upper)));
        for memtable in snapshot.imm_memtables.iter() {
            memtable_iters.push(Box::new(memtable.scan(mem_lower, mem_upper)));
        }
        let memtable_iter = MergeIterator::create(memtable_iters);

        let mut l0_iters = Vec::with_capacity(snapshot.l0_sstables.len());
        for id in &snapshot.l0_sstables {
            let table = snapshot.sstables[id].clone();
            if range_overlap(lower, upper, table.first_key().as_key_slice(), table.last_key().as_key_slice()) {
                let iter = match lower {
                    Bound::Included(key) => {
                        SsTableIterator::create_and_seek_to_key(table, KeySlice::from_slice(key))?
                    }
                    Bound::Excluded(key) => {
                        let mut iter = SsTableIterator::create_and_seek_to_key(
                            table,
                            KeySlice::from_slice(key),
                        )?;
                        if iter.is_valid() && iter.key().raw_ref() == key {
                            iter.next()?;
                        }
                        iter
                    }
                    Bound::Unbounded => SsTableIterator::create_and_seek_to_first(table)?,
                };
                l0_iters.push(Box::new(iter));
            }
        }
        let l0_iter = MergeIterator::create(l0_iters);

        let mut level_iters = Vec::with_capacity(snapshot.levels.len());
        for (_, level_sst_ids) in &snapshot.levels {
            let mut level_ssts = Vec::with_capacity(level_sst_ids.len());
            for id in level_sst_ids {
                let table = snapshot.sstables[id].clone();
                if range_overlap(lower, upper, table.first_key().as_key_slice(), table.last_key().as_key_slice()) {
                    level_ssts.push(table);
                }
            }
            let iter = match lower {
                Bound::Included(key) | Bound::Excluded(key) => {
                    SstConcatIterator::create_and_seek_to_key(level_ssts, KeySlice::from_slice(key))?
                }
                Bound::Unbounded => SstConcatIterator::create_and_seek_to_first(level_ssts)?,
            };
            level_iters.push(Box::new(iter));
        }
        let sst_iter = TwoMergeIterator::create(l0_iter, MergeIterator::create(level_iters))?;

        let inner: LsmIteratorInner = TwoMergeIterator::create(memtable_iter, sst_iter)?;
        let end_bound = upper.map(Bytes::copy_from_slice);
        LsmIterator::new(inner, end_bound).map_err(|e| SerengetiError::CorruptData(e.to_string()))
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: Arc::clone(&self.state.read()),
        }
    }

    pub fn read_in_snapshot(&self, snapshot: &Snapshot, key: &[u8]) -> Result<Option<Bytes>> {
        self.get_from_state(&snapshot.state, key)
    }

    pub fn release(&self, _snapshot: Snapshot) {}

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_batch(&[WriteBatchRecord::Put(key, value)])
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write_batch(&[WriteBatchRecord::Del(key)])
    }

    pub fn write_batch<T: AsRef<[u8]>>(&self, batch: &[WriteBatchRecord<T>]) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(SerengetiError::ReadOnly(
                "engine is read-only after a persistent flush failure".into(),
            ));
        }
        let mut approximate_size = 0;
        for record in batch {
            let sequence = next_sequence();
            match record {
                WriteBatchRecord::Put(key, value) => {
                    let key = key.as_ref();
                    let value = value.as_ref();
                    assert!(!key.is_empty(), "key must not be empty");
                    let guard = self.state.read();
                    guard.memtable.put(KeySlice::from_slice(key), value, sequence)?;
                    approximate_size = guard.memtable.approximate_size();
                }
                WriteBatchRecord::Del(key) => {
                    let key = key.as_ref();
                    let guard = self.state.read();
                    guard.memtable.delete(KeySlice::from_slice(key), sequence)?;
                    approximate_size = guard.memtable.approximate_size();
                }
            }
        }
        if approximate_size >= self.options.target_sst_size {
            let lock = self.state_lock.lock();
            self.force_freeze_memtable(&lock)?;
        }
        Ok(())
    }

    pub fn force_freeze_memtable(&self, _lock: &parking_lot::MutexGuard<'_, ()>) -> Result<()> {
        let id = self.next_sst_id();
        let memtable = if self.options.enable_wal {
            Arc::new(MemTable::create_with_wal(
                id,
                self.path_of_wal(id),
                self.options.wal_sync_mode,
            )?)
        } else {
            Arc::new(MemTable::create(id))
        };
        let old_memtable;
        {
            let mut state = self.state.read().as_ref().clone();
            old_memtable = std::mem::replace(&mut state.memtable, memtable);
            state.imm_memtables.insert(0, old_memtable.clone());
            *self.state.write() = Arc::new(state);
        }
        old_memtable.sync_wal()?;
        if let Some(manifest) = &self.manifest {
            manifest.add_record(_lock, ManifestRecord::NewMemTable(id))?;
        }
        self.sync_dir()?;
        Ok(())
    }

    /// Flushes the oldest immutable memtable into a new L0 (or L1, if
    /// the controller bypasses L0) SSTable. On repeated failure this
    /// marks the engine read-only (spec §4.4 failure semantics).
    pub fn force_flush_earliest_memtable(&self) -> Result<()> {
        match self.try_flush_earliest_memtable() {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(target: "serengeti::wal", error = %e, "flush failed, marking engine read-only");
                self.read_only.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    fn try_flush_earliest_memtable(&self) -> Result<()> {
        let _state_lock = self.state_lock.lock();
        let flush_memtable = {
            let guard = self.state.read();
            match guard.imm_memtables.last() {
                Some(m) => m.clone(),
                None => return Ok(()),
            }
        };

        let mut builder = crate::table::SsTableBuilder::new(self.options.block_size);
        flush_memtable.flush(&mut builder).map_err(|e| SerengetiError::Spill(e.to_string()))?;
        let sst_id = flush_memtable.id();
        let target_level = if self.compaction_controller.flush_to_l0() { 0 } else { 1 };
        let sst = Arc::new(builder.build(
            sst_id,
            target_level,
            Some(self.block_cache.clone()),
            self.path_of_sst(sst_id),
        )?);

        {
            let mut state = self.state.read().as_ref().clone();
            let popped = state.imm_memtables.pop();
            assert_eq!(popped.map(|m| m.id()), Some(sst_id));
            if self.compaction_controller.flush_to_l0() {
                state.l0_sstables.insert(0, sst_id);
            } else {
                state.levels[0].1.insert(0, sst_id);
            }
            state.sstables.insert(sst_id, sst);
            *self.state.write() = Arc::new(state);
        }
        if let Some(manifest) = &self.manifest {
            manifest.add_record_when_init(ManifestRecord::Flush(sst_id))?;
        }
        self.sync_dir()?;
        let _ = std::fs::remove_file(self.path_of_wal(sst_id));
        Ok(())
    }

    pub fn add_compaction_filter(&self, filter: CompactionFilter) {
        self.compaction_filters.lock().push(filter);
    }

    pub(crate) fn next_sst_id(&self) -> usize {
        self.next_sst_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn path_of_sst_static(path: impl AsRef<Path>, id: usize) -> PathBuf {
        path.as_ref().join(format!("{id:05}.sst"))
    }

    pub(crate) fn path_of_sst(&self, id: usize) -> PathBuf {
        Self::path_of_sst_static(&self.path, id)
    }

    pub(crate) fn path_of_wal_static(path: impl AsRef<Path>, id: usize) -> PathBuf {
        path.as_ref().join(format!("{id:05}.wal"))
    }

    pub(crate) fn path_of_wal(&self, id: usize) -> PathBuf {
        Self::path_of_wal_static(&self.path, id)
    }

    pub(super) fn sync_dir(&self) -> Result<()> {
        Ok(std::fs::File::open(&self.path)?.sync_all()?)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn open(path: impl AsRef<Path>, options: LsmStorageOptions) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let compaction_controller = match &options.compaction_options {
            CompactionOptions::Leveled(opts) => {
                CompactionController::Leveled(crate::compact::LeveledCompactionController::new(opts.clone()))
            }
            CompactionOptions::NoCompaction => CompactionController::None,
        };

        let manifest_path = path.join("MANIFEST");
        let block_cache = Arc::new(BlockCache::new(options.cache));

        let (manifest, state, next_id) = if manifest_path.is_file() {
            let (manifest, records) = Manifest::recover(&manifest_path)?;
            let mut state = LsmStroageState::create(&options);
            let mut max_id = 0usize;
            let mut memtable_ids = Vec::new();
            for record in records {
                match record {
                    ManifestRecord::Flush(id) => {
                        max_id = max_id.max(id);
                        if compaction_controller.flush_to_l0() {
                            state.l0_sstables.insert(0, id);
                        } else {
                            state.levels[0].1.insert(0, id);
                        }
                        memtable_ids.retain(|&m| m != id);
                    }
                    ManifestRecord::NewMemTable(id) => {
                        max_id = max_id.max(id);
                        memtable_ids.push(id);
                    }
                    ManifestRecord::Compaction(task, output) => {
                        for id in &output {
                            max_id = max_id.max(*id);
                        }
                        let (new_state, removed) =
                            compaction_controller.apply_compaction_result(&state, &task, &output);
                        state = new_state;
                        for id in removed {
                            state.sstables.remove(&id);
                        }
                    }
                }
            }
            for id in state
                .l0_sstables
                .iter()
                .chain(state.levels.iter().flat_map(|(_, ids)| ids.iter()))
            {
                let sst_path = Self::path_of_sst_static(&path, *id);
                let table = SsTable::open(
                    *id,
                    Some(block_cache.clone()),
                    crate::table::FileObject::open(&sst_path)?,
                )?;
                state.sstables.insert(*id, Arc::new(table));
            }
            for id in memtable_ids {
                let wal_path = Self::path_of_wal_static(&path, id);
                if wal_path.is_file() {
                    let memtable =
                        MemTable::recover_from_wal(id, wal_path.parent().unwrap(), options.wal_sync_mode)?;
                    state.imm_memtables.insert(0, Arc::new(memtable));
                }
            }
            let next_id = max_id + 1;
            state.memtable = Arc::new(if options.enable_wal {
                MemTable::create_with_wal(next_id, Self::path_of_wal_static(&path, next_id), options.wal_sync_mode)?
            } else {
                MemTable::create(next_id)
            });
            (Some(manifest), state, next_id + 1)
        } else {
            let manifest = Manifest::create(&manifest_path)?;
            let state = LsmStroageState::create(&options);
            manifest.add_record_when_init(ManifestRecord::NewMemTable(0))?;
            (Some(manifest), state, 1)
        };

        let inner = Arc::new(Self {
            state: Arc::new(RwLock::new(Arc::new(state))),
            state_lock: Mutex::new(()),
            path,
            block_cache,
            next_sst_id: AtomicUsize::new(next_id),
            options: Arc::new(options),
            compaction_controller,
            manifest,
            compaction_filters: Arc::new(Mutex::new(Vec::new())),
            read_only: AtomicBool::new(false),
        });
        info!(target: "serengeti::lsm", path = %inner.path.display(), "engine opened");
        Ok(inner)
    }
}

fn range_overlap(lower: Bound<&[u8]>, upper: Bound<&[u8]>, first: KeySlice, last: KeySlice) -> bool {
    match upper {
        Bound::Excluded(key) if key <= first.raw_ref() => return false,
        Bound::Included(key) if key < first.raw_ref() => return false,
        _ => {}
    }
    match lower {
        Bound::Excluded(key) if key >= last.raw_ref() => return false,
        Bound::Included(key) if key > last.raw_ref() => return false,
        _ => {}
    }
    true
}

/// The public handle wrapping the engine: owns the background flush and
/// compaction workers and shuts them down cleanly on drop.
pub struct MiniLsm {
    pub(crate) inner: Arc<LsmStorageInner>,
    flush_tx: Sender<()>,
    compaction_tx: Sender<()>,
    flush_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    compaction_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MiniLsm {
    pub fn open(path: impl AsRef<Path>, options: LsmStorageOptions) -> Result<Arc<Self>> {
        let inner = LsmStorageInner::open(path, options)?;
        let (flush_tx, flush_rx) = channel::unbounded();
        let (compaction_tx, compaction_rx) = channel::unbounded();
        let flush_handle = inner.spawn_flush_thread(flush_rx)?;
        let compaction_handle = inner.spawn_compaction_thread(compaction_rx)?;
        Ok(Arc::new(Self {
            inner,
            flush_tx,
            compaction_tx,
            flush_handle: Mutex::new(flush_handle),
            compaction_handle: Mutex::new(compaction_handle),
        }))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.get(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)
    }

    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<LsmIterator> {
        self.inner.scan(lower, upper)
    }

    pub fn force_flush(&self) -> Result<()> {
        {
            let lock = self.inner.state_lock.lock();
            let needs_freeze = !self.inner.state.read().memtable.is_empty();
            if needs_freeze {
                self.inner.force_freeze_memtable(&lock)?;
            }
        }
        self.inner.force_flush_earliest_memtable()
    }

    pub fn force_compact(&self) -> Result<()> {
        self.inner.force_compact()
    }

    pub fn close(&self) -> Result<()> {
        let _ = self.flush_tx.send(());
        let _ = self.compaction_tx.send(());
        if let Some(h) = self.flush_handle.lock().take() {
            let _ = h.join();
        }
        if let Some(h) = self.compaction_handle.lock().take() {
            let _ = h.join();
        }
        Ok(())
    }
}

impl Drop for MiniLsm {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(target: "serengeti::lsm", error = %e, "error while closing engine");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> LsmStorageOptions {
        LsmStorageOptions {
            block_size: 256,
            target_sst_size: 1 << 20,
            max_memtable_limit: 4,
            compaction_options: CompactionOptions::NoCompaction,
            enable_wal: false,
            wal_sync_mode: SyncMode::Sync,
            cache: CacheConfig::default(),
        }
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = MiniLsm::open(dir.path(), opts()).unwrap();
        lsm.put(b"a", b"1").unwrap();
        lsm.put(b"b", b"2").unwrap();
        lsm.delete(b"a").unwrap();
        assert_eq!(lsm.get(b"a").unwrap(), None);
        assert_eq!(lsm.get(b"b").unwrap(), Some(Bytes::from_static(b"2")));
    }

    #[test]
    fn flush_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = MiniLsm::open(dir.path(), opts()).unwrap();
        for i in 0..50u32 {
            lsm.put(format!("k{i:04}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        lsm.force_flush().unwrap();
        assert_eq!(
            lsm.get(b"k0010").unwrap(),
            Some(Bytes::from_static(b"v10"))
        );
    }
}
