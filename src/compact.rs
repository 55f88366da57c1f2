//! Compaction (part of C4): merges overlapping SSTables into new,
//! non-overlapping runs at a lower level, dropping tombstones once no
//! lower level could still hold a shadowed value (spec §4.4).

mod leveled;

use crate::error::Result;
use crate::key::KeySlice;
use crate::table::{SsTable, SsTableBuilder, SsTableIterator};
use crate::{iterators::StorageIterator, manifest::ManifestRecord};
pub use leveled::{LeveledCompactionController, LeveledCompactionTask};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::lsm_storage::{CompactionFilter, LsmStorageInner, LsmStorageState};

use self::concat_iterator::SstConcatIterator;
pub use self::leveled::LeveledCompactionOptions;
use self::merge_iterator::MergeIterator;
use self::two_merge_iterator::TwoMergeIterator;
use crate::iterators::concat_iterator;
use crate::iterators::merge_iterator;
use crate::iterators::two_merge_iterator;

#[derive(Debug, Serialize, Deserialize)]
pub enum CompactionTask {
    Leveled(LeveledCompactionTask),
    ForceFullCompaction {
        l0_sstables: Vec<usize>,
        l1_sstables: Vec<usize>,
    },
}

impl CompactionTask {
    fn compact_to_bottom_level(&self) -> bool {
        match self {
            CompactionTask::ForceFullCompaction { .. } => true,
            CompactionTask::Leveled(task) => task.is_lower_level_bottom_level,
        }
    }

    fn output_level(&self) -> usize {
        match self {
            CompactionTask::ForceFullCompaction { .. } => 1,
            CompactionTask::Leveled(task) => task.lower_level,
        }
    }
}

pub(crate) enum CompactionController {
    Leveled(LeveledCompactionController),
    None,
}

impl CompactionController {
    pub fn generate_compaction_task(&self, snapshot: &LsmStorageState) -> Option<CompactionTask> {
        match self {
            CompactionController::Leveled(handle) => handle
                .generate_compaction_task(snapshot)
                .map(CompactionTask::Leveled),
            CompactionController::None => None,
        }
    }

    pub fn apply_compaction_result(
        &self,
        snapshot: &LsmStorageState,
        task: &CompactionTask,
        output: &[usize],
    ) -> (LsmStorageState, Vec<usize>) {
        match (self, task) {
            (CompactionController::Leveled(ctrl), CompactionTask::Leveled(task)) => {
                ctrl.apply_compaction_result(snapshot, task, output)
            }
            _ => unreachable!("compaction controller/task mismatch"),
        }
    }

    pub fn flush_to_l0(&self) -> bool {
        matches!(self, Self::None | Self::Leveled(_))
    }
}

#[derive(Debug, Clone)]
pub enum CompactionOptions {
    Leveled(LeveledCompactionOptions),
    NoCompaction,
}

impl LsmStorageInner {
    /// Merges all SSTables from L0 and L1 into new L1 SSTables. Used
    /// when no background compaction scheduler is running.
    pub fn force_compact(&self) -> Result<()> {
        let CompactionOptions::NoCompaction = self.options.compaction_options else {
            panic!("force_compact can only be called with compaction disabled")
        };
        let snapshot = {
            let state = self.state.read();
            state.clone()
        };

        let l0_sstables = snapshot.l0_sstables.clone();
        let l1_sstables = snapshot.levels[0].1.clone();
        let compaction_task = CompactionTask::ForceFullCompaction {
            l0_sstables: l0_sstables.clone(),
            l1_sstables: l1_sstables.clone(),
        };
        info!(target: "serengeti::compaction", ?compaction_task, "starting force full compaction");
        let sstables = self.compact_inner(&compaction_task)?;

        let mut ids = Vec::with_capacity(sstables.len());
        {
            let state_lock = self.state_lock.lock();
            let mut state = self.state.read().as_ref().clone();
            for sst in l0_sstables.iter().chain(l1_sstables.iter()) {
                state.sstables.remove(sst);
            }
            for new_sst in sstables {
                ids.push(new_sst.sst_id());
                state.sstables.insert(new_sst.sst_id(), new_sst);
            }
            state.levels[0].1 = ids.clone();
            let mut l0_set = l0_sstables.iter().copied().collect::<HashSet<_>>();
            state.l0_sstables = state
                .l0_sstables
                .iter()
                .filter(|x| !l0_set.remove(x))
                .copied()
                .collect::<Vec<_>>();
            *self.state.write() = Arc::new(state);
            self.sync_dir()?;
            if let Some(manifest) = self.manifest.as_ref() {
                manifest.add_record(
                    &state_lock,
                    ManifestRecord::Compaction(compaction_task, ids.clone()),
                )?;
            }
        }
        for sst in l0_sstables.iter().chain(l1_sstables.iter()) {
            let _ = std::fs::remove_file(self.path_of_sst(*sst));
        }
        info!(target: "serengeti::compaction", new_ssts = ?ids, "force full compaction done");

        Ok(())
    }

    fn compact_inner(&self, task: &CompactionTask) -> Result<Vec<Arc<SsTable>>> {
        let snapshot = {
            let state = self.state.read();
            state.clone()
        };
        let output_level = task.output_level();
        match task {
            CompactionTask::ForceFullCompaction {
                l0_sstables,
                l1_sstables,
            } => {
                let mut l0_iters = Vec::with_capacity(l0_sstables.len());
                for id in l0_sstables.iter() {
                    l0_iters.push(Box::new(SsTableIterator::create_and_seek_to_first(
                        snapshot.sstables.get(id).unwrap().clone(),
                    )?));
                }
                let mut l1_iters = Vec::with_capacity(l1_sstables.len());
                for id in l1_sstables.iter() {
                    l1_iters.push(snapshot.sstables.get(id).unwrap().clone());
                }
                let iter = TwoMergeIterator::create(
                    MergeIterator::create(l0_iters),
                    SstConcatIterator::create_and_seek_to_first(l1_iters)?,
                )?;
                self.compact_generate_sst(iter, task.compact_to_bottom_level(), output_level)
            }
            CompactionTask::Leveled(LeveledCompactionTask {
                upper_level,
                upper_level_sst_ids,
                lower_level_sst_ids,
                ..
            }) => {
                let mut lower_ssts = Vec::with_capacity(lower_level_sst_ids.len());
                for id in lower_level_sst_ids.iter() {
                    lower_ssts.push(snapshot.sstables.get(id).unwrap().clone());
                }
                let lower_iter = SstConcatIterator::create_and_seek_to_first(lower_ssts)?;
                match upper_level {
                    Some(_) => {
                        let mut upper_ssts = Vec::with_capacity(upper_level_sst_ids.len());
                        for id in upper_level_sst_ids.iter() {
                            upper_ssts.push(snapshot.sstables.get(id).unwrap().clone());
                        }
                        let upper_iter = SstConcatIterator::create_and_seek_to_first(upper_ssts)?;
                        self.compact_generate_sst(
                            TwoMergeIterator::create(upper_iter, lower_iter)?,
                            task.compact_to_bottom_level(),
                            output_level,
                        )
                    }
                    None => {
                        let mut upper_iters = Vec::with_capacity(upper_level_sst_ids.len());
                        for id in upper_level_sst_ids.iter() {
                            upper_iters.push(Box::new(SsTableIterator::create_and_seek_to_first(
                                snapshot.sstables.get(id).unwrap().clone(),
                            )?));
                        }
                        let upper_iter = MergeIterator::create(upper_iters);
                        self.compact_generate_sst(
                            TwoMergeIterator::create(upper_iter, lower_iter)?,
                            task.compact_to_bottom_level(),
                            output_level,
                        )
                    }
                }
            }
        }
    }

    /// Drains a merged iterator into fresh SSTables at `output_level`,
    /// dropping tombstones only when `compact_to_bottom_level` is set
    /// (no level below can still hold a shadowed value).
    fn compact_generate_sst(
        &self,
        mut iter: impl for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>,
        compact_to_bottom_level: bool,
        output_level: usize,
    ) -> Result<Vec<Arc<SsTable>>> {
        let mut builder = None;
        let mut new_sst = Vec::new();
        let mut last_key = Vec::<u8>::new();
        let compaction_filters = self.compaction_filters.lock().clone();

        'outer: while iter.is_valid() {
            if builder.is_none() {
                builder = Some(SsTableBuilder::new(self.options.block_size));
            }

            let same_as_last_key = iter.key().key_ref() == last_key;

            if compact_to_bottom_level && !same_as_last_key && iter.is_tombstone() {
                last_key.clear();
                last_key.extend(iter.key().key_ref());
                iter.next()?;
                continue;
            }

            if same_as_last_key {
                // a lower-sequence duplicate of a key already written; skip.
                iter.next()?;
                continue;
            }

            if !compaction_filters.is_empty() {
                let mut filtered = false;
                for filter in &compaction_filters {
                    match filter {
                        CompactionFilter::Prefix(x) => {
                            if iter.key().key_ref().starts_with(x) {
                                filtered = true;
                            }
                        }
                    }
                }
                if filtered {
                    last_key.clear();
                    last_key.extend(iter.key().key_ref());
                    iter.next()?;
                    continue 'outer;
                }
            }

            let builder_inner = builder.as_mut().unwrap();
            if builder_inner.estimate_size() >= self.options.target_sst_size {
                let sst_id = self.next_sst_id();
                let old_builder = builder.take().unwrap();
                let sst = Arc::new(old_builder.build(
                    sst_id,
                    output_level,
                    Some(self.block_cache.clone()),
                    self.path_of_sst(sst_id),
                )?);
                new_sst.push(sst);
                builder = Some(SsTableBuilder::new(self.options.block_size));
            }

            let builder_inner = builder.as_mut().unwrap();
            builder_inner.add(iter.key(), iter.value(), iter.is_tombstone(), iter.sequence());

            last_key.clear();
            last_key.extend(iter.key().key_ref());

            iter.next()?;
        }
        if let Some(builder) = builder {
            if !builder.is_empty() {
                let sst_id = self.next_sst_id();
                let sst = Arc::new(builder.build(
                    sst_id,
                    output_level,
                    Some(self.block_cache.clone()),
                    self.path_of_sst(sst_id),
                )?);
                new_sst.push(sst);
            }
        }
        Ok(new_sst)
    }

    pub(crate) fn spawn_compaction_thread(
        self: &Arc<Self>,
        rx: crossbeam::channel::Receiver<()>,
    ) -> Result<Option<std::thread::JoinHandle<()>>> {
        if !matches!(self.options.compaction_options, CompactionOptions::NoCompaction) {
            let this = self.clone();
            let handle = std::thread::Builder::new()
                .name("serengeti-compaction".into())
                .spawn(move || loop {
                    match rx.recv_timeout(Duration::from_millis(50)) {
                        Ok(_) => return,
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                            if let Err(e) = this.trigger_compaction() {
                                warn!(target: "serengeti::compaction", error = %e, "compaction cycle failed");
                            }
                        }
                    }
                })?;
            return Ok(Some(handle));
        }
        Ok(None)
    }

    fn trigger_compaction(&self) -> Result<()> {
        let snapshot = self.state.read().clone();
        let Some(task) = self.compaction_controller.generate_compaction_task(&snapshot) else {
            return Ok(());
        };
        info!(target: "serengeti::compaction", ?task, "compaction task selected");
        let output = self.compact_inner(&task)?;
        let output_ids: Vec<usize> = output.iter().map(|s| s.sst_id()).collect();

        let removed_ids;
        {
            let state_lock = self.state_lock.lock();
            let snapshot = self.state.read().as_ref().clone();
            let (mut new_state, removed) = self
                .compaction_controller
                .apply_compaction_result(&snapshot, &task, &output_ids);
            for id in &removed {
                new_state.sstables.remove(id);
            }
            for sst in output {
                new_state.sstables.insert(sst.sst_id(), sst);
            }
            removed_ids = removed;
            *self.state.write() = Arc::new(new_state);
            self.sync_dir()?;
            if let Some(manifest) = self.manifest.as_ref() {
                manifest.add_record(&state_lock, ManifestRecord::Compaction(task, output_ids))?;
            }
        }
        for id in removed_ids {
            let _ = std::fs::remove_file(self.path_of_sst(id));
        }
        Ok(())
    }

    pub(crate) fn spawn_flush_thread(
        self: &Arc<Self>,
        rx: crossbeam::channel::Receiver<()>,
    ) -> Result<Option<std::thread::JoinHandle<()>>> {
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("serengeti-flush".into())
            .spawn(move || loop {
                match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(_) => return,
                    Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                        if let Err(e) = this.trigger_flush() {
                            warn!(target: "serengeti::wal", error = %e, "flush cycle failed, engine may go read-only");
                        }
                    }
                }
            })?;
        Ok(Some(handle))
    }

    fn trigger_flush(&self) -> Result<()> {
        let should_flush = {
            let state = self.state.read();
            state.imm_memtables.len() >= self.options.max_memtable_limit
        };
        if should_flush {
            self.force_flush_earliest_memtable()?;
        }
        Ok(())
    }
}
