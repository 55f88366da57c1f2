//! Leveled compaction controller: L0 compacts into L1 once the L0
//! table count crosses a trigger, and each lower level compacts into
//! the next once its total size exceeds a target derived from
//! `base_level_size_mb` scaled by `level_size_multiplier` per level.

use serde::{Deserialize, Serialize};

use crate::lsm_storage::LsmStroageState;

#[derive(Debug, Serialize, Deserialize)]
pub struct LeveledCompactionTask {
    /// `None` means the upper input is L0.
    pub upper_level: Option<usize>,
    pub upper_level_sst_ids: Vec<usize>,
    pub lower_level: usize,
    pub lower_level_sst_ids: Vec<usize>,
    pub is_lower_level_bottom_level: bool,
}

pub struct LeveledCompactionController {
    options: LeveledCompactionOptions,
}

#[derive(Debug, Clone)]
pub struct LeveledCompactionOptions {
    pub level_size_multiplier: usize,
    pub level0_files_num_compaction_threshold: usize,
    pub max_levels: usize,
    pub base_level_size_mb: usize,
}

impl LeveledCompactionController {
    pub fn new(options: LeveledCompactionOptions) -> Self {
        Self { options }
    }

    fn target_size_bytes(&self, level: usize) -> u64 {
        let base = self.options.base_level_size_mb as u64 * (1 << 20);
        base * (self.options.level_size_multiplier as u64).pow(level.saturating_sub(1) as u32)
    }

    pub fn generate_compaction_task(
        &self,
        snapshot: &LsmStroageState,
    ) -> Option<LeveledCompactionTask> {
        if snapshot.l0_sstables.len() >= self.options.level0_files_num_compaction_threshold {
            let lower_level = 1;
            let lower_ids = snapshot.levels[lower_level - 1].1.clone();
            let overlap_ids = self.overlapping(snapshot, &snapshot.l0_sstables, &lower_ids);
            return Some(LeveledCompactionTask {
                upper_level: None,
                upper_level_sst_ids: snapshot.l0_sstables.clone(),
                lower_level,
                lower_level_sst_ids: overlap_ids,
                is_lower_level_bottom_level: lower_level == self.options.max_levels,
            });
        }

        for level in 1..self.options.max_levels {
            let level_size: u64 = snapshot.levels[level - 1]
                .1
                .iter()
                .filter_map(|id| snapshot.sstables.get(id))
                .map(|t| t.table_size())
                .sum();
            if level_size <= self.target_size_bytes(level) {
                continue;
            }
            let upper_ids = snapshot.levels[level - 1].1.clone();
            let Some(oldest) = upper_ids.first().copied() else {
                continue;
            };
            let lower_level = level + 1;
            let lower_ids = snapshot.levels[lower_level - 1].1.clone();
            let overlap_ids = self.overlapping(snapshot, &[oldest], &lower_ids);
            return Some(LeveledCompactionTask {
                upper_level: Some(level),
                upper_level_sst_ids: vec![oldest],
                lower_level,
                lower_level_sst_ids: overlap_ids,
                is_lower_level_bottom_level: lower_level == self.options.max_levels,
            });
        }
        None
    }

    fn overlapping(
        &self,
        snapshot: &LsmStroageState,
        upper_ids: &[usize],
        lower_ids: &[usize],
    ) -> Vec<usize> {
        let Some((mut lo, mut hi)) = upper_ids
            .iter()
            .filter_map(|id| snapshot.sstables.get(id))
            .map(|t| (t.first_key().clone(), t.last_key().clone()))
            .reduce(|(lo, hi), (l, h)| {
                (std::cmp::min(lo, l), std::cmp::max(hi, h))
            })
        else {
            return Vec::new();
        };
        let _ = (&mut lo, &mut hi);
        lower_ids
            .iter()
            .filter(|id| {
                let Some(table) = snapshot.sstables.get(*id) else {
                    return false;
                };
                table.first_key() <= &hi && table.last_key() >= &lo
            })
            .copied()
            .collect()
    }

    pub fn apply_compaction_result(
        &self,
        snapshot: &LsmStroageState,
        task: &LeveledCompactionTask,
        output: &[usize],
    ) -> (LsmStroageState, Vec<usize>) {
        let mut state = snapshot.clone();
        let mut removed = Vec::new();

        match task.upper_level {
            None => {
                let remove: std::collections::HashSet<_> =
                    task.upper_level_sst_ids.iter().copied().collect();
                state.l0_sstables.retain(|id| !remove.contains(id));
                removed.extend(task.upper_level_sst_ids.iter().copied());
            }
            Some(level) => {
                let remove: std::collections::HashSet<_> =
                    task.upper_level_sst_ids.iter().copied().collect();
                state.levels[level - 1].1.retain(|id| !remove.contains(id));
                removed.extend(task.upper_level_sst_ids.iter().copied());
            }
        }

        let lower_remove: std::collections::HashSet<_> =
            task.lower_level_sst_ids.iter().copied().collect();
        state.levels[task.lower_level - 1]
            .1
            .retain(|id| !lower_remove.contains(id));
        removed.extend(task.lower_level_sst_ids.iter().copied());

        let mut new_ids = state.levels[task.lower_level - 1].1.clone();
        new_ids.extend(output.iter().copied());
        new_ids.sort_by_key(|id| {
            state
                .sstables
                .get(id)
                .map(|t| t.first_key().clone())
                .unwrap_or_default()
        });
        state.levels[task.lower_level - 1].1 = new_ids;

        (state, removed)
    }
}
