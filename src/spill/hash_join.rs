//! Partitioned hash join (spec §4.10): the build side is hashed into
//! `P` partitions; any partition too big to keep resident spills to
//! disk, and the probe side is partitioned the same way so a probe
//! row only ever needs its one matching build partition loaded.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use tracing::debug;

use crate::error::Result;
use crate::memory::{OperatorId, QueryId};
use crate::query::executor::Row;
use crate::value::Value;

use super::{encode_err, io_err, spill_path};

fn hash_key(value: &Value, seed: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    value.to_display_string().hash(&mut hasher);
    hasher.finish()
}

struct Partition {
    resident: Vec<Row>,
    spill_path: Option<PathBuf>,
}

impl Partition {
    fn new() -> Self {
        Self { resident: Vec::new(), spill_path: None }
    }

    fn spill(&mut self, dir: &PathBuf, query: QueryId, op: OperatorId) -> Result<u64> {
        if self.resident.is_empty() {
            return Ok(0);
        }
        let path = spill_path(dir, query, op);
        let bytes = bincode::serialize(&self.resident).map_err(encode_err)?;
        std::fs::write(&path, &bytes).map_err(io_err)?;
        let freed = self.resident.len() as u64 * 256;
        self.resident.clear();
        self.spill_path = Some(path);
        Ok(freed)
    }

    fn load_spilled(&self) -> Result<Vec<Row>> {
        match &self.spill_path {
            None => Ok(Vec::new()),
            Some(path) => {
                let bytes = std::fs::read(path).map_err(io_err)?;
                bincode::deserialize(&bytes).map_err(encode_err)
            }
        }
    }

    fn cleanup(&self) {
        if let Some(path) = &self.spill_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Builds the hash table for one side of an equi-join, partitioned by
/// `hash(key) mod partitions`, spilling the largest resident partition
/// whenever the memory manager asks for relief.
pub struct PartitionedHashJoin {
    dir: PathBuf,
    query: QueryId,
    op: OperatorId,
    join_column: String,
    partitions: Vec<Partition>,
}

impl PartitionedHashJoin {
    pub fn new(dir: PathBuf, query: QueryId, op: OperatorId, join_column: String, partitions: usize) -> Self {
        Self {
            dir,
            query,
            op,
            join_column,
            partitions: (0..partitions.max(1)).map(|_| Partition::new()).collect(),
        }
    }

    fn partition_of(&self, value: &Value, seed: u64) -> usize {
        (hash_key(value, seed) as usize) % self.partitions.len()
    }

    pub fn build(&mut self, row: Row) {
        let Some(key) = row.columns.get(&self.join_column) else { return };
        let idx = self.partition_of(key, 0);
        self.partitions[idx].resident.push(row);
    }

    /// Spills the largest resident partition, returning bytes freed.
    /// Used as the [`crate::memory::Spillable`] hook.
    pub fn spill_largest(&mut self) -> Result<u64> {
        let Some((idx, _)) = self
            .partitions
            .iter()
            .enumerate()
            .max_by_key(|(_, p)| p.resident.len())
            .filter(|(_, p)| !p.resident.is_empty())
        else {
            return Ok(0);
        };
        debug!(partition = idx, rows = self.partitions[idx].resident.len(), "hash join partition spilled");
        self.partitions[idx].spill(&self.dir, self.query, self.op)
    }

    /// Probes every build-side row matching `probe_rows` (partitioned
    /// identically), preserving probe-side order in the output.
    pub fn probe(&self, probe_rows: Vec<Row>) -> Result<Vec<(Row, Row)>> {
        let mut by_partition: Vec<Vec<Row>> = (0..self.partitions.len()).map(|_| Vec::new()).collect();
        for row in probe_rows {
            if let Some(key) = row.columns.get(&self.join_column) {
                let idx = self.partition_of(key, 0);
                by_partition[idx].push(row);
            }
        }

        let mut out = Vec::new();
        for (idx, probe_part) in by_partition.into_iter().enumerate() {
            if probe_part.is_empty() {
                continue;
            }

            let mut index: HashMap<String, Vec<&Row>> = HashMap::new();
            let resident = &self.partitions[idx].resident;
            let spilled = self.partitions[idx].load_spilled()?;
            for r in resident.iter().chain(spilled.iter()) {
                if let Some(key) = r.columns.get(&self.join_column) {
                    index.entry(key.to_display_string()).or_default().push(r);
                }
            }
            for probe_row in &probe_part {
                if let Some(key) = probe_row.columns.get(&self.join_column) {
                    if let Some(matches) = index.get(&key.to_display_string()) {
                        for build_row in matches {
                            out.push(((*build_row).clone(), probe_row.clone()));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn cleanup(&self) {
        for p in &self.partitions {
            p.cleanup();
        }
    }
}

impl Drop for PartitionedHashJoin {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn row(id_col: i64, tag: &str) -> Row {
        let mut columns = BTreeMap::new();
        columns.insert("id".to_string(), Value::Int(id_col));
        columns.insert("tag".to_string(), Value::Str(tag.to_string()));
        Row { id: Uuid::new_v4(), columns }
    }

    #[test]
    fn probes_match_on_join_column() {
        let dir = tempfile::tempdir().unwrap();
        let mut join = PartitionedHashJoin::new(dir.path().to_path_buf(), Uuid::new_v4(), 1, "id".into(), 4);
        join.build(row(1, "a"));
        join.build(row(2, "b"));

        let probe = vec![row(1, "probe-a"), row(3, "probe-missing")];
        let matched = join.probe(probe).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].0.columns["tag"].as_str(), Some("a"));
        assert_eq!(matched[0].1.columns["tag"].as_str(), Some("probe-a"));
    }

    #[test]
    fn spill_then_probe_still_matches() {
        let dir = tempfile::tempdir().unwrap();
        let mut join = PartitionedHashJoin::new(dir.path().to_path_buf(), Uuid::new_v4(), 1, "id".into(), 1);
        join.build(row(7, "build"));
        let freed = join.spill_largest().unwrap();
        assert!(freed > 0);

        let probe = vec![row(7, "probe")];
        let matched = join.probe(probe).unwrap();
        assert_eq!(matched.len(), 1);
    }
}
