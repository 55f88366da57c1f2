//! External merge sort (spec §4.10): rows are chunked to at most
//! `max_rows_per_chunk`, each chunk sorted in memory and written to its
//! own spill file, then merged with a k-way heap merge on consume.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::memory::{OperatorId, QueryId};
use crate::query::ast::OrderByItem;
use crate::query::executor::Row;

use super::{encode_err, io_err, spill_path};

/// A sort key extractor plus direction list, shared between the
/// in-memory and on-disk comparison paths.
fn compare(a: &Row, b: &Row, keys: &[OrderByItem]) -> Ordering {
    use crate::query::ast::SortDirection;
    for item in keys {
        let av = a.columns.get(&item.column);
        let bv = b.columns.get(&item.column);
        let ord = match (av, bv) {
            (Some(x), Some(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        };
        let ord = if item.direction == SortDirection::Desc { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn write_chunk(path: &Path, rows: &[Row]) -> Result<()> {
    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        let bytes = bincode::serialize(row).map_err(encode_err)?;
        writer.write_all(&(bytes.len() as u32).to_le_bytes()).map_err(io_err)?;
        writer.write_all(&bytes).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)?;
    Ok(())
}

struct ChunkReader {
    reader: BufReader<File>,
}

impl ChunkReader {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self { reader: BufReader::new(File::open(path).map_err(io_err)?) })
    }

    fn next(&mut self) -> Result<Option<Row>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(io_err(e)),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).map_err(io_err)?;
        let row = bincode::deserialize(&buf).map_err(encode_err)?;
        Ok(Some(row))
    }
}

/// Sorts an arbitrarily large row stream by spilling sorted chunks to
/// disk and merging them lazily. Chunks are cleaned up as soon as the
/// merge consumes them, and eagerly on drop if the sort is abandoned
/// early.
pub struct ExternalSorter {
    dir: PathBuf,
    query: QueryId,
    op: OperatorId,
    keys: Vec<OrderByItem>,
    max_rows_per_chunk: usize,
    pending: Vec<Row>,
    chunk_paths: Vec<PathBuf>,
}

impl ExternalSorter {
    pub fn new(dir: PathBuf, query: QueryId, op: OperatorId, keys: Vec<OrderByItem>, max_rows_per_chunk: usize) -> Self {
        Self {
            dir,
            query,
            op,
            keys,
            max_rows_per_chunk: max_rows_per_chunk.max(1),
            pending: Vec::new(),
            chunk_paths: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Row) -> Result<()> {
        self.pending.push(row);
        if self.pending.len() >= self.max_rows_per_chunk {
            self.flush_chunk()?;
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.pending.sort_by(|a, b| compare(a, b, &self.keys));
        let path = spill_path(&self.dir, self.query, self.op);
        write_chunk(&path, &self.pending)?;
        debug!(rows = self.pending.len(), path = %path.display(), "sort chunk spilled");
        self.pending.clear();
        self.chunk_paths.push(path);
        Ok(())
    }

    /// Spills the in-memory tail as another chunk, freeing its bytes.
    /// Used by [`crate::memory::Spillable::spill`] implementations.
    pub fn spill_resident(&mut self) -> Result<u64> {
        let freed = self.pending.len() as u64 * 256;
        self.flush_chunk()?;
        Ok(freed)
    }

    /// Consumes the sorter, producing a fully merged, sorted row stream.
    /// If nothing was ever spilled this degrades to an in-memory sort.
    pub fn finish(mut self) -> Result<Vec<Row>> {
        if self.chunk_paths.is_empty() {
            self.pending.sort_by(|a, b| compare(a, b, &self.keys));
            return Ok(std::mem::take(&mut self.pending));
        }
        self.flush_chunk()?;

        let keys = std::rc::Rc::new(self.keys.clone());
        let mut readers: Vec<ChunkReader> =
            self.chunk_paths.iter().map(|p| ChunkReader::open(p)).collect::<Result<_>>()?;
        let mut heap: BinaryHeap<std::cmp::Reverse<OrdRow>> = BinaryHeap::new();
        for (i, reader) in readers.iter_mut().enumerate() {
            if let Some(row) = reader.next()? {
                heap.push(std::cmp::Reverse(OrdRow { row, source: i, keys: keys.clone() }));
            }
        }

        let mut out = Vec::new();
        while let Some(std::cmp::Reverse(item)) = heap.pop() {
            let source = item.source;
            out.push(item.row);
            if let Some(next) = readers[source].next()? {
                heap.push(std::cmp::Reverse(OrdRow { row: next, source, keys: keys.clone() }));
            }
        }

        for path in &self.chunk_paths {
            let _ = std::fs::remove_file(path);
        }
        Ok(out)
    }
}

impl Drop for ExternalSorter {
    fn drop(&mut self) {
        for path in &self.chunk_paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Helper wrapper so `Row`s can be ordered by the sort keys inside the
/// merge heap without making [`Row`] itself `Ord`.
struct OrdRow {
    row: Row,
    source: usize,
    keys: std::rc::Rc<Vec<OrderByItem>>,
}

impl PartialEq for OrdRow {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for OrdRow {}
impl PartialOrd for OrdRow {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrdRow {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.row, &other.row, &self.keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::SortDirection;
    use crate::value::Value;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn row(n: i64) -> Row {
        let mut columns = BTreeMap::new();
        columns.insert("n".to_string(), Value::Int(n));
        Row { id: Uuid::new_v4(), columns }
    }

    #[test]
    fn sorts_across_multiple_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let keys = vec![OrderByItem { column: "n".to_string(), direction: SortDirection::Asc }];
        let mut sorter = ExternalSorter::new(dir.path().to_path_buf(), Uuid::new_v4(), 1, keys, 2);
        for n in [5, 3, 8, 1, 9, 2] {
            sorter.push(row(n)).unwrap();
        }
        let sorted = sorter.finish().unwrap();
        let values: Vec<i64> = sorted.iter().map(|r| r.columns["n"].as_int().unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3, 5, 8, 9]);
    }

    #[test]
    fn small_input_never_spills_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let keys = vec![OrderByItem { column: "n".to_string(), direction: SortDirection::Asc }];
        let mut sorter = ExternalSorter::new(dir.path().to_path_buf(), Uuid::new_v4(), 1, keys, 1000);
        sorter.push(row(2)).unwrap();
        sorter.push(row(1)).unwrap();
        assert!(sorter.chunk_paths.is_empty());
        let sorted = sorter.finish().unwrap();
        assert_eq!(sorted[0].columns["n"].as_int(), Some(1));
    }
}
