use crate::key::KeySlice;
use crate::table::iterator::SsTableIterator;
use crate::table::SsTable;

use std::sync::Arc;

use super::StorageIterator;

/// Concatenates SSTables whose key ranges are non-overlapping and
/// already sorted, so the whole run can be treated as one sorted
/// stream without a merge-heap. Used for L1+ levels during compaction.
pub struct SstConcatIterator {
    current: Option<SsTableIterator>,
    next_sst_idx: usize,
    sstables: Vec<Arc<SsTable>>,
}

impl SstConcatIterator {
    pub fn create_and_seek_to_first(sstables: Vec<Arc<SsTable>>) -> anyhow::Result<Self> {
        Self::check_sst_valid(&sstables);
        if sstables.is_empty() {
            return Ok(Self {
                current: None,
                next_sst_idx: 0,
                sstables,
            });
        }
        let current = Some(SsTableIterator::create_and_seek_to_first(
            sstables[0].clone(),
        )?);
        let mut iter = Self {
            current,
            next_sst_idx: 1,
            sstables,
        };
        iter.move_until_valid()?;
        Ok(iter)
    }

    pub fn create_and_seek_to_key(
        sstables: Vec<Arc<SsTable>>,
        key: KeySlice,
    ) -> anyhow::Result<Self> {
        Self::check_sst_valid(&sstables);
        let idx = sstables
            .partition_point(|table| table.first_key().as_key_slice() <= key)
            .saturating_sub(1);
        if idx >= sstables.len() {
            return Ok(Self {
                current: None,
                next_sst_idx: sstables.len(),
                sstables,
            });
        }
        let current = Some(SsTableIterator::create_and_seek_to_key(
            sstables[idx].clone(),
            key,
        )?);
        let mut iter = Self {
            current,
            next_sst_idx: idx + 1,
            sstables,
        };
        iter.move_until_valid()?;
        Ok(iter)
    }

    fn check_sst_valid(sstables: &[Arc<SsTable>]) {
        for table in sstables {
            assert!(table.first_key() <= table.last_key());
        }
        for pair in sstables.windows(2) {
            assert!(pair[0].last_key() < pair[1].first_key());
        }
    }

    /// Advance past exhausted SSTables, opening the next one, until the
    /// iterator points at a real entry or every table is exhausted.
    fn move_until_valid(&mut self) -> anyhow::Result<()> {
        while let Some(iter) = self.current.as_mut() {
            if iter.is_valid() {
                break;
            }
            if self.next_sst_idx >= self.sstables.len() {
                self.current = None;
            } else {
                self.current = Some(SsTableIterator::create_and_seek_to_first(
                    self.sstables[self.next_sst_idx].clone(),
                )?);
                self.next_sst_idx += 1;
            }
        }
        Ok(())
    }
}

impl StorageIterator for SstConcatIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn is_valid(&self) -> bool {
        self.current.as_ref().is_some_and(|iter| iter.is_valid())
    }

    fn key(&self) -> Self::KeyType<'_> {
        self.current.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().unwrap().value()
    }

    fn is_tombstone(&self) -> bool {
        self.current.as_ref().unwrap().is_tombstone()
    }

    fn sequence(&self) -> u64 {
        self.current.as_ref().unwrap().sequence()
    }

    fn next(&mut self) -> anyhow::Result<()> {
        self.current.as_mut().unwrap().next()?;
        self.move_until_valid()?;
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        1
    }
}
