//! The engine-level iterator (C4's read path): merges the active
//! memtable, frozen memtables, L0 tables and every level below into one
//! sorted stream, skipping tombstones and clipping to the scan's end
//! bound.

use std::ops::Bound;

use anyhow::Result;
use bytes::Bytes;

use crate::iterators::two_merge_iterator::TwoMergeIterator;
use crate::iterators::{merge_iterator::MergeIterator, StorageIterator};
use crate::mem_table::MemTableIterator;
use crate::table::iterator::SsTableIterator;
use crate::iterators::concat_iterator::SstConcatIterator;

type MemIter = MergeIterator<MemTableIterator>;
type L0Iter = MergeIterator<SsTableIterator>;
type LevelsIter = MergeIterator<SstConcatIterator>;

pub type LsmIteratorInner = TwoMergeIterator<MemIter, TwoMergeIterator<L0Iter, LevelsIter>>;

pub struct LsmIterator {
    inner: LsmIteratorInner,
    end_bound: Bound<Bytes>,
    is_valid: bool,
}

impl LsmIterator {
    pub(crate) fn new(iter: LsmIteratorInner, end_bound: Bound<Bytes>) -> Result<Self> {
        let mut iter = Self {
            is_valid: iter.is_valid(),
            inner: iter,
            end_bound,
        };
        iter.move_to_non_delete()?;
        Ok(iter)
    }

    fn next_inner(&mut self) -> Result<()> {
        self.inner.next()?;
        if !self.inner.is_valid() {
            self.is_valid = false;
            return Ok(());
        }
        match self.end_bound.as_ref() {
            Bound::Unbounded => {}
            Bound::Included(key) => self.is_valid = self.inner.key().raw_ref() <= key.as_ref(),
            Bound::Excluded(key) => self.is_valid = self.inner.key().raw_ref() < key.as_ref(),
        }
        Ok(())
    }

    fn move_to_non_delete(&mut self) -> Result<()> {
        while self.is_valid() && self.inner.is_tombstone() {
            self.next_inner()?;
        }
        Ok(())
    }
}

impl StorageIterator for LsmIterator {
    type KeyType<'a> = &'a [u8];

    fn is_valid(&self) -> bool {
        self.is_valid
    }

    fn key(&self) -> &[u8] {
        self.inner.key().raw_ref()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn is_tombstone(&self) -> bool {
        self.inner.is_tombstone()
    }

    fn sequence(&self) -> u64 {
        self.inner.sequence()
    }

    fn next(&mut self) -> anyhow::Result<()> {
        self.next_inner()?;
        self.move_to_non_delete()?;
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        self.inner.number_of_iterators()
    }
}
