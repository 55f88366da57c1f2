use bytes::Buf;

use crate::key::{KeySlice, KeyVec};
use std::sync::Arc;

use super::Block;

/// Layout per entry (see `builder.rs`): `common_prefix_len(u16) |
/// rest_len(u16) | rest_key | tombstone(u8) | sequence(u64) |
/// value_len(u16) | value?`.
pub struct BlockIterator {
    block: Arc<Block>,
    key: KeyVec,
    first_key: KeyVec,
    value_range: (usize, usize),
    idx: usize,
    tombstone: bool,
    sequence: u64,
}

impl Block {
    fn get_first_key(&self) -> KeyVec {
        let mut buf = &self.data[..];
        buf.get_u16();
        let key_len = buf.get_u16();
        let key = &buf[..key_len as usize];
        KeyVec::from_vec(key.to_vec())
    }
}

impl BlockIterator {
    fn new(block: Arc<Block>) -> Self {
        Self {
            first_key: block.get_first_key(),
            key: KeyVec::new(),
            block,
            value_range: (0, 0),
            idx: 0,
            tombstone: false,
            sequence: 0,
        }
    }

    pub fn create_and_seek_to_first(block: Arc<Block>) -> Self {
        let mut iter = Self::new(block);
        iter.seek_to_first();
        iter
    }

    pub fn create_and_seek_to_key(block: Arc<Block>, key: KeySlice) -> Self {
        let mut iter = Self::new(block);
        iter.seek_to_key(key);
        iter
    }

    pub fn key(&self) -> KeySlice {
        self.key.as_key_slice()
    }

    pub fn value(&self) -> &[u8] {
        &self.block.data[self.value_range.0..self.value_range.1]
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_valid(&self) -> bool {
        !self.key.is_empty()
    }

    pub fn seek_to_first(&mut self) {
        self.seek_to(0);
    }

    fn seek_to(&mut self, idx: usize) {
        if idx >= self.block.offsets.len() {
            self.key = KeyVec::new();
            self.value_range = (0, 0);
            return;
        }
        let offset = self.block.offsets[idx] as usize;
        self.seek_to_offset(offset);
        self.idx = idx;
    }

    fn seek_to_offset(&mut self, offset: usize) {
        let mut entry = &self.block.data[offset..];
        let prefix_len = entry.get_u16() as usize;
        let rest_len = entry.get_u16() as usize;
        let rest_start = offset + 2 + 2;
        let rest = &self.block.data[rest_start..rest_start + rest_len];
        let mut key = Vec::with_capacity(prefix_len + rest_len);
        key.extend_from_slice(&self.first_key.raw_ref()[..prefix_len]);
        key.extend_from_slice(rest);
        self.key = KeyVec::from_vec(key);

        let mut tail = &self.block.data[rest_start + rest_len..];
        let tombstone = tail.get_u8() == 1;
        let sequence = tail.get_u64();
        let value_len = tail.get_u16() as usize;
        let value_start = rest_start + rest_len + 1 + 8 + 2;
        self.tombstone = tombstone;
        self.sequence = sequence;
        self.value_range = (value_start, value_start + value_len);
    }

    /// Find the first entry with key >= `key` (greater-or-equal seek).
    pub fn seek_to_key(&mut self, key: KeySlice) {
        let mut lo = 0;
        let mut hi = self.block.offsets.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            self.seek_to(mid);
            assert!(self.is_valid());
            match self.key().cmp(&key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Equal => return,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        self.seek_to(lo);
    }

    pub fn next(&mut self) {
        self.idx += 1;
        self.seek_to(self.idx);
    }
}
