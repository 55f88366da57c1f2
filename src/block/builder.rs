use bytes::BufMut;

use super::Block;
use super::SIZEOF_U16;
use crate::key::{KeySlice, KeyVec};

/// Builds a single data block, one key-value(-or-tombstone) entry at a
/// time, prefix-compressing each key against the block's first key.
pub struct BlockBuilder {
    data: Vec<u8>,
    offsets: Vec<u16>,
    block_size: usize,
    first_key: KeyVec,
}

fn common_prefix(first_key: KeySlice, key: KeySlice) -> usize {
    let mut i = 0;
    while i < first_key.len() && i < key.len() && first_key.raw_ref()[i] == key.raw_ref()[i] {
        i += 1;
    }
    i
}

impl BlockBuilder {
    pub fn new(block_size: usize) -> Self {
        Self {
            data: Vec::new(),
            offsets: Vec::new(),
            block_size,
            first_key: KeyVec::new(),
        }
    }

    fn estimated_size(&self) -> usize {
        self.data.len() + self.offsets.len() * SIZEOF_U16 + SIZEOF_U16
    }

    /// Adds an entry. `sequence` is the write's sequence number;
    /// `tombstone` marks a delete (in which case `value` is ignored).
    /// Returns `false` (and leaves the block unchanged) when adding would
    /// exceed `block_size` and the block is already non-empty.
    #[must_use]
    pub fn add(&mut self, key: KeySlice, value: &[u8], tombstone: bool, sequence: u64) -> bool {
        assert!(!key.is_empty(), "key must not be empty");
        let value_len = if tombstone { 0 } else { value.len() };
        let add_on = key.len() + value_len + SIZEOF_U16 * 2 + 1 + 8 + SIZEOF_U16;
        if self.estimated_size() + add_on > self.block_size && !self.is_empty() {
            return false;
        }

        self.offsets.push(self.data.len() as u16);

        let prefix = common_prefix(self.first_key.as_key_slice(), key);
        self.data.put_u16(prefix as u16);
        self.data.put_u16((key.len() - prefix) as u16);
        self.data.put(&key.raw_ref()[prefix..]);
        self.data.put_u8(if tombstone { 1 } else { 0 });
        self.data.put_u64(sequence);
        self.data.put_u16(value_len as u16);
        if !tombstone {
            self.data.put(value);
        }

        if self.first_key.is_empty() {
            self.first_key = key.to_key_vec();
        }

        true
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn build(self) -> Block {
        if self.is_empty() {
            panic!("block should not be empty!")
        }
        Block {
            data: self.data,
            offsets: self.offsets,
        }
    }
}
