#![allow(unused)]

use crate::{
    block::builder::BlockBuilder,
    cache::BlockCache,
    key::{Key, KeySlice, KeyVec},
};
use crate::error::Result;
use bytes::BufMut;

use super::{bloom::Bloom, BlockMeta, FileObject, SsTable};
use std::{path::Path, sync::Arc};

/// Builds an SsTable from key-value pairs, in sorted order, one entry
/// at a time.
pub struct SsTableBuilder {
    builder: BlockBuilder,
    block_size: usize,
    first_key: KeyVec,
    last_key: KeyVec,
    data: Vec<u8>,
    pub(crate) meta: Vec<BlockMeta>,
    key_hashes: Vec<u32>,
    entry_count: usize,
}

impl SsTableBuilder {
    pub fn new(block_size: usize) -> Self {
        Self {
            builder: BlockBuilder::new(block_size),
            block_size,
            first_key: KeyVec::new(),
            last_key: KeyVec::new(),
            data: Vec::new(),
            meta: Vec::new(),
            key_hashes: Vec::new(),
            entry_count: 0,
        }
    }

    /// Adds a key plus either a value or a tombstone, at the given
    /// write sequence number. Entries must be added in ascending key
    /// order (callers merge-iterate before calling this).
    pub fn add(&mut self, key: KeySlice, value: &[u8], tombstone: bool, sequence: u64) {
        if self.first_key.is_empty() {
            self.first_key.set_from_slice(key);
        }

        self.key_hashes.push(farmhash::fingerprint32(key.key_ref()));
        self.entry_count += 1;

        if self.builder.add(key, value, tombstone, sequence) {
            self.last_key.set_from_slice(key);
            return;
        }

        self.finish_block();

        assert!(self.builder.add(key, value, tombstone, sequence));
        self.first_key.set_from_slice(key);
        self.last_key.set_from_slice(key);
    }

    /// Builds the SSTable and writes it to the given path. `level` is
    /// the level the resulting table is being placed at.
    pub fn build(
        mut self,
        id: usize,
        level: usize,
        block_cache: Option<Arc<BlockCache>>,
        path: impl AsRef<Path>,
    ) -> Result<SsTable> {
        if !self.builder.is_empty() {
            self.finish_block();
        }
        let mut buf = self.data;
        let meta_offset = buf.len();
        BlockMeta::encode_block_meta(&self.meta, &mut buf);
        buf.put_u32(meta_offset as u32);
        let bloom = Bloom::build_from_key_hashes(
            &self.key_hashes,
            Bloom::bloom_bits_per_key(self.key_hashes.len().max(1), 0.01),
        );
        let bloom_offset = buf.len();
        bloom.encode(&mut buf);
        buf.put_u32(self.entry_count as u32);
        buf.put_u32(level as u32);
        buf.put_u32(bloom_offset as u32);
        let file = FileObject::create(path.as_ref(), buf)?;
        SsTable::open(id, block_cache, file)
    }

    pub fn estimate_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.builder.is_empty()
    }

    fn finish_block(&mut self) {
        let builder = std::mem::replace(&mut self.builder, BlockBuilder::new(self.block_size));
        let encoded_block = builder.build().encode();
        self.meta.push(BlockMeta {
            offset: self.data.len(),
            first_key: std::mem::take(&mut self.first_key).into_key_bytes(),
            last_key: std::mem::take(&mut self.last_key).into_key_bytes(),
        });
        let checksum = crc32fast::hash(&encoded_block);
        self.data.extend(encoded_block);
        self.data.put_u32(checksum);
    }

    #[cfg(test)]
    pub(crate) fn build_for_test(self, path: impl AsRef<Path>) -> Result<SsTable> {
        self.build(0, 0, None, path)
    }
}
