//! SSTable (C3): an immutable, sorted on-disk run produced by flush or
//! compaction. Layout: data blocks, a block-meta index (first/last key
//! per block plus its offset), a bloom filter over the key set, and a
//! footer recording both offsets plus the level, min/max key and entry
//! count (spec §3).

pub(crate) mod bloom;
pub(crate) mod builder;
pub mod iterator;

use self::bloom::Bloom;
use crate::cache::BlockCache;
use crate::error::{Result, SerengetiError};
use crate::key::KeyBytes;
use bytes::{Buf, BufMut};
use std::{fs::File, io::Read as _, path::Path, sync::Arc};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    pub offset: usize,
    pub first_key: KeyBytes,
    pub last_key: KeyBytes,
}

impl BlockMeta {
    pub fn encode_block_meta(block_meta: &[BlockMeta], buf: &mut Vec<u8>) {
        let mut estimated_size = std::mem::size_of::<u32>();
        for meta in block_meta {
            estimated_size += std::mem::size_of::<u32>();
            estimated_size += std::mem::size_of::<u16>() + meta.first_key.len();
            estimated_size += std::mem::size_of::<u16>() + meta.last_key.len();
        }
        estimated_size += std::mem::size_of::<u32>();

        buf.reserve(estimated_size);
        let original_len = buf.len();
        buf.put_u32(block_meta.len() as u32);

        for meta in block_meta {
            buf.put_u32(meta.offset as u32);
            buf.put_u16(meta.first_key.len() as u16);
            buf.put_slice(meta.first_key.raw_ref());
            buf.put_u16(meta.last_key.len() as u16);
            buf.put_slice(meta.last_key.raw_ref());
        }
        buf.put_u32(crc32fast::hash(&buf[original_len + 4..]));
    }

    pub fn decode_block_meta(mut buf: &[u8]) -> Result<Vec<BlockMeta>> {
        let mut block_meta = Vec::new();
        let num = buf.get_u32() as usize;
        let checksum = crc32fast::hash(&buf[..buf.remaining() - 4]);
        for _ in 0..num {
            let offset = buf.get_u32() as usize;
            let first_key_len = buf.get_u16() as usize;
            let first_key = KeyBytes::from_bytes(buf.copy_to_bytes(first_key_len));
            let last_key_len: usize = buf.get_u16() as usize;
            let last_key = KeyBytes::from_bytes(buf.copy_to_bytes(last_key_len));
            block_meta.push(BlockMeta {
                offset,
                first_key,
                last_key,
            });
        }
        if buf.get_u32() != checksum {
            return Err(SerengetiError::CorruptData(
                "block meta checksum mismatch".into(),
            ));
        }
        Ok(block_meta)
    }
}

pub struct FileObject(Option<File>, u64);

impl FileObject {
    pub fn create(path: &Path, data: Vec<u8>) -> Result<Self> {
        std::fs::write(path, &data)?;
        File::open(path)?.sync_all()?;
        Ok(FileObject(
            Some(File::options().read(true).write(false).open(path)?),
            data.len() as u64,
        ))
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options().read(true).write(false).open(path)?;
        let size = file.metadata()?.len();
        Ok(FileObject(Some(file), size))
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let mut data = vec![0; len as usize];
        self.0
            .as_ref()
            .unwrap()
            .read_exact_at(&mut data[..], offset)?;
        Ok(data)
    }

    pub fn size(&self) -> u64 {
        self.1
    }
}

/// Footer fields persisted after the bloom filter: block-meta offset,
/// bloom offset, level, entry count. (min/max key are already recoverable
/// from the first/last block-meta entry, so they are not duplicated on
/// disk; `first_key`/`last_key` accessors below serve that role.)
pub struct SsTable {
    pub(crate) file: FileObject,
    pub(crate) block_meta: Vec<BlockMeta>,
    pub(crate) block_meta_offset: usize,
    id: usize,
    block_cache: Option<Arc<BlockCache>>,
    first_key: KeyBytes,
    last_key: KeyBytes,
    pub(crate) bloom: Option<Bloom>,
    level: usize,
    entry_count: usize,
}

impl SsTable {
    pub fn open(
        id: usize,
        block_cache: Option<Arc<BlockCache>>,
        file: FileObject,
    ) -> Result<Self> {
        let len = file.size();
        if len < 4 + 4 + 4 + 4 + 4 {
            return Err(SerengetiError::CorruptData(format!(
                "sstable {id} footer too small"
            )));
        }
        let raw_footer_tail = file.read(len - 12, 12)?;
        let mut tail = &raw_footer_tail[..];
        let entry_count = tail.get_u32() as usize;
        let level = tail.get_u32() as usize;
        let bloom_offset = tail.get_u32() as u64;

        let raw_bloom = file.read(bloom_offset, len - 12 - bloom_offset)?;
        let bloom_filter = Bloom::decode(&raw_bloom)?;

        let raw_meta_offset = file.read(bloom_offset - 4, 4)?;
        let block_meta_offset = (&raw_meta_offset[..]).get_u32() as u64;
        let raw_meta = file.read(block_meta_offset, bloom_offset - 4 - block_meta_offset)?;
        let block_meta = BlockMeta::decode_block_meta(&raw_meta[..])?;
        if block_meta.is_empty() {
            return Err(SerengetiError::CorruptData(format!(
                "sstable {id} has no blocks"
            )));
        }
        Ok(Self {
            file,
            first_key: block_meta.first().unwrap().first_key.clone(),
            last_key: block_meta.last().unwrap().last_key.clone(),
            block_meta,
            block_meta_offset: block_meta_offset as usize,
            id,
            block_cache,
            bloom: Some(bloom_filter),
            level,
            entry_count,
        })
    }

    pub fn first_key(&self) -> &KeyBytes {
        &self.first_key
    }
    pub fn last_key(&self) -> &KeyBytes {
        &self.last_key
    }
    pub fn num_of_blocks(&self) -> usize {
        self.block_meta.len()
    }
    pub fn table_size(&self) -> u64 {
        self.file.1
    }
    pub fn sst_id(&self) -> usize {
        self.id
    }
    pub fn level(&self) -> usize {
        self.level
    }
    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Locate the index of the block that may contain `key`, by
    /// binary-searching the first-key of every block.
    pub fn find_block_idx(&self, key: crate::key::KeySlice) -> usize {
        self.block_meta
            .partition_point(|meta| meta.first_key.as_key_slice() <= key)
            .saturating_sub(1)
    }

    fn read_block(&self, block_idx: usize) -> Result<Arc<crate::block::Block>> {
        let offset = self.block_meta[block_idx].offset;
        let offset_end = self
            .block_meta
            .get(block_idx + 1)
            .map_or(self.block_meta_offset, |x| x.offset);
        let block_len = offset_end - offset - 4;
        let raw = self.file.read(offset as u64, (offset_end - offset) as u64)?;
        let block_data = &raw[..block_len];
        let checksum = (&raw[block_len..]).get_u32();
        if crc32fast::hash(block_data) != checksum {
            return Err(SerengetiError::CorruptData(format!(
                "block checksum mismatch in sstable {} block {}",
                self.id, block_idx
            )));
        }
        Ok(Arc::new(crate::block::Block::decode(block_data)))
    }

    /// Read a block, consulting and populating the block cache if present.
    pub fn read_block_cached(&self, block_idx: usize) -> Result<Arc<crate::block::Block>> {
        if let Some(cache) = &self.block_cache {
            if let Some(block) = cache.get(self.id, block_idx) {
                return Ok(block);
            }
            let block = self.read_block(block_idx)?;
            cache.insert(self.id, block_idx, block.clone());
            Ok(block)
        } else {
            self.read_block(block_idx)
        }
    }

    /// Whether `key` could possibly be present, per the bloom filter.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        match &self.bloom {
            Some(bloom) => bloom.may_contain(farmhash::fingerprint32(key)),
            None => true,
        }
    }
}

pub use builder::SsTableBuilder;
pub use iterator::SsTableIterator;

// used by FileObject::read to surface crc32 errors in one place
#[allow(unused_imports)]
use std::io::Read;
