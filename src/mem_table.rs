//! MemTable (C2): the mutable, in-memory component of the LSM tree.
//!
//! Backed by a lock-free skiplist (`crossbeam_skiplist`) as in the
//! teacher's design, keyed by the raw byte key (sequence numbers ride
//! alongside the value, see `key.rs`). A tombstone is a regular entry
//! whose `EntryValue` is `Tombstone`; `get` surfaces it as `None` to
//! callers while `scan`/`flush` still see it so the LSM engine's
//! shadowing rules (§4.4) and compaction's tombstone-dropping rule
//! (§4.4) both work off the same representation.

use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::map::Entry;
use crossbeam_skiplist::SkipMap;
use ouroboros::self_referencing;

use crate::error::Result;
use crate::iterators::StorageIterator;
use crate::key::{KeyBytes, KeySlice};
use crate::table::SsTableBuilder;
use crate::wal::{RecordType, SyncMode, Wal};

/// Tracks which logical lifecycle state a memtable is in (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemTableState {
    Mutable,
    Immutable,
}

/// A stored value, or a tombstone recording a delete, plus the sequence
/// number the write was assigned.
#[derive(Clone)]
pub enum EntryValue {
    Value(Bytes),
    Tombstone,
}

impl EntryValue {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, EntryValue::Tombstone)
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            EntryValue::Value(b) => Some(b),
            EntryValue::Tombstone => None,
        }
    }
}

#[derive(Clone)]
pub struct VersionedEntry {
    pub value: EntryValue,
    pub sequence: u64,
}

pub fn map_bound(bound: Bound<&[u8]>) -> Bound<Bytes> {
    match bound {
        Bound::Included(x) => Bound::Included(Bytes::copy_from_slice(x)),
        Bound::Excluded(x) => Bound::Excluded(Bytes::copy_from_slice(x)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

pub struct MemTable {
    pub(crate) map: Arc<SkipMap<KeyBytes, VersionedEntry>>,
    id: usize,
    approximate_size: Arc<AtomicUsize>,
    state: std::sync::atomic::AtomicU8,
    wal: Option<Wal>,
}

impl MemTable {
    pub fn create(id: usize) -> Self {
        Self {
            id,
            map: Arc::new(SkipMap::new()),
            approximate_size: Arc::new(AtomicUsize::new(0)),
            state: std::sync::atomic::AtomicU8::new(MemTableState::Mutable as u8),
            wal: None,
        }
    }

    pub fn create_with_wal(id: usize, path: impl AsRef<Path>, sync_mode: SyncMode) -> Result<Self> {
        Ok(Self {
            id,
            wal: Some(Wal::create(path, sync_mode, 64 << 20)?),
            ..Self::create(id)
        })
    }

    /// Recover a memtable by replaying its WAL directory, rebuilding the
    /// skiplist entry by entry. Used on engine open when a prior
    /// immutable memtable never finished flushing before a crash.
    pub fn recover_from_wal(id: usize, path: impl AsRef<Path>, sync_mode: SyncMode) -> Result<Self> {
        let map: Arc<SkipMap<KeyBytes, VersionedEntry>> = Arc::new(SkipMap::new());
        let recover_map = map.clone();
        let last_seq = AtomicU64::new(0);
        let wal = Wal::recover(path, sync_mode, 64 << 20, |record| {
            last_seq.fetch_max(record.sequence, Ordering::Relaxed);
            let key = KeyBytes::from_bytes(Bytes::from(record.key.clone()));
            let entry = match record.value {
                Some(v) => VersionedEntry {
                    value: EntryValue::Value(Bytes::from(v)),
                    sequence: record.sequence,
                },
                None => VersionedEntry {
                    value: EntryValue::Tombstone,
                    sequence: record.sequence,
                },
            };
            recover_map.insert(key, entry);
        })?;
        Ok(Self {
            id,
            wal: Some(wal),
            map,
            approximate_size: Arc::new(AtomicUsize::new(0)),
            state: std::sync::atomic::AtomicU8::new(MemTableState::Mutable as u8),
        })
    }

    pub fn get(&self, key: KeySlice) -> Option<VersionedEntry> {
        let key_bytes = KeyBytes::from_bytes(Bytes::copy_from_slice(key.key_ref()));
        self.map.get(&key_bytes).map(|e| e.value().clone())
    }

    pub fn scan(&self, lower: Bound<KeySlice>, upper: Bound<KeySlice>) -> MemTableIterator {
        let lower = map_bound(lower.map(|k| k.key_ref()));
        let upper = map_bound(upper.map(|k| k.key_ref()));
        let lower = lower.map(KeyBytes::from_bytes);
        let upper = upper.map(KeyBytes::from_bytes);
        let mut iter = MemTableIteratorBuilder {
            map: self.map.clone(),
            iter_builder: |map| map.range((lower, upper)),
            item: (KeyBytes::new(), VersionedEntry {
                value: EntryValue::Tombstone,
                sequence: 0,
            }),
        }
        .build();
        let _ = iter.next();
        iter
    }

    pub fn put(&self, key: KeySlice, value: &[u8], sequence: u64) -> Result<()> {
        if let Some(ref wal) = self.wal {
            wal.append(RecordType::Put, key.key_ref(), Some(value))?;
        }
        let estimated_size = key.raw_len() + value.len();
        self.map.insert(
            key.to_key_vec().into_key_bytes(),
            VersionedEntry {
                value: EntryValue::Value(Bytes::copy_from_slice(value)),
                sequence,
            },
        );
        self.approximate_size
            .fetch_add(estimated_size, Ordering::Relaxed);
        Ok(())
    }

    pub fn delete(&self, key: KeySlice, sequence: u64) -> Result<()> {
        if let Some(ref wal) = self.wal {
            wal.append(RecordType::Delete, key.key_ref(), None)?;
        }
        self.map.insert(
            key.to_key_vec().into_key_bytes(),
            VersionedEntry {
                value: EntryValue::Tombstone,
                sequence,
            },
        );
        self.approximate_size
            .fetch_add(key.raw_len(), Ordering::Relaxed);
        Ok(())
    }

    pub fn flush(&self, builder: &mut SsTableBuilder) -> Result<()> {
        for entry in self.map.iter() {
            let bytes = match &entry.value().value {
                EntryValue::Value(v) => v.as_ref(),
                EntryValue::Tombstone => &[][..],
            };
            builder.add(
                entry.key().as_key_slice(),
                bytes,
                entry.value().value.is_tombstone(),
                entry.value().sequence,
            );
        }
        Ok(())
    }

    pub fn sync_wal(&self) -> Result<()> {
        if let Some(ref wal) = self.wal {
            wal.sync()?;
        }
        Ok(())
    }

    pub fn freeze(&self) {
        self.state
            .store(MemTableState::Immutable as u8, Ordering::Release);
    }

    pub fn state(&self) -> MemTableState {
        if self.state.load(Ordering::Acquire) == MemTableState::Mutable as u8 {
            MemTableState::Mutable
        } else {
            MemTableState::Immutable
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }
}

type SkipMapRangeIter<'a> = crossbeam_skiplist::map::Range<
    'a,
    KeyBytes,
    (Bound<KeyBytes>, Bound<KeyBytes>),
    KeyBytes,
    VersionedEntry,
>;

#[self_referencing]
pub struct MemTableIterator {
    map: Arc<SkipMap<KeyBytes, VersionedEntry>>,
    #[borrows(map)]
    #[not_covariant]
    iter: SkipMapRangeIter<'this>,
    item: (KeyBytes, VersionedEntry),
}

impl MemTableIterator {
    fn entry_to_item(entry: Option<Entry<'_, KeyBytes, VersionedEntry>>) -> (KeyBytes, VersionedEntry) {
        entry
            .map(|x| (x.key().clone(), x.value().clone()))
            .unwrap_or_else(|| {
                (
                    KeyBytes::new(),
                    VersionedEntry {
                        value: EntryValue::Tombstone,
                        sequence: 0,
                    },
                )
            })
    }
}

impl StorageIterator for MemTableIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        self.borrow_item().0.as_key_slice()
    }

    fn value(&self) -> &[u8] {
        match &self.borrow_item().1.value {
            EntryValue::Value(v) => v.as_ref(),
            EntryValue::Tombstone => &[],
        }
    }

    fn is_valid(&self) -> bool {
        !self.borrow_item().0.is_empty()
    }

    fn is_tombstone(&self) -> bool {
        self.borrow_item().1.value.is_tombstone()
    }

    fn sequence(&self) -> u64 {
        self.borrow_item().1.sequence
    }

    fn next(&mut self) -> anyhow::Result<()> {
        let entry = self.with_iter_mut(|iter| MemTableIterator::entry_to_item(iter.next()));
        self.with_mut(|x| *x.item = entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let mt = MemTable::create(0);
        mt.put(KeySlice::from_slice(b"k1"), b"v1", 1).unwrap();
        mt.put(KeySlice::from_slice(b"k2"), b"v2", 2).unwrap();
        mt.delete(KeySlice::from_slice(b"k1"), 3).unwrap();

        assert!(mt.get(KeySlice::from_slice(b"k1")).unwrap().value.is_tombstone());
        assert_eq!(
            mt.get(KeySlice::from_slice(b"k2")).unwrap().value.as_bytes().unwrap(),
            &Bytes::from_static(b"v2")
        );
        assert!(mt.get(KeySlice::from_slice(b"k3")).is_none());
    }

    #[test]
    fn recover_from_wal_rebuilds_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mt = MemTable::create_with_wal(0, dir.path(), SyncMode::Sync).unwrap();
            mt.put(KeySlice::from_slice(b"a"), b"1", 1).unwrap();
            mt.delete(KeySlice::from_slice(b"a"), 2).unwrap();
            mt.put(KeySlice::from_slice(b"b"), b"2", 3).unwrap();
        }
        let mt = MemTable::recover_from_wal(1, dir.path(), SyncMode::Sync).unwrap();
        assert!(mt.get(KeySlice::from_slice(b"a")).unwrap().value.is_tombstone());
        assert_eq!(
            mt.get(KeySlice::from_slice(b"b")).unwrap().value.as_bytes().unwrap(),
            &Bytes::from_static(b"2")
        );
    }
}
