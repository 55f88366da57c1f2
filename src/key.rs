//! Key wrapper types shared by the block, table and memtable layers.
//!
//! Unlike a full MVCC key (which would embed a per-key timestamp so
//! multiple versions can coexist at the same tree position), Serengeti's
//! non-goals exclude multi-statement transactional isolation, so a key is
//! just the user's byte string: strictly increasing sequence numbers live
//! alongside the value in the memtable entry and the SSTable record
//! instead of inside the key itself.

use bytes::Bytes;
use std::cmp::Ordering;

/// A generic key wrapper over any byte-slice-like storage.
#[derive(Debug, Eq, PartialEq, Default)]
pub struct Key<T: AsRef<[u8]>>(T);

pub type KeySlice<'a> = Key<&'a [u8]>;
pub type KeyVec = Key<Vec<u8>>;
pub type KeyBytes = Key<Bytes>;

impl<T: AsRef<[u8]>> Key<T> {
    pub fn into_inner(self) -> T {
        self.0
    }

    pub fn raw_ref(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn key_ref(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn len(&self) -> usize {
        self.0.as_ref().len()
    }

    pub fn raw_len(&self) -> usize {
        self.0.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_ref().is_empty()
    }
}

impl<T: AsRef<[u8]> + Clone> Clone for Key<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: AsRef<[u8]>> Ord for Key<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw_ref().cmp(other.raw_ref())
    }
}

impl<T: AsRef<[u8]>> PartialOrd for Key<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl KeyVec {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_vec(v: Vec<u8>) -> Self {
        Self(v)
    }

    pub fn set_from_slice(&mut self, slice: KeySlice) {
        self.0.clear();
        self.0.extend_from_slice(slice.raw_ref());
    }

    pub fn as_key_slice(&self) -> KeySlice {
        Key(&self.0)
    }

    pub fn to_key_vec(&self) -> KeyVec {
        Key(self.0.clone())
    }

    pub fn into_key_bytes(self) -> KeyBytes {
        Key(Bytes::from(self.0))
    }
}

impl<'a> KeySlice<'a> {
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Key(slice)
    }

    pub fn to_key_vec(self) -> KeyVec {
        Key(self.0.to_vec())
    }
}

impl KeyBytes {
    pub fn new() -> Self {
        Self(Bytes::new())
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn as_key_slice(&self) -> KeySlice {
        Key(self.0.as_ref())
    }
}

impl Default for KeyBytes {
    fn default() -> Self {
        Self::new()
    }
}
