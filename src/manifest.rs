//! Manifest (part of C4): an append-only log of structural changes to
//! the LSM tree (new memtable, flush, compaction), replayed on open to
//! reconstruct `LsmStorageState` without rescanning every SSTable file.

use bytes::BufMut;
use parking_lot::{Mutex, MutexGuard};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::Path,
    sync::Arc,
};

use crate::compact::CompactionTask;
use crate::error::{Result, SerengetiError};
use serde::{Deserialize, Serialize};

pub struct Manifest {
    file: Arc<Mutex<File>>,
}

#[derive(Serialize, Deserialize)]
pub enum ManifestRecord {
    Flush(usize),
    NewMemTable(usize),
    Compaction(CompactionTask, Vec<usize>),
}

impl Manifest {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: Arc::new(Mutex::new(
                OpenOptions::new()
                    .read(true)
                    .create_new(true)
                    .write(true)
                    .open(path)?,
            )),
        })
    }

    /// Reads every record from the manifest file, stopping cleanly at a
    /// truncated or checksum-mismatched tail the way the WAL does; any
    /// mismatch before the tail is treated as corruption.
    pub fn recover(path: impl AsRef<Path>) -> Result<(Self, Vec<ManifestRecord>)> {
        let mut file = OpenOptions::new().read(true).append(true).open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let mut records = Vec::new();
        let mut cursor = &buf[..];
        while !cursor.is_empty() {
            if cursor.len() < 8 {
                break;
            }
            let len = u64::from_be_bytes(cursor[..8].try_into().unwrap()) as usize;
            let rest = &cursor[8..];
            if rest.len() < len + 4 {
                break;
            }
            let body = &rest[..len];
            let checksum = u32::from_be_bytes(rest[len..len + 4].try_into().unwrap());
            if crc32fast::hash(body) != checksum {
                if rest.len() == len + 4 {
                    break;
                }
                return Err(SerengetiError::CorruptData(
                    "manifest record checksum mismatch".into(),
                ));
            }
            let record: ManifestRecord = serde_json::from_slice(body)
                .map_err(|e| SerengetiError::CorruptData(e.to_string()))?;
            records.push(record);
            cursor = &rest[len + 4..];
        }
        Ok((
            Self {
                file: Arc::new(Mutex::new(file)),
            },
            records,
        ))
    }

    pub fn add_record(
        &self,
        _state_lock_observer: &MutexGuard<()>,
        record: ManifestRecord,
    ) -> Result<()> {
        self.add_record_when_init(record)
    }

    pub fn add_record_when_init(&self, record: ManifestRecord) -> Result<()> {
        let mut file = self.file.lock();
        let mut buf =
            serde_json::to_vec(&record).map_err(|e| SerengetiError::CorruptData(e.to_string()))?;
        let hash = crc32fast::hash(&buf);
        file.write_all(&(buf.len() as u64).to_be_bytes())?;
        buf.put_u32(hash);
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }
}
