//! Spill-to-disk operators for queries that outgrow their memory budget
//! (C10, spec §4.10): an external merge sort and a partitioned hash
//! join, both driven by [`crate::memory::MemoryManager`].

pub mod hash_join;
pub mod sort;

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::memory::{OperatorId, QueryId};

/// Spill files are named `spill_<query>_<op>_<uuid>.tmp` so concurrent
/// queries and repeated operators in the same query never collide.
pub fn spill_path(dir: &Path, query: QueryId, op: OperatorId) -> PathBuf {
    dir.join(format!("spill_{query}_{op}_{}.tmp", Uuid::new_v4()))
}

fn io_err(e: std::io::Error) -> crate::error::SerengetiError {
    crate::error::SerengetiError::Spill(e.to_string())
}

fn encode_err(e: impl std::fmt::Display) -> crate::error::SerengetiError {
    crate::error::SerengetiError::Spill(e.to_string())
}
