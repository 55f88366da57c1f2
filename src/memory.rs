//! Per-query memory budgeting (C9, spec §4.9/SPEC_FULL §12).
//!
//! A single [`MemoryManager`] owns the whole buffer pool. Each active
//! query gets a budget of `pool_bytes / (active_queries + 1)`; an
//! operator asks for bytes as it grows (a hash table, a sort buffer)
//! and gets told to spill or fail once its query's share is exhausted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use uuid::Uuid;

pub type QueryId = Uuid;
pub type OperatorId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocOutcome {
    Granted,
    /// The operator should spill before retrying; it remains registered.
    SpillRequested,
    OutOfMemory,
}

/// Hook an operator registers so the manager can ask it to spill under
/// pressure. `db.rs`'s spill operators implement this; the manager
/// never constructs one itself.
pub trait Spillable: Send {
    /// Spills as much resident state as possible, returning bytes freed.
    fn spill(&mut self) -> crate::error::Result<u64>;
}

struct QueryAccount {
    used: u64,
    per_op: HashMap<OperatorId, u64>,
    spillers: HashMap<OperatorId, Box<dyn Spillable>>,
}

impl QueryAccount {
    fn new() -> Self {
        Self { used: 0, per_op: HashMap::new(), spillers: HashMap::new() }
    }
}

pub struct MemoryManager {
    pool_bytes: u64,
    used: AtomicU64,
    active_queries: AtomicUsize,
    accounts: Mutex<HashMap<QueryId, QueryAccount>>,
}

impl MemoryManager {
    pub fn new(pool_bytes: u64) -> Self {
        Self {
            pool_bytes,
            used: AtomicU64::new(0),
            active_queries: AtomicUsize::new(0),
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a query so it counts toward the active-query divisor;
    /// call once per query before its first `allocate`.
    pub fn begin_query(&self, query: QueryId) {
        let mut accounts = self.accounts.lock().unwrap();
        accounts.entry(query).or_insert_with(QueryAccount::new);
        self.active_queries.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases every byte and spill hook the query held.
    pub fn release_query(&self, query: QueryId) {
        let mut accounts = self.accounts.lock().unwrap();
        if let Some(acct) = accounts.remove(&query) {
            self.used.fetch_sub(acct.used, Ordering::AcqRel);
            self.active_queries.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Registers `op`'s spill hook. Per SPEC_FULL §12 this must be
    /// called right after the operator is constructed, before it
    /// processes any row, so a later `allocate` always has somewhere
    /// to ask for relief.
    pub fn register_spill(&self, query: QueryId, op: OperatorId, spillable: Box<dyn Spillable>) {
        let mut accounts = self.accounts.lock().unwrap();
        let acct = accounts.entry(query).or_insert_with(QueryAccount::new);
        acct.spillers.insert(op, spillable);
    }

    fn query_budget(&self) -> u64 {
        let active = self.active_queries.load(Ordering::Acquire).max(0) as u64;
        self.pool_bytes / (active + 1)
    }

    /// Requests `bytes` more for `op` within `query`'s budget. Returns
    /// `SpillRequested` (without granting) when the query's share is
    /// exhausted but the operator has a registered spiller; the caller
    /// is expected to call that spiller and retry. Returns
    /// `OutOfMemory` when no spiller is registered or the whole pool
    /// is exhausted.
    pub fn allocate(&self, query: QueryId, op: OperatorId, bytes: u64) -> AllocOutcome {
        let budget = self.query_budget();
        let mut accounts = self.accounts.lock().unwrap();
        let acct = accounts.entry(query).or_insert_with(QueryAccount::new);

        if acct.used + bytes > budget {
            return if acct.spillers.contains_key(&op) {
                AllocOutcome::SpillRequested
            } else {
                AllocOutcome::OutOfMemory
            };
        }
        if self.used.load(Ordering::Acquire) + bytes > self.pool_bytes {
            return if acct.spillers.contains_key(&op) {
                AllocOutcome::SpillRequested
            } else {
                AllocOutcome::OutOfMemory
            };
        }

        *acct.per_op.entry(op).or_insert(0) += bytes;
        acct.used += bytes;
        self.used.fetch_add(bytes, Ordering::AcqRel);
        AllocOutcome::Granted
    }

    /// Invokes `op`'s registered spiller, reconciling the freed bytes
    /// against both the query's and the pool's counters.
    pub fn spill(&self, query: QueryId, op: OperatorId) -> crate::error::Result<u64> {
        let mut accounts = self.accounts.lock().unwrap();
        let Some(acct) = accounts.get_mut(&query) else {
            return Ok(0);
        };
        let Some(spiller) = acct.spillers.get_mut(&op) else {
            return Ok(0);
        };
        let freed = spiller.spill()?;
        if freed > 0 {
            let op_used = acct.per_op.entry(op).or_insert(0);
            let freed = freed.min(*op_used);
            *op_used -= freed;
            acct.used = acct.used.saturating_sub(freed);
            self.used.fetch_sub(freed, Ordering::AcqRel);
        }
        Ok(freed)
    }

    /// Frees `op`'s own accounted bytes without calling its spiller
    /// (used once the operator finishes and drops its buffers).
    pub fn free(&self, query: QueryId, op: OperatorId) {
        let mut accounts = self.accounts.lock().unwrap();
        if let Some(acct) = accounts.get_mut(&query) {
            if let Some(bytes) = acct.per_op.remove(&op) {
                acct.used = acct.used.saturating_sub(bytes);
                self.used.fetch_sub(bytes, Ordering::AcqRel);
            }
            acct.spillers.remove(&op);
        }
    }

    pub fn pool_bytes(&self) -> u64 {
        self.pool_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopSpiller;
    impl Spillable for NoopSpiller {
        fn spill(&mut self) -> crate::error::Result<u64> {
            Ok(64)
        }
    }

    #[test]
    fn budget_shrinks_as_queries_join() {
        let mgr = MemoryManager::new(1000);
        let q1 = Uuid::new_v4();
        mgr.begin_query(q1);
        assert_eq!(mgr.query_budget(), 500);
        let q2 = Uuid::new_v4();
        mgr.begin_query(q2);
        assert_eq!(mgr.query_budget(), 1000 / 3);
    }

    #[test]
    fn allocate_past_budget_without_spiller_is_oom() {
        let mgr = MemoryManager::new(100);
        let q = Uuid::new_v4();
        mgr.begin_query(q);
        assert_eq!(mgr.allocate(q, 1, 200), AllocOutcome::OutOfMemory);
    }

    #[test]
    fn allocate_past_budget_with_spiller_requests_spill() {
        let mgr = MemoryManager::new(100);
        let q = Uuid::new_v4();
        mgr.begin_query(q);
        mgr.register_spill(q, 1, Box::new(NoopSpiller));
        assert_eq!(mgr.allocate(q, 1, 200), AllocOutcome::SpillRequested);
        let freed = mgr.spill(q, 1).unwrap();
        assert_eq!(freed, 64);
    }

    #[test]
    fn release_query_clears_its_usage() {
        let mgr = MemoryManager::new(100);
        let q = Uuid::new_v4();
        mgr.begin_query(q);
        mgr.allocate(q, 1, 50);
        assert_eq!(mgr.used_bytes(), 50);
        mgr.release_query(q);
        assert_eq!(mgr.used_bytes(), 0);
    }
}
