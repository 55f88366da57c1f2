//! Block cache (C5): a two-tier cache in front of SSTable block reads.
//!
//! L1 and L2 are sized independently and each guarded by their own
//! `RwLock` (spec §4.5's "tier-local readers-writer locks"); hit/miss/
//! eviction counters are plain atomics so readers never contend on them.
//! Eviction victim choice is pluggable (LRU/LFU/FIFO); admission keeps
//! oversize or cold entries out of L1 to avoid scan pollution; a small
//! per-key successor window drives best-effort prefetch of the blocks
//! that usually follow a hit.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::block::Block;

pub type BlockKey = (usize, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub l1_bytes: u64,
    pub l2_bytes: u64,
    pub policy: EvictionPolicy,
    pub successor_window: usize,
    pub prefetch_top_k: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_bytes: 8 << 20,
            l2_bytes: 64 << 20,
            policy: EvictionPolicy::Lru,
            successor_window: 8,
            prefetch_top_k: 2,
        }
    }
}

struct Entry {
    block: Arc<Block>,
    size: u64,
    accesses: u64,
}

/// A single tier's storage plus the bookkeeping needed for its eviction
/// policy. `order` tracks insertion/access order for LRU and FIFO; for
/// LFU, victims are simply chosen by lowest `accesses`.
struct Tier {
    capacity: u64,
    used: u64,
    map: HashMap<BlockKey, Entry>,
    order: VecDeque<BlockKey>,
    policy: EvictionPolicy,
}

impl Tier {
    fn new(capacity: u64, policy: EvictionPolicy) -> Self {
        Self {
            capacity,
            used: 0,
            map: HashMap::new(),
            order: VecDeque::new(),
            policy,
        }
    }

    fn touch_order(&mut self, key: BlockKey) {
        if matches!(self.policy, EvictionPolicy::Lru) {
            self.order.retain(|k| *k != key);
            self.order.push_back(key);
        }
    }

    fn get(&mut self, key: &BlockKey) -> Option<Arc<Block>> {
        let found = self.map.get_mut(key).map(|e| {
            e.accesses += 1;
            e.block.clone()
        });
        if found.is_some() {
            self.touch_order(*key);
        }
        found
    }

    fn remove(&mut self, key: &BlockKey) -> Option<Entry> {
        let entry = self.map.remove(key);
        if let Some(e) = &entry {
            self.used -= e.size;
            self.order.retain(|k| k != key);
        }
        entry
    }

    /// Evicts entries until `needed` bytes are free. Returns evicted
    /// (key, entry) pairs so the caller can offer them for demotion.
    fn evict_for(&mut self, needed: u64) -> Vec<(BlockKey, Arc<Block>, u64)> {
        let mut evicted = Vec::new();
        while self.used + needed > self.capacity && !self.map.is_empty() {
            let victim = match self.policy {
                EvictionPolicy::Lru | EvictionPolicy::Fifo => self.order.front().copied(),
                EvictionPolicy::Lfu => self
                    .map
                    .iter()
                    .min_by_key(|(_, e)| e.accesses)
                    .map(|(k, _)| *k),
            };
            let Some(key) = victim else { break };
            if let Some(entry) = self.remove(&key) {
                evicted.push((key, entry.block, entry.accesses));
            }
        }
        evicted
    }

    fn insert(&mut self, key: BlockKey, block: Arc<Block>, size: u64) {
        if self.map.contains_key(&key) {
            return;
        }
        self.evict_for(size);
        if size > self.capacity {
            return;
        }
        self.order.push_back(key);
        self.map.insert(
            key,
            Entry {
                block,
                size,
                accesses: 1,
            },
        );
        self.used += size;
    }
}

#[derive(Default)]
struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Per-key successor tracking for prefetch: the last-N keys seen
/// immediately after each key, used to pick the top-K most frequent
/// successors on a subsequent hit.
struct SuccessorTracker {
    window: usize,
    last_key: Option<BlockKey>,
    successors: HashMap<BlockKey, Vec<BlockKey>>,
}

impl SuccessorTracker {
    fn new(window: usize) -> Self {
        Self {
            window,
            last_key: None,
            successors: HashMap::new(),
        }
    }

    fn record(&mut self, key: BlockKey) {
        if let Some(prev) = self.last_key.replace(key) {
            if prev != key {
                let list = self.successors.entry(prev).or_default();
                list.push(key);
                if list.len() > self.window {
                    list.remove(0);
                }
            }
        }
    }

    fn top_k(&self, key: &BlockKey, k: usize) -> Vec<BlockKey> {
        let Some(list) = self.successors.get(key) else {
            return Vec::new();
        };
        let mut counts: HashMap<BlockKey, usize> = HashMap::new();
        for s in list {
            *counts.entry(*s).or_insert(0) += 1;
        }
        let mut ranked: Vec<_> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.into_iter().take(k).map(|(k, _)| k).collect()
    }
}

/// The cache an `SsTable` consults before reading a block from disk.
/// `prefetch_loader` is supplied by the engine so the cache module
/// stays free of a direct dependency on `table.rs`.
pub struct BlockCache {
    l1: RwLock<Tier>,
    l2: RwLock<Tier>,
    stats: Stats,
    tracker: RwLock<SuccessorTracker>,
    config: CacheConfig,
    prefetch_loader: RwLock<Option<Arc<dyn Fn(BlockKey) -> Option<Arc<Block>> + Send + Sync>>>,
}

fn classify(size: u64, l1_capacity: u64) -> TierTarget {
    if size < l1_capacity / 10 {
        TierTarget::L1
    } else if size <= l1_capacity / 4 {
        TierTarget::L2
    } else {
        TierTarget::None
    }
}

#[derive(PartialEq, Eq)]
enum TierTarget {
    L1,
    L2,
    None,
}

impl BlockCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            l1: RwLock::new(Tier::new(config.l1_bytes, config.policy)),
            l2: RwLock::new(Tier::new(config.l2_bytes, config.policy)),
            stats: Stats::default(),
            tracker: RwLock::new(SuccessorTracker::new(config.successor_window)),
            config,
            prefetch_loader: RwLock::new(None),
        }
    }

    /// Wires a loader the cache can call to satisfy prefetch without
    /// knowing about `SsTable` directly.
    pub fn set_loader(&self, loader: Arc<dyn Fn(BlockKey) -> Option<Arc<Block>> + Send + Sync>) {
        *self.prefetch_loader.write().unwrap() = Some(loader);
    }

    pub fn get(&self, sst_id: usize, block_idx: usize) -> Option<Arc<Block>> {
        let key = (sst_id, block_idx);
        if let Some(block) = self.l1.write().unwrap().get(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.record_and_prefetch(key);
            return Some(block);
        }
        if let Some(block) = self.l2.write().unwrap().get(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.maybe_promote(key, block.clone());
            self.record_and_prefetch(key);
            return Some(block);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn record_and_prefetch(&self, key: BlockKey) {
        let successors = {
            let mut tracker = self.tracker.write().unwrap();
            tracker.record(key);
            tracker.top_k(&key, self.config.prefetch_top_k)
        };
        if successors.is_empty() {
            return;
        }
        let loader = self.prefetch_loader.read().unwrap().clone();
        let Some(loader) = loader else { return };
        for (sst_id, block_idx) in successors {
            if self.contains(sst_id, block_idx) {
                continue;
            }
            if let Some(block) = loader((sst_id, block_idx)) {
                let size = approximate_block_size(&block);
                self.insert(sst_id, block_idx, block, size);
            }
        }
    }

    fn contains(&self, sst_id: usize, block_idx: usize) -> bool {
        let key = (sst_id, block_idx);
        self.l1.read().unwrap().map.contains_key(&key) || self.l2.read().unwrap().map.contains_key(&key)
    }

    /// Promote an L2 hit into L1 when admission allows it (spec §4.5:
    /// require >=2 prior accesses for medium-sized entries).
    fn maybe_promote(&self, key: BlockKey, block: Arc<Block>) {
        let accesses = self
            .l2
            .read()
            .unwrap()
            .map
            .get(&key)
            .map(|e| e.accesses)
            .unwrap_or(0);
        if accesses < 2 {
            return;
        }
        let size = approximate_block_size(&block);
        if size > self.config.l1_bytes / 4 {
            return;
        }
        let evicted = self.l1.write().unwrap().evict_for(size);
        self.demote_evicted(evicted);
        self.l1.write().unwrap().insert(key, block, size);
    }

    pub fn insert(&self, sst_id: usize, block_idx: usize, block: Arc<Block>) {
        let size = approximate_block_size(&block);
        self.insert_inner((sst_id, block_idx), block, size);
    }

    fn insert_inner(&self, key: BlockKey, block: Arc<Block>, size: u64) {
        match classify(size, self.config.l1_bytes) {
            TierTarget::L1 => {
                if size > self.config.l1_bytes / 4 {
                    // oversize for L1 admission, fall through to L2
                    self.insert_into_l2(key, block, size);
                    return;
                }
                let evicted = self.l1.write().unwrap().evict_for(size);
                self.demote_evicted(evicted);
                self.l1.write().unwrap().insert(key, block, size);
            }
            TierTarget::L2 => self.insert_into_l2(key, block, size),
            TierTarget::None => {}
        }
    }

    fn insert_into_l2(&self, key: BlockKey, block: Arc<Block>, size: u64) {
        if size > self.config.l2_bytes {
            return;
        }
        self.l2.write().unwrap().insert(key, block, size);
    }

    /// L1 victims demote into L2 once they have earned enough accesses
    /// to be worth keeping around at all (spec §4.5).
    fn demote_evicted(&self, evicted: Vec<(BlockKey, Arc<Block>, u64)>) {
        self.stats
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for (key, block, accesses) in evicted {
            if accesses >= 2 {
                let size = approximate_block_size(&block);
                self.insert_into_l2(key, block, size);
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.stats.hits.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.stats.misses.load(Ordering::Relaxed)
    }
    pub fn evictions(&self) -> u64 {
        self.stats.evictions.load(Ordering::Relaxed)
    }
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

fn approximate_block_size(block: &Block) -> u64 {
    (block.data.len() + block.offsets.len() * 2) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: usize) -> Arc<Block> {
        Arc::new(Block {
            data: vec![0u8; n],
            offsets: vec![0],
        })
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let cache = BlockCache::new(CacheConfig::default());
        cache.insert(1, 0, block(16));
        assert!(cache.get(1, 0).is_some());
        assert_eq!(cache.hits(), 1);
        assert!(cache.get(1, 1).is_none());
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn oversize_entry_bypasses_cache() {
        let cfg = CacheConfig {
            l1_bytes: 64,
            l2_bytes: 64,
            ..CacheConfig::default()
        };
        let cache = BlockCache::new(cfg);
        cache.insert(1, 0, block(1000));
        assert!(cache.get(1, 0).is_none());
    }

    #[test]
    fn eviction_frees_room_for_new_entries() {
        let cfg = CacheConfig {
            l1_bytes: 64,
            l2_bytes: 64,
            policy: EvictionPolicy::Fifo,
            ..CacheConfig::default()
        };
        let cache = BlockCache::new(cfg);
        cache.insert(1, 0, block(4));
        cache.insert(1, 1, block(4));
        for i in 2..40 {
            cache.insert(1, i, block(4));
        }
        assert!(cache.evictions() > 0);
    }
}
