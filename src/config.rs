//! Engine- and query-level configuration (A3): plain serde structs with
//! `Default` impls matching spec §6's defaults. This crate only defines
//! and validates the shape; a hosting process reads the TOML/JSON and
//! constructs these.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::EvictionPolicy;
use crate::compact::{CompactionOptions, LeveledCompactionOptions};
use crate::wal::SyncMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for `<db>/<table>/` namespaces.
    pub data_root: String,
    pub memtable_max_bytes: usize,
    pub max_immutable: usize,
    pub block_size: usize,
    pub wal_sync_mode: WalSyncModeConfig,

    pub l0_trigger: usize,
    pub level_size_multiplier: usize,
    pub max_levels: usize,
    pub base_level_size_mb: usize,
    pub compaction_interval_ms: u64,

    pub l1_bytes: u64,
    pub l2_bytes: u64,
    pub eviction_policy: EvictionPolicyConfig,
    pub successor_window: usize,
    pub prefetch_top_k: usize,

    pub total_budget_bytes: u64,
    pub system_reserved_bytes: u64,
    pub query_fraction: f64,
    pub spill_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_root: "./data".to_string(),
            memtable_max_bytes: 2 << 20,
            max_immutable: 2,
            block_size: 4096,
            wal_sync_mode: WalSyncModeConfig::Sync,

            l0_trigger: 4,
            level_size_multiplier: 10,
            max_levels: 4,
            base_level_size_mb: 2,
            compaction_interval_ms: 50,

            l1_bytes: 8 << 20,
            l2_bytes: 64 << 20,
            eviction_policy: EvictionPolicyConfig::Lru,
            successor_window: 8,
            prefetch_top_k: 2,

            total_budget_bytes: 256 << 20,
            system_reserved_bytes: 32 << 20,
            query_fraction: 0.5,
            spill_dir: std::env::temp_dir().to_string_lossy().into_owned(),
        }
    }
}

impl EngineConfig {
    pub fn compaction_options(&self) -> CompactionOptions {
        CompactionOptions::Leveled(LeveledCompactionOptions {
            level_size_multiplier: self.level_size_multiplier,
            level0_files_num_compaction_threshold: self.l0_trigger,
            max_levels: self.max_levels,
            base_level_size_mb: self.base_level_size_mb,
        })
    }

    pub fn cache_config(&self) -> crate::cache::CacheConfig {
        crate::cache::CacheConfig {
            l1_bytes: self.l1_bytes,
            l2_bytes: self.l2_bytes,
            policy: self.eviction_policy.into(),
            successor_window: self.successor_window,
            prefetch_top_k: self.prefetch_top_k,
        }
    }

    pub fn wal_sync_mode(&self) -> SyncMode {
        match self.wal_sync_mode {
            WalSyncModeConfig::Sync => SyncMode::Sync,
            WalSyncModeConfig::Async => SyncMode::Async {
                interval: Duration::from_millis(200),
            },
            WalSyncModeConfig::Group => SyncMode::Group {
                max_batch: 32,
                max_delay: Duration::from_millis(10),
            },
        }
    }

    /// `pool_bytes`, the capacity the buffer pool manages (spec §4.9).
    pub fn pool_bytes(&self) -> u64 {
        self.total_budget_bytes
            .saturating_sub(self.system_reserved_bytes)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncModeConfig {
    Sync,
    Async,
    Group,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicyConfig {
    Lru,
    Lfu,
    Fifo,
}

impl From<EvictionPolicyConfig> for EvictionPolicy {
    fn from(p: EvictionPolicyConfig) -> Self {
        match p {
            EvictionPolicyConfig::Lru => EvictionPolicy::Lru,
            EvictionPolicyConfig::Lfu => EvictionPolicy::Lfu,
            EvictionPolicyConfig::Fifo => EvictionPolicy::Fifo,
        }
    }
}

/// Per-query knobs passed by the query endpoint (spec §4.8/§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_rows_per_chunk: usize,
    pub hash_join_partitions: usize,
    pub query_timeout_ms: u64,
    pub fuzzy_distance_threshold: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_rows_per_chunk: 10_000,
            hash_join_partitions: 16,
            query_timeout_ms: 30_000,
            fuzzy_distance_threshold: crate::query::executor::FUZZY_DISTANCE_THRESHOLD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_bytes_subtracts_reserved() {
        let cfg = EngineConfig::default();
        assert_eq!(
            cfg.pool_bytes(),
            cfg.total_budget_bytes - cfg.system_reserved_bytes
        );
    }
}
