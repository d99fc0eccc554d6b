//! Sharded in-memory key space with logical versioning, TTL, and
//! memory-budgeted LRU eviction.
//!
//! Locking is two-level: a store-wide rebalance lock whose shared mode
//! admits any per-shard operation and whose exclusive mode (restore,
//! rebalance) excludes all of them, then one reader/writer lock per shard
//! guarding its map and recency list together. The only cross-lock order is
//! rebalance-shared then shard, never the reverse.

mod shard;

use self::shard::Shard;
use crate::metrics::Metrics;
use ahash::RandomState;
use parking_lot::RwLock;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Frozen form of one entry, used on disk and on the wire between snapshot
/// write and load. `expire_at` is converted to a residual TTL at
/// serialization time.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotItem {
    pub key: String,
    pub value: String,
    pub version: u64,
    pub expire_at: Option<Instant>,
}

pub struct ShardedStore {
    /// Outer lock doubles as the rebalance lock: shared for normal
    /// operations, exclusive only in `restore` and `rebalance`.
    shards: RwLock<Vec<Shard>>,
    hash_state: RandomState,
    version: AtomicU64,
    memory_used: AtomicU64,
    memory_budget: u64,
    metrics: Arc<Metrics>,
}

impl ShardedStore {
    pub fn new(shard_count: u32, memory_budget: u64, metrics: Arc<Metrics>) -> Self {
        let shard_count = shard_count.max(1) as usize;
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Shard::new());
        }
        ShardedStore {
            shards: RwLock::new(shards),
            hash_state: RandomState::new(),
            version: AtomicU64::new(0),
            memory_used: AtomicU64::new(0),
            memory_budget,
            metrics,
        }
    }

    /// Stable within the process lifetime; the keyed state lives on the
    /// store so rebalance rehashes every key the same way.
    fn shard_index(&self, key: &str, shard_count: usize) -> usize {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key.as_bytes());
        (hasher.finish() as usize) % shard_count
    }

    /// Fetches `key`, optionally pinned to a historical logical version.
    ///
    /// Reads take only shared locks and never promote the entry in the
    /// recency list.
    pub fn get(&self, key: &str, snapshot_version: Option<u64>) -> Option<String> {
        let shards = self.shards.read();
        let shard = &shards[self.shard_index(key, shards.len())];
        let inner = shard.inner.read();
        let node = inner.get(key)?;
        if let Some(bound) = snapshot_version {
            if node.version > bound {
                return None;
            }
        }
        if node.is_expired(Instant::now()) {
            return None;
        }
        Some(node.value.clone())
    }

    /// Upserts `key`, assigning the next logical version and moving the key
    /// to the MRU position. Budget enforcement runs after the shard lock is
    /// released.
    pub fn put(&self, key: &str, value: String, ttl_seconds: Option<u64>) {
        let expire_at = ttl_seconds.map(|ttl| Instant::now() + Duration::from_secs(ttl));
        let size = (key.len() + value.len()) as u64;
        {
            let shards = self.shards.read();
            let shard = &shards[self.shard_index(key, shards.len())];
            let mut inner = shard.inner.write();
            let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(old_size) = inner.upsert(key, value, version, expire_at) {
                self.memory_used.fetch_sub(old_size as u64, Ordering::Relaxed);
            }
            self.memory_used.fetch_add(size, Ordering::Relaxed);
        }
        self.enforce_memory_budget();
    }

    /// Removes `key`. Returns whether an entry was actually removed.
    pub fn del(&self, key: &str) -> bool {
        let shards = self.shards.read();
        let shard = &shards[self.shard_index(key, shards.len())];
        let mut inner = shard.inner.write();
        match inner.remove(key) {
            Some(size) => {
                self.memory_used.fetch_sub(size as u64, Ordering::Relaxed);
                self.metrics.set_memory_bytes(self.memory_used.load(Ordering::Relaxed));
                true
            }
            None => false,
        }
    }

    /// Scans every shard and drops entries whose deadline has passed.
    /// Invoked periodically by the expirer thread. Returns the number of
    /// entries removed.
    pub fn expire_keys(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        {
            let shards = self.shards.read();
            for shard in shards.iter() {
                let mut inner = shard.inner.write();
                let (count, freed) = inner.remove_expired(now);
                removed += count;
                if freed > 0 {
                    self.memory_used.fetch_sub(freed, Ordering::Relaxed);
                }
            }
        }
        if removed > 0 {
            debug!(removed, "expired entries swept");
            self.metrics.set_memory_bytes(self.memory_used.load(Ordering::Relaxed));
        }
        removed
    }

    /// Evicts LRU tails until aggregate memory fits the budget.
    ///
    /// Victim selection scans shards in index order and drains the first
    /// non-empty one; a shard full of cold keys empties before later shards
    /// are touched. Best-effort: if nothing is left to evict the loop exits
    /// with memory still above budget.
    pub fn enforce_memory_budget(&self) {
        loop {
            if self.memory_used.load(Ordering::Relaxed) <= self.memory_budget {
                break;
            }
            let shards = self.shards.read();
            let newest = self.version.load(Ordering::Relaxed);
            let mut evicted = false;
            for shard in shards.iter() {
                let mut inner = shard.inner.write();
                // The newest write is never the victim. A tail only carries
                // the top version when it is its shard's sole entry, so a
                // single value larger than the whole budget stays resident
                // with memory above budget.
                if inner.peek_lru().is_some_and(|node| node.version == newest) {
                    continue;
                }
                if let Some(size) = inner.pop_lru() {
                    self.memory_used.fetch_sub(size as u64, Ordering::Relaxed);
                    self.metrics.record_eviction();
                    evicted = true;
                    break;
                }
            }
            if !evicted {
                break;
            }
        }
        self.metrics.set_memory_bytes(self.memory_used.load(Ordering::Relaxed));
    }

    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn memory_usage(&self) -> u64 {
        self.memory_used.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        let shards = self.shards.read();
        shards.iter().map(|s| s.inner.read().len()).sum()
    }

    /// Collects every live entry with `entry.version <= version`.
    ///
    /// Each shard is scanned under its own shared lock, so the result is
    /// consistent per shard but not a global atomic cut; WAL replay fills in
    /// anything a later shard committed mid-scan. Entries that have already
    /// expired are skipped.
    pub fn snapshot(&self, version: u64) -> Vec<SnapshotItem> {
        let now = Instant::now();
        let shards = self.shards.read();
        let mut items = Vec::new();
        for shard in shards.iter() {
            let inner = shard.inner.read();
            for node in inner.iter_nodes() {
                if node.version <= version && !node.is_expired(now) {
                    items.push(SnapshotItem {
                        key: node.key.clone(),
                        value: node.value.clone(),
                        version: node.version,
                        expire_at: node.expire_at,
                    });
                }
            }
        }
        items
    }

    /// Bulk-loads snapshot items, overwriting existing keys and bumping the
    /// global version to cover every restored entry. Holds the rebalance
    /// lock exclusively for the duration.
    pub fn restore(&self, items: Vec<SnapshotItem>) {
        {
            let shards = self.shards.write();
            for item in items {
                let shard = &shards[self.shard_index(&item.key, shards.len())];
                let mut inner = shard.inner.write();
                let size = (item.key.len() + item.value.len()) as u64;
                if let Some(old_size) =
                    inner.upsert(&item.key, item.value, item.version, item.expire_at)
                {
                    self.memory_used.fetch_sub(old_size as u64, Ordering::Relaxed);
                }
                self.memory_used.fetch_add(size, Ordering::Relaxed);
                self.version.fetch_max(item.version, Ordering::Relaxed);
            }
        }
        self.enforce_memory_budget();
    }

    /// Resizes the shard array, relocating every entry under the new
    /// modulus. Halts the store for the duration; a no-op for zero or the
    /// current count. Values never change, so memory accounting is
    /// untouched.
    pub fn rebalance(&self, new_shard_count: u32) {
        let mut shards = self.shards.write();
        let new_count = new_shard_count as usize;
        if new_count == 0 || new_count == shards.len() {
            return;
        }
        let mut new_shards = Vec::with_capacity(new_count);
        for _ in 0..new_count {
            new_shards.push(Shard::new());
        }
        let mut moved = 0usize;
        for shard in shards.iter() {
            let mut inner = shard.inner.write();
            for node in inner.drain_nodes() {
                let target = &new_shards[self.shard_index(&node.key, new_count)];
                target.inner.write().adopt(node);
                moved += 1;
            }
        }
        debug!(shards = new_count, moved, "shard array rebalanced");
        *shards = new_shards;
    }
}
