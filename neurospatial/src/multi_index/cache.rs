//! Bounded-memory sub-tree cache with usage-aware eviction.
//!
//! The cache keeps loaded sub-trees keyed by id and evicts the ones with
//! the lowest usage rate: accesses per unit of residency time, measured in
//! query generations. A sub-tree loaded during the current generation has
//! an infinite usage rate and is never evicted before the generation ends,
//! so a miss can transiently push the cache over its element budget.

use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::IndexResult;
use crate::rtree::IndexTree;
use crate::values::{SpatialValue, SubTreeEntry};

use super::storage::NativeStorage;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct UsageRateCacheParams {
    /// Upper bound on the total number of elements held by resident
    /// sub-trees, except for the transient overshoot of the loading miss.
    pub max_cached_elements: usize,
    /// Upper bound on victims evicted per miss.
    pub max_evict: usize,
    /// When set, a usage snapshot is written to this directory on drop.
    pub stats_dir: Option<PathBuf>,
}

impl UsageRateCacheParams {
    pub fn new(max_cached_elements: usize) -> Self {
        Self {
            max_cached_elements,
            max_evict: 1,
            stats_dir: None,
        }
    }

    /// Derives the element budget from a byte budget, coarsely, by the
    /// in-memory size of one value.
    pub fn from_bytes<V>(max_cached_bytes: usize) -> Self {
        let value_size = std::mem::size_of::<V>().max(1);
        Self::new((max_cached_bytes / value_size).max(1))
    }

    pub fn with_max_evict(mut self, max_evict: usize) -> Self {
        self.max_evict = max_evict;
        self
    }

    pub fn with_stats_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stats_dir = Some(dir.into());
        self
    }
}

/// Per-sub-tree usage accounting. Monotone counters, folded on eviction.
#[derive(Debug, Clone, Copy, Default)]
struct CacheMetaData {
    load_generation: u64,
    current_access_count: u64,
    previous_access_count: u64,
    previous_age: u64,
    eviction_count: u64,
}

impl CacheMetaData {
    fn access_count(&self) -> u64 {
        self.previous_access_count + self.current_access_count
    }

    fn incache_count(&self, query_count: u64) -> u64 {
        (query_count - self.load_generation + 1) + self.previous_age
    }

    /// Sub-trees loaded during the current generation rate as infinity:
    /// they must survive until the generation ends.
    fn usage_rate(&self, query_count: u64) -> f64 {
        if query_count == self.load_generation {
            return f64::INFINITY;
        }
        self.access_count() as f64 / self.incache_count(query_count) as f64
    }

    fn on_query(&mut self) {
        self.current_access_count += 1;
    }

    fn on_load(&mut self, query_count: u64) {
        self.load_generation = query_count;
        self.current_access_count = 1;
    }

    fn on_evict(&mut self, query_count: u64) {
        self.previous_access_count += self.current_access_count;
        self.previous_age = query_count - self.load_generation + 1;
        self.current_access_count = 0;
        self.eviction_count += 1;
    }
}

/// Cache of loaded sub-trees, keyed by sub-tree id.
pub struct UsageRateCache<V> {
    params: UsageRateCacheParams,
    sub_trees: HashMap<u64, IndexTree<V>>,
    meta_data: HashMap<u64, CacheMetaData>,
    most_recent_query_count: u64,
}

impl<V> UsageRateCache<V> {
    pub fn new(params: UsageRateCacheParams) -> Self {
        Self {
            params,
            sub_trees: HashMap::new(),
            meta_data: HashMap::new(),
            most_recent_query_count: 0,
        }
    }

    /// Total number of elements held by resident sub-trees.
    pub fn cached_elements(&self) -> usize {
        self.sub_trees.values().map(|t| t.len()).sum()
    }

    pub fn is_resident(&self, sub_tree_id: u64) -> bool {
        self.sub_trees.contains_key(&sub_tree_id)
    }

    pub fn resident_ids(&self) -> Vec<u64> {
        self.sub_trees.keys().copied().collect()
    }

    /// Resident ids sorted by ascending usage rate, ties by id.
    fn ids_by_usage_rate(&self, query_count: u64) -> Vec<(u64, f64)> {
        let mut rated: Vec<(u64, f64)> = self
            .sub_trees
            .keys()
            .map(|&id| {
                let rate = self
                    .meta_data
                    .get(&id)
                    .map(|md| md.usage_rate(query_count))
                    .unwrap_or(0.0);
                (id, rate)
            })
            .collect();
        rated.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        rated
    }

    /// Frees room for `incoming_elements` by evicting up to `max_evict`
    /// sub-trees with the lowest usage rate. Entries loaded during the
    /// current generation are never evicted, so fewer than `max_evict`
    /// victims (or none) may be chosen and the budget may overshoot.
    fn evict_sub_trees(&mut self, incoming_elements: usize, query_count: u64) {
        let cached = self.cached_elements();
        if cached + incoming_elements <= self.params.max_cached_elements {
            return;
        }

        log::debug!(
            "eviction required: {} resident elements + {} incoming over budget {}",
            cached,
            incoming_elements,
            self.params.max_cached_elements
        );

        for (id, rate) in self
            .ids_by_usage_rate(query_count)
            .into_iter()
            .take(self.params.max_evict)
        {
            if rate.is_infinite() {
                break;
            }
            if let Some(md) = self.meta_data.get_mut(&id) {
                md.on_evict(query_count);
            }
            self.sub_trees.remove(&id);
        }
    }
}

impl<V: SpatialValue + DeserializeOwned> UsageRateCache<V> {
    /// Returns the sub-tree described by `entry`, loading it through
    /// `storage` on a miss. After this returns the entry is resident and
    /// pinned for the remainder of generation `query_count`.
    ///
    /// Load errors surface unchanged; the cache never retries.
    pub fn load_sub_tree(
        &mut self,
        entry: &SubTreeEntry,
        query_count: u64,
        storage: &NativeStorage,
    ) -> IndexResult<&IndexTree<V>> {
        self.most_recent_query_count = query_count;
        let id = entry.sub_tree_id;

        if self.sub_trees.contains_key(&id) {
            self.meta_data.entry(id).or_default().on_query();
        } else {
            self.evict_sub_trees(entry.n_elements, query_count);
            let tree = storage.load_sub_tree(id)?;
            self.meta_data.entry(id).or_default().on_load(query_count);
            self.sub_trees.insert(id, tree);
        }

        Ok(&self.sub_trees[&id])
    }
}

impl<V> Drop for UsageRateCache<V> {
    fn drop(&mut self) {
        let Some(stats_dir) = self.params.stats_dir.clone() else {
            return;
        };

        let query_count = self.most_recent_query_count;
        let snapshot: Vec<serde_json::Value> = self
            .meta_data
            .iter()
            .map(|(id, md)| {
                serde_json::json!({
                    "id": id,
                    "access_count": md.access_count(),
                    "eviction_count": md.eviction_count,
                    "incache_count": md.incache_count(query_count),
                    "usage_rate": md.usage_rate(query_count),
                })
            })
            .collect();

        let filename = format!(
            "cache_stats_{}.json",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
        );
        let path = stats_dir.join(filename);
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(err) = std::fs::write(&path, json) {
                    log::warn!("failed to write cache stats to {}: {}", path.display(), err);
                }
            }
            Err(err) => log::warn!("failed to encode cache stats: {}", err),
        }
    }
}
