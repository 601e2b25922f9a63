//! Query orchestration over a persisted multi-index.

use serde::de::DeserializeOwned;
use std::path::Path;

use crate::cancel::CancelToken;
use crate::errors::IndexResult;
use crate::geometry::{Box3D, ExactGeometry, GeometryPolicy, Shape};
use crate::rtree::{IndexTree, Predicate};
use crate::values::{SpatialValue, SubTreeEntry};

use super::cache::{UsageRateCache, UsageRateCacheParams};
use super::storage::NativeStorage;

/// A multi-index: a fully loaded top tree over sub-tree descriptors, plus a
/// usage-rate cache of the sub-trees themselves.
///
/// Queries take `&mut self` because they advance the generation counter and
/// mutate cache state; a handle must not be shared across threads.
pub struct MultiIndexTree<V> {
    storage: NativeStorage,
    top_tree: IndexTree<SubTreeEntry>,
    cache: UsageRateCache<V>,
    query_count: u64,
    cancel: CancelToken,
}

impl<V: SpatialValue + DeserializeOwned> MultiIndexTree<V> {
    /// Opens a multi-index directory, loading the top tree eagerly. The
    /// cache element budget is derived from `max_cached_bytes`.
    pub fn open(output_dir: impl AsRef<Path>, max_cached_bytes: usize) -> IndexResult<Self> {
        Self::with_params(output_dir, UsageRateCacheParams::from_bytes::<V>(max_cached_bytes))
    }

    pub fn with_params(
        output_dir: impl AsRef<Path>,
        params: UsageRateCacheParams,
    ) -> IndexResult<Self> {
        let storage = NativeStorage::open(output_dir)?;
        let top_tree = storage.load_top_tree()?;
        Ok(Self {
            storage,
            top_tree,
            cache: UsageRateCache::new(params),
            query_count: 0,
            cancel: CancelToken::default(),
        })
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.storage = self.storage.clone().with_cancel_token(cancel.clone());
        self.cancel = cancel;
        self
    }

    /// MBR of the whole index.
    pub fn bounds(&self) -> Box3D {
        self.top_tree.bounds()
    }

    /// Total number of indexed elements, from the sub-tree descriptors.
    pub fn len(&self) -> usize {
        let mut total = 0;
        self.top_tree
            .for_each_overlapping(&self.top_tree.bounds(), &mut |e: &SubTreeEntry| {
                total += e.n_elements;
            });
        total
    }

    pub fn is_empty(&self) -> bool {
        self.top_tree.is_empty()
    }

    /// Runs `predicate` against every matching sub-tree, appending results
    /// to `out` in top-tree traversal order, then sub-tree traversal order.
    pub fn query(&mut self, predicate: &Predicate, out: &mut Vec<V>) -> IndexResult<()> {
        let candidates = self.candidates(predicate);

        for entry in &candidates {
            self.cancel.check()?;
            let sub_tree =
                self.cache
                    .load_sub_tree(entry, self.query_count, &self.storage)?;
            sub_tree.query(predicate, out);
        }

        self.query_count += 1;
        Ok(())
    }

    /// True iff some stored value exactly intersects `shape`.
    /// Short-circuits across candidates and within each sub-tree.
    pub fn is_intersecting(&mut self, shape: &Shape) -> IndexResult<bool> {
        let candidates: Vec<SubTreeEntry> = self
            .top_tree
            .find_intersecting_objs::<ExactGeometry>(shape);

        let mut hit = false;
        for entry in &candidates {
            self.cancel.check()?;
            let sub_tree =
                self.cache
                    .load_sub_tree(entry, self.query_count, &self.storage)?;
            if sub_tree.is_intersecting::<ExactGeometry>(shape) {
                hit = true;
                break;
            }
        }

        self.query_count += 1;
        Ok(hit)
    }

    /// Ids of all values intersecting `shape` under policy `G`.
    pub fn find_intersecting<G: GeometryPolicy>(
        &mut self,
        shape: &Shape,
    ) -> IndexResult<Vec<u64>> {
        self.for_each_candidate::<G, _>(shape, |sub_tree, ids: &mut Vec<u64>| {
            ids.extend(sub_tree.find_intersecting::<G>(shape));
        })
    }

    /// As [`Self::find_intersecting`] but returns the full values.
    pub fn find_intersecting_objs<G: GeometryPolicy>(
        &mut self,
        shape: &Shape,
    ) -> IndexResult<Vec<V>> {
        self.for_each_candidate::<G, _>(shape, |sub_tree, objs: &mut Vec<V>| {
            objs.extend(sub_tree.find_intersecting_objs::<G>(shape));
        })
    }

    pub fn count_intersecting<G: GeometryPolicy>(&mut self, shape: &Shape) -> IndexResult<usize> {
        let counts = self.for_each_candidate::<G, _>(shape, |sub_tree, acc: &mut Vec<usize>| {
            acc.push(sub_tree.count_intersecting::<G>(shape));
        })?;
        Ok(counts.into_iter().sum())
    }

    /// Runs `f` over every sub-tree whose descriptor passes the `G` filter
    /// against `shape`, then advances the generation.
    fn for_each_candidate<G: GeometryPolicy, T>(
        &mut self,
        shape: &Shape,
        mut f: impl FnMut(&IndexTree<V>, &mut Vec<T>),
    ) -> IndexResult<Vec<T>> {
        let candidates: Vec<SubTreeEntry> = self.top_tree.find_intersecting_objs::<G>(shape);

        let mut out = Vec::new();
        for entry in &candidates {
            self.cancel.check()?;
            let sub_tree =
                self.cache
                    .load_sub_tree(entry, self.query_count, &self.storage)?;
            f(sub_tree, &mut out);
        }

        self.query_count += 1;
        Ok(out)
    }

    fn candidates(&self, predicate: &Predicate) -> Vec<SubTreeEntry> {
        match predicate {
            // The containment filter only applies to leaf values; any
            // sub-tree overlapping the window may hold contained values.
            Predicate::Intersects(shape) => self.overlapping_candidates(&shape.bounding_box()),
            Predicate::Within(window) => self.overlapping_candidates(window),
            Predicate::Nearest { point, k } => {
                let mut out = Vec::new();
                self.top_tree
                    .query(&Predicate::Nearest { point: *point, k: *k }, &mut out);
                out
            }
        }
    }

    fn overlapping_candidates(&self, window: &Box3D) -> Vec<SubTreeEntry> {
        let mut candidates = Vec::new();
        self.top_tree
            .for_each_overlapping(window, &mut |e: &SubTreeEntry| {
                candidates.push(*e);
            });
        candidates
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &UsageRateCache<V> {
        &self.cache
    }

    #[cfg(test)]
    pub(crate) fn query_count(&self) -> u64 {
        self.query_count
    }
}
