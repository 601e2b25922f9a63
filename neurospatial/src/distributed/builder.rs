//! Distributed multi-index construction with two-level STR.
//!
//! Every rank collects its local values, then `finalize` partitions the
//! global set: a balanced distributed sort along coordinate 0 gives each
//! rank a contiguous slab, serial STR over coordinates 1 and 2 splits the
//! slab into inner tiles, and each tile becomes one persisted sub-tree.
//! Rank 0 assembles the top tree over the gathered tile descriptors.
//!
//! There is no partial-success mode: any communication or storage error
//! invalidates the output directory, which the caller must remove.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use crate::cancel::CancelToken;
use crate::errors::{IndexError, IndexResult};
use crate::multi_index::{IndexVariant, MetaData, NativeStorage};
use crate::rtree::IndexTree;
use crate::sort_tile::{serial_sort_tile_recursion, SerialStrParams};
use crate::values::{SpatialValue, SubTreeEntry};

use super::comm::Communicator;
use super::sorter::{CentroidMajorOrder, DistributedSorter};

/// Parameters of a two-level STR partition: one outer slab per rank along
/// dimension 0, inner tiles over dimensions 1 and 2 within each slab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoLevelStrParams {
    pub n_ranks: usize,
    pub inner_parts_per_dim: [usize; 3],
}

impl TwoLevelStrParams {
    pub fn inner_parts(&self) -> usize {
        self.inner_parts_per_dim.iter().product()
    }
}

/// Chooses the inner tiling from the per-rank share of the global element
/// count, splitting the exponent over dimensions 1 and 2 with the excess
/// going to dimension 1.
pub fn two_level_str_heuristic(
    n_total: usize,
    max_elements_per_part: usize,
    comm_size: usize,
) -> TwoLevelStrParams {
    let local_share = n_total.div_ceil(comm_size.max(1));
    let max_per_part = max_elements_per_part.max(1);

    let mut exponent: u32 = 0;
    while local_share.div_ceil(1 << exponent) > max_per_part {
        exponent += 1;
    }

    let e1 = exponent.div_ceil(2);
    let e2 = exponent / 2;
    TwoLevelStrParams {
        n_ranks: comm_size,
        inner_parts_per_dim: [1, 1 << e1, 1 << e2],
    }
}

/// Build-time configuration.
#[derive(Debug, Clone)]
pub struct MultiIndexBuildOptions {
    /// Heuristic upper bound on the element count of one sub-tree.
    pub max_elements_per_part: usize,
    pub cancel: CancelToken,
}

impl Default for MultiIndexBuildOptions {
    fn default() -> Self {
        Self {
            max_elements_per_part: 4_000_000,
            cancel: CancelToken::default(),
        }
    }
}

/// Collects values on each rank and builds a persisted multi-index on
/// `finalize`.
pub struct MultiIndexBulkBuilder<V> {
    storage: NativeStorage,
    values: Vec<V>,
    options: MultiIndexBuildOptions,
    n_total_values: Option<u64>,
}

impl<V> MultiIndexBulkBuilder<V>
where
    V: SpatialValue + Serialize + DeserializeOwned,
{
    /// Creates a builder writing to `output_dir`, which is created if
    /// missing.
    pub fn new(output_dir: impl AsRef<Path>) -> IndexResult<Self> {
        Self::with_options(output_dir, MultiIndexBuildOptions::default())
    }

    pub fn with_options(
        output_dir: impl AsRef<Path>,
        options: MultiIndexBuildOptions,
    ) -> IndexResult<Self> {
        let storage =
            NativeStorage::create(output_dir)?.with_cancel_token(options.cancel.clone());
        Ok(Self {
            storage,
            values: Vec::new(),
            options,
            n_total_values: None,
        })
    }

    pub fn reserve(&mut self, n_local_elements: usize) {
        self.values.reserve(n_local_elements);
    }

    pub fn insert(&mut self, value: V) {
        self.values.push(value);
    }

    pub fn insert_bulk(&mut self, values: impl IntoIterator<Item = V>) {
        self.values.extend(values);
    }

    /// Number of values inserted on this rank.
    pub fn local_size(&self) -> usize {
        self.values.len()
    }

    /// Global element count; only known after [`Self::finalize`].
    pub fn size(&self) -> IndexResult<u64> {
        self.n_total_values.ok_or(IndexError::NotFinalized)
    }

    /// Builds and persists the multi-index. Collective over `comm`; ranks
    /// outside the communicator pass `None` and return immediately.
    pub fn finalize<C: Communicator + ?Sized>(&mut self, comm: Option<&C>) -> IndexResult<()> {
        let Some(comm) = comm else {
            return Ok(());
        };

        let n_total = comm.allreduce_sum(self.values.len() as u64)?;
        self.n_total_values = Some(n_total);

        let params = two_level_str_heuristic(
            n_total as usize,
            self.options.max_elements_per_part,
            comm.size(),
        );

        // Outer level: every rank ends up owning a contiguous slab along
        // coordinate 0.
        DistributedSorter::<V, CentroidMajorOrder>::sort_and_balance(&mut self.values, comm)?;

        // Inner level: tile the slab over coordinates 1 and 2.
        let inner = SerialStrParams::new(self.values.len(), params.inner_parts_per_dim);
        serial_sort_tile_recursion(&mut self.values, &inner);

        let tiles_per_rank = comm.allgather_counts(inner.n_parts())?;
        let id_offset: u64 = tiles_per_rank[..comm.rank()].iter().sum::<usize>() as u64;

        let boundaries = inner.partition_boundaries();
        let mut descriptors = Vec::with_capacity(inner.n_parts());
        for (k, window) in boundaries.windows(2).enumerate() {
            self.options.cancel.check()?;

            let tile = self.values[window[0]..window[1]].to_vec();
            let n_elements = tile.len();
            let tree = IndexTree::bulk_load(tile);

            let sub_tree_id = id_offset + k as u64;
            self.storage.save_sub_tree(sub_tree_id, &tree)?;
            descriptors.push(SubTreeEntry::new(sub_tree_id, tree.bounds(), n_elements));
        }

        // Rank 0 assembles the top tree over every rank's descriptors.
        let encoded = bincode::serde::encode_to_vec(&descriptors, bincode::config::legacy())
            .map_err(IndexError::serialization)?;
        let gathered = comm.allgather_bytes(&encoded)?;

        if comm.rank() == 0 {
            let mut entries: Vec<SubTreeEntry> = Vec::new();
            for bytes in &gathered {
                let (decoded, _): (Vec<SubTreeEntry>, usize) =
                    bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
                        .map_err(IndexError::serialization)?;
                entries.extend(decoded);
            }
            // Empty tiles have no extent and are never query candidates.
            entries.retain(|e| e.n_elements > 0);

            let top = IndexTree::bulk_load(entries);
            self.storage.save_top_tree(&top)?;
            self.storage
                .write_meta(&MetaData::new(V::ELEMENT_TYPE, IndexVariant::MultiIndex))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::comm::LocalCluster;
    use crate::geometry::{BoundingBoxGeometry, Point3D, Shape, Sphere};
    use crate::multi_index::MultiIndexTree;
    use crate::values::IndexedSphere;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    #[test]
    fn test_two_level_heuristic() {
        // 1000 elements over 2 ranks with parts of up to 128: the local
        // share of 500 needs 4 inner tiles, split [1, 2, 2].
        let params = two_level_str_heuristic(1000, 128, 2);
        assert_eq!(params.n_ranks, 2);
        assert_eq!(params.inner_parts_per_dim, [1, 2, 2]);
        assert_eq!(params.inner_parts(), 4);

        // Odd exponent: the excess goes to dimension 1.
        let params = two_level_str_heuristic(1000, 256, 2);
        assert_eq!(params.inner_parts_per_dim, [1, 2, 1]);

        // Everything fits in one tile per rank.
        let params = two_level_str_heuristic(100, 1000, 4);
        assert_eq!(params.inner_parts_per_dim, [1, 1, 1]);
    }

    #[test]
    fn test_size_before_finalize() {
        let dir = tempdir().unwrap();
        let builder: MultiIndexBulkBuilder<IndexedSphere> =
            MultiIndexBulkBuilder::new(dir.path()).unwrap();
        assert!(matches!(builder.size(), Err(IndexError::NotFinalized)));
    }

    #[test]
    fn test_distributed_build_and_query() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("index");
        let n_per_rank = 500usize;
        let n_ranks = 2;

        let options = MultiIndexBuildOptions {
            max_elements_per_part: 128,
            cancel: CancelToken::default(),
        };

        let output_dir = output.clone();
        LocalCluster::run(n_ranks, move |comm| {
            let mut rng = StdRng::seed_from_u64(comm.rank() as u64);
            let mut builder: MultiIndexBulkBuilder<IndexedSphere> =
                MultiIndexBulkBuilder::with_options(&output_dir, options.clone())?;

            builder.reserve(n_per_rank);
            builder.insert_bulk((0..n_per_rank).map(|i| {
                IndexedSphere::new(
                    ((comm.rank() as u64) << 32) | i as u64,
                    Point3D::new(
                        rng.gen_range(0.0..100.0),
                        rng.gen_range(0.0..100.0),
                        rng.gen_range(0.0..100.0),
                    ),
                    0.5,
                )
            }));
            assert_eq!(builder.local_size(), n_per_rank);

            builder.finalize(Some(comm))?;
            assert_eq!(builder.size()?, (n_ranks * n_per_rank) as u64);
            Ok(())
        })
        .unwrap();

        // The persisted multi-index holds every element exactly once.
        let mut index: MultiIndexTree<IndexedSphere> =
            MultiIndexTree::open(&output, 1 << 20).unwrap();
        assert_eq!(index.len(), n_ranks * n_per_rank);

        let meta = NativeStorage::open(&output).unwrap().read_meta().unwrap();
        assert_eq!(meta.element_type, "sphere");
        assert_eq!(meta.variant().unwrap(), IndexVariant::MultiIndex);

        let everything = Shape::Box(index.bounds());
        let mut ids = index
            .find_intersecting::<BoundingBoxGeometry>(&everything)
            .unwrap();
        ids.sort_unstable();
        let mut expected: Vec<u64> = (0..n_per_rank as u64).collect();
        expected.extend((0..n_per_rank as u64).map(|i| (1u64 << 32) | i));
        assert_eq!(ids, expected);

        // A small window query agrees with exact geometry.
        let probe = Shape::Sphere(Sphere::new(Point3D::new(50.0, 50.0, 50.0), 10.0));
        let hits = index.count_intersecting::<crate::geometry::ExactGeometry>(&probe);
        assert!(hits.unwrap() > 0);
    }

    #[test]
    fn test_ranks_outside_communicator_return_immediately() {
        let dir = tempdir().unwrap();
        let mut builder: MultiIndexBulkBuilder<IndexedSphere> =
            MultiIndexBulkBuilder::new(dir.path()).unwrap();
        builder.insert(IndexedSphere::new(0, Point3D::new(0.0, 0.0, 0.0), 1.0));

        builder
            .finalize(None::<&crate::distributed::comm::LocalComm>)
            .unwrap();
        // The build never ran: no top tree, no global size.
        assert!(matches!(builder.size(), Err(IndexError::NotFinalized)));
    }

    #[test]
    fn test_canceled_build_aborts() {
        let dir = tempdir().unwrap();
        let cancel = CancelToken::default();
        cancel.cancel();
        let options = MultiIndexBuildOptions {
            max_elements_per_part: 64,
            cancel,
        };
        let path = dir.path().to_path_buf();

        let results = LocalCluster::run(1, move |comm| {
            let mut builder: MultiIndexBulkBuilder<IndexedSphere> =
                MultiIndexBulkBuilder::with_options(&path, options.clone())?;
            builder.insert(IndexedSphere::new(0, Point3D::new(0.0, 0.0, 0.0), 1.0));
            match builder.finalize(Some(comm)) {
                Err(IndexError::Canceled) => Ok(true),
                other => {
                    other?;
                    Ok(false)
                }
            }
        })
        .unwrap();
        assert_eq!(results, vec![true]);
    }
}
