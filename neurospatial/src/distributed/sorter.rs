//! Balanced distributed sorting.
//!
//! [`DistributedSorter::sort_and_balance`] leaves the global concatenation
//! of all ranks' value arrays sorted by the key order, with every rank
//! holding exactly its balanced share (total / N, remainder on the low
//! ranks). The relative order of equal-key elements is unspecified: the
//! exchange is not stable.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering;
use std::marker::PhantomData;

use itertools::Itertools;

use crate::errors::{IndexError, IndexResult};
use crate::sort_tile::{balanced_chunk_sizes, centroid_cmp_from};
use crate::values::SpatialValue;

use super::comm::Communicator;

/// Total order used to sort values across ranks.
pub trait SortOrder<V> {
    fn cmp(a: &V, b: &V) -> Ordering;
}

/// Orders values by centroid coordinate 0, with lexicographic tie-breaks
/// on the remaining coordinates. This is the outer order of two-level STR.
pub struct CentroidMajorOrder;

impl<V: SpatialValue> SortOrder<V> for CentroidMajorOrder {
    fn cmp(a: &V, b: &V) -> Ordering {
        centroid_cmp_from(a, b, 0)
    }
}

fn encode_values<V: Serialize>(values: &[V]) -> IndexResult<Vec<u8>> {
    bincode::serde::encode_to_vec(values, bincode::config::legacy())
        .map_err(IndexError::serialization)
}

fn decode_values<V: DeserializeOwned>(bytes: &[u8]) -> IndexResult<Vec<V>> {
    bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
        .map(|(values, _)| values)
        .map_err(IndexError::serialization)
}

/// Distributed merge sort with exact post-sort balancing.
pub struct DistributedSorter<V, O> {
    _marker: PhantomData<(V, O)>,
}

impl<V, O> DistributedSorter<V, O>
where
    V: Clone + Serialize + DeserializeOwned,
    O: SortOrder<V>,
{
    /// Sorts the global array by `O` and rebalances rank sizes to the
    /// balanced targets. Collective over `comm`.
    pub fn sort_and_balance<C: Communicator + ?Sized>(
        values: &mut Vec<V>,
        comm: &C,
    ) -> IndexResult<()> {
        values.sort_by(O::cmp);
        if comm.size() <= 1 {
            return Ok(());
        }
        Self::splitter_exchange(values, comm)?;
        Self::balance(values, comm)?;
        Ok(())
    }

    /// Globally sorts by exchanging along sampled splitters and merging
    /// the received sorted runs. Rank sizes are only approximately
    /// balanced afterwards.
    fn splitter_exchange<C: Communicator + ?Sized>(
        values: &mut Vec<V>,
        comm: &C,
    ) -> IndexResult<()> {
        let n_ranks = comm.size();

        let counts = comm.allgather_counts(values.len())?;
        let total: usize = counts.iter().sum();

        // N-1 local splitters picked by position.
        let local_splitters: Vec<V> = if values.is_empty() {
            Vec::new()
        } else {
            (1..n_ranks)
                .map(|i| values[i * values.len() / n_ranks].clone())
                .collect()
        };

        let gathered = comm.allgather_bytes(&encode_values(&local_splitters)?)?;
        let mut samples: Vec<V> = Vec::new();
        for bytes in &gathered {
            samples.extend(decode_values::<V>(bytes)?);
        }
        samples.sort_by(O::cmp);

        // Global splitters at the balanced-chunk cumulative positions,
        // scaled into the sample array.
        let targets = balanced_chunk_sizes(total, n_ranks);
        let mut global_splitters = Vec::with_capacity(n_ranks.saturating_sub(1));
        if !samples.is_empty() && total > 0 {
            let mut cumulative = 0;
            for target in &targets[..n_ranks - 1] {
                cumulative += target;
                let idx = (cumulative * samples.len() / total).min(samples.len() - 1);
                global_splitters.push(samples[idx].clone());
            }
        }

        // Partition the local sorted run by the global splitters and
        // exchange the pieces.
        let mut boundaries = Vec::with_capacity(n_ranks + 1);
        boundaries.push(0);
        for splitter in &global_splitters {
            boundaries.push(values.partition_point(|v| O::cmp(v, splitter) == Ordering::Less));
        }
        while boundaries.len() < n_ranks + 1 {
            boundaries.push(values.len());
        }

        let payloads = boundaries
            .windows(2)
            .map(|w| encode_values(&values[w[0]..w[1]]))
            .collect::<IndexResult<Vec<_>>>()?;
        let received = comm.alltoallv(payloads)?;

        let runs = received
            .iter()
            .map(|bytes| decode_values::<V>(bytes))
            .collect::<IndexResult<Vec<_>>>()?;
        *values = runs
            .into_iter()
            .kmerge_by(|a, b| O::cmp(a, b) != Ordering::Greater)
            .collect();
        Ok(())
    }

    /// Moves elements between neighbouring ranks so every rank ends up
    /// with exactly its balanced target size. Order-preserving, so the
    /// global concatenation stays sorted.
    fn balance<C: Communicator + ?Sized>(values: &mut Vec<V>, comm: &C) -> IndexResult<()> {
        let n_ranks = comm.size();
        let rank = comm.rank();

        let counts = comm.allgather_counts(values.len())?;
        let total: usize = counts.iter().sum();
        let targets = balanced_chunk_sizes(total, n_ranks);

        // Global index interval held by this rank, intersected with every
        // rank's balanced interval.
        let local_start: usize = counts[..rank].iter().sum();
        let local_end = local_start + counts[rank];

        let mut send_counts = vec![0usize; n_ranks];
        let mut balanced_start = 0;
        for (i, target) in targets.iter().enumerate() {
            let balanced_end = balanced_start + target;
            if balanced_start < local_end && local_start < balanced_end {
                send_counts[i] = balanced_end.min(local_end) - balanced_start.max(local_start);
            }
            balanced_start = balanced_end;
        }

        let mut payloads = Vec::with_capacity(n_ranks);
        let mut offset = 0;
        for count in &send_counts {
            payloads.push(encode_values(&values[offset..offset + count])?);
            offset += count;
        }

        let received = comm.alltoallv(payloads)?;
        let mut balanced = Vec::with_capacity(targets[rank]);
        for bytes in &received {
            balanced.extend(decode_values::<V>(bytes)?);
        }
        debug_assert_eq!(balanced.len(), targets[rank]);
        *values = balanced;
        Ok(())
    }
}
