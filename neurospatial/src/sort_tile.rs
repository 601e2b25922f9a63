//! Serial Sort-Tile-Recursion.
//!
//! STR partitions values in an axis-aligned box such that each part holds
//! roughly the same number of values and the parts tile the space: values
//! are sorted by their x-coordinate and split into `n[0]` even parts, each
//! part is sorted by y and split into `n[1]` parts, and once more along z.
//! Tile bounding boxes are overlap-free in their dim-0 projection only;
//! higher dimensions may overlap.

use std::cmp::Ordering;

use crate::values::SpatialValue;

/// Parameters defining a serial Sort-Tile-Recursion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialStrParams {
    /// Number of values undergoing STR.
    pub n_points: usize,
    /// Number of parts per space dimension.
    pub n_parts_per_dim: [usize; 3],
}

impl SerialStrParams {
    pub fn new(n_points: usize, n_parts_per_dim: [usize; 3]) -> Self {
        Self {
            n_points,
            n_parts_per_dim,
        }
    }

    /// Overall number of parts after STR.
    pub fn n_parts(&self) -> usize {
        self.n_parts_per_dim.iter().product()
    }

    /// Number of parts in a slice where the axes before `dim` are fixed,
    /// i.e. the product of the part counts for dimensions `dim..3`.
    pub fn n_parts_per_slice(&self, dim: usize) -> usize {
        self.n_parts_per_dim[dim..].iter().product()
    }

    /// Boundaries of the parts after STR, as cumulative offsets.
    ///
    /// With boundaries `b`, part `k` holds `values[b[k]..b[k + 1]]`; the
    /// length is one more than the number of parts. Part sizes differ by at
    /// most one, larger parts first.
    pub fn partition_boundaries(&self) -> Vec<usize> {
        let sizes = balanced_chunk_sizes(self.n_points, self.n_parts());
        let mut boundaries = Vec::with_capacity(sizes.len() + 1);
        boundaries.push(0);
        let mut acc = 0;
        for size in sizes {
            acc += size;
            boundaries.push(acc);
        }
        boundaries
    }

    /// Chooses partition counts so that the total is the smallest power of
    /// two for which no part exceeds `max_elements_per_part`, spreading the
    /// exponent across dimensions as evenly as possible with the excess
    /// going to dimension 0 first.
    pub fn from_heuristic(n_points: usize, max_elements_per_part: usize) -> Self {
        let exponent = smallest_pow2_exponent(n_points, max_elements_per_part.max(1));
        let mut n_parts_per_dim = [1usize; 3];
        for (dim, parts) in n_parts_per_dim.iter_mut().enumerate() {
            let e = exponent / 3 + usize::from(dim < exponent % 3);
            *parts = 1 << e;
        }
        Self::new(n_points, n_parts_per_dim)
    }
}

/// Smallest `k` such that `ceil(n / 2^k) <= max_per_part`.
fn smallest_pow2_exponent(n: usize, max_per_part: usize) -> usize {
    let mut k = 0;
    while n.div_ceil(1 << k) > max_per_part {
        k += 1;
    }
    k
}

/// Sizes of `n_chunks` near-equal chunks of `total` elements: `total / n`
/// each, with the remainder spread over the low chunks.
pub fn balanced_chunk_sizes(total: usize, n_chunks: usize) -> Vec<usize> {
    let base = total / n_chunks;
    let remainder = total % n_chunks;
    (0..n_chunks)
        .map(|i| base + usize::from(i < remainder))
        .collect()
}

/// Compares two values by coordinate `dim`, breaking ties lexicographically
/// on the remaining dimensions.
pub(crate) fn centroid_cmp_from<V: SpatialValue>(a: &V, b: &V, dim: usize) -> Ordering {
    for d in dim..3 {
        let (xa, xb) = (a.centroid_coord(d), b.centroid_coord(d));
        match xa.partial_cmp(&xb).unwrap_or(Ordering::Equal) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Performs single-threaded Sort-Tile-Recursion over `values`.
///
/// Afterwards each tile occupies a contiguous range of `values` given by
/// [`SerialStrParams::partition_boundaries`].
pub fn serial_sort_tile_recursion<V: SpatialValue>(values: &mut [V], params: &SerialStrParams) {
    debug_assert_eq!(values.len(), params.n_points);
    str_recurse(values, params, 0);
}

fn str_recurse<V: SpatialValue>(values: &mut [V], params: &SerialStrParams, dim: usize) {
    if dim == 3 || values.is_empty() {
        return;
    }

    values.sort_by(|a, b| centroid_cmp_from(a, b, dim));

    let sizes = balanced_chunk_sizes(values.len(), params.n_parts_per_dim[dim]);
    let mut rest = values;
    for size in sizes {
        let (tile, tail) = rest.split_at_mut(size);
        str_recurse(tile, params, dim + 1);
        rest = tail;
    }
}
