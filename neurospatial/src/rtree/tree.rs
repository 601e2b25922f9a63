//! The [`IndexTree`] container and its query surface.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use itertools::Itertools;

use crate::errors::{IndexError, IndexResult};
use crate::geometry::{Box3D, CoordType, GeometryPolicy, Point3D, Shape};
use crate::sort_tile::{serial_sort_tile_recursion, SerialStrParams};
use crate::values::{IndexedSphere, MorphoEntry, Segment, SpatialValue, Synapse};

use super::node::{
    choose_subtree, mbr_of_children, mbr_of_values, split_internal, split_leaf, ChildNode, Node,
    MAX_FANOUT,
};

/// Version tag embedded in every serialized tree file. Bumped whenever the
/// node layout changes; loading a file with a different tag fails.
pub(crate) const STRUCT_VERSION: u32 = 3;

const TREE_MAGIC: u32 = 0x4E53_4958; // "NSIX"

/// Query predicate evaluated against stored values' bounding boxes.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Values whose MBR overlaps the shape's bounding box.
    Intersects(Shape),
    /// Values whose MBR is fully contained in the window.
    Within(Box3D),
    /// The `k` values with centroid closest to `point`.
    Nearest { point: Point3D, k: usize },
}

/// A bulk-loaded R-tree over values of type `V`.
///
/// Immutable in the supported workflows once built; `insert` and `place`
/// exist for incremental test construction.
#[derive(Debug, Clone)]
pub struct IndexTree<V> {
    root: Option<ChildNode<V>>,
    len: usize,
}

impl<V> Default for IndexTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IndexTree<V> {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// MBR of the root; the empty sentinel box for an empty tree.
    pub fn bounds(&self) -> Box3D {
        self.root
            .as_ref()
            .map(|root| root.mbr)
            .unwrap_or_else(Box3D::empty)
    }
}

impl<V: SpatialValue> IndexTree<V> {
    /// Builds a balanced tree from `values` using Sort-Tile-Recursion.
    ///
    /// The result is stable against input order up to tie-breaks on equal
    /// coordinates.
    pub fn bulk_load(mut values: Vec<V>) -> Self {
        let len = values.len();
        if len == 0 {
            return Self::new();
        }

        let params = SerialStrParams::from_heuristic(len, MAX_FANOUT);
        serial_sort_tile_recursion(&mut values, &params);

        let boundaries = params.partition_boundaries();
        let mut level: Vec<ChildNode<V>> = boundaries
            .windows(2)
            .filter(|w| w[1] > w[0])
            .map(|w| {
                let tile = values[w[0]..w[1]].to_vec();
                ChildNode {
                    mbr: mbr_of_values(&tile),
                    node: Box::new(Node::Leaf { values: tile }),
                }
            })
            .collect();

        while level.len() > 1 {
            level = {
                let groups = level.into_iter().chunks(MAX_FANOUT);
                groups
                    .into_iter()
                    .map(|group| {
                        let children: Vec<_> = group.collect();
                        ChildNode {
                            mbr: mbr_of_children(&children),
                            node: Box::new(Node::Internal { children }),
                        }
                    })
                    .collect()
            };
        }

        Self {
            root: level.pop(),
            len,
        }
    }

    /// Adds a single value, splitting nodes as needed.
    pub fn insert(&mut self, value: V) {
        self.root = Some(match self.root.take() {
            None => ChildNode {
                mbr: value.bounding_box(),
                node: Box::new(Node::Leaf {
                    values: vec![value],
                }),
            },
            Some(mut root) => match insert_recursive(&mut root, value) {
                None => root,
                Some(sibling) => ChildNode {
                    mbr: root.mbr.union(&sibling.mbr),
                    node: Box::new(Node::Internal {
                        children: vec![root, sibling],
                    }),
                },
            },
        });
        self.len += 1;
    }

    /// Inserts `value` only if no existing value whose MBR overlaps
    /// `region` intersects it under exact geometry. Atomic: on `false` the
    /// tree is unchanged.
    pub fn place(&mut self, region: &Box3D, value: V) -> IndexResult<bool> {
        if region.is_empty() {
            return Err(IndexError::InvalidArgument(
                "place region must satisfy min <= max".into(),
            ));
        }

        let shape = value.shape();
        let mut blocked = false;
        self.for_each_overlapping(region, &mut |existing: &V| {
            if !blocked && existing.shape().intersects(&shape) {
                blocked = true;
            }
        });
        if blocked {
            return Ok(false);
        }

        self.insert(value);
        Ok(true)
    }

    /// Yields every value whose MBR satisfies `predicate`, in traversal
    /// order, appending to `out`.
    pub fn query(&self, predicate: &Predicate, out: &mut Vec<V>) {
        match predicate {
            Predicate::Intersects(shape) => {
                let window = shape.bounding_box();
                self.for_each_overlapping(&window, &mut |v: &V| out.push(v.clone()));
            }
            Predicate::Within(window) => {
                self.for_each_overlapping(window, &mut |v: &V| {
                    if window.contains_box(&v.bounding_box()) {
                        out.push(v.clone());
                    }
                });
            }
            Predicate::Nearest { point, k } => {
                out.extend(self.nearest_values(point, *k).into_iter().cloned());
            }
        }
    }

    /// True iff some stored value intersects `shape` under policy `G`.
    pub fn is_intersecting<G: GeometryPolicy>(&self, shape: &Shape) -> bool {
        let window = shape.bounding_box();
        self.root
            .as_ref()
            .is_some_and(|root| any_intersecting::<V, G>(root, shape, &window))
    }

    /// Ids of all values intersecting `shape` under policy `G`.
    pub fn find_intersecting<G: GeometryPolicy>(&self, shape: &Shape) -> Vec<u64> {
        let mut ids = Vec::new();
        self.for_each_overlapping(&shape.bounding_box(), &mut |v: &V| {
            if G::intersects(shape, v) {
                ids.push(v.id());
            }
        });
        ids
    }

    /// As [`Self::find_intersecting`] but returns the full values.
    pub fn find_intersecting_objs<G: GeometryPolicy>(&self, shape: &Shape) -> Vec<V> {
        let mut objs = Vec::new();
        self.for_each_overlapping(&shape.bounding_box(), &mut |v: &V| {
            if G::intersects(shape, v) {
                objs.push(v.clone());
            }
        });
        objs
    }

    pub fn count_intersecting<G: GeometryPolicy>(&self, shape: &Shape) -> usize {
        let mut count = 0;
        self.for_each_overlapping(&shape.bounding_box(), &mut |v: &V| {
            if G::intersects(shape, v) {
                count += 1;
            }
        });
        count
    }

    /// Ids of the `k` values with centroid closest to `point`, nearest
    /// first; ties broken by stored order.
    pub fn find_nearest(&self, point: &Point3D, k: usize) -> Vec<u64> {
        self.nearest_values(point, k)
            .into_iter()
            .map(|v| v.id())
            .collect()
    }

    fn nearest_values(&self, point: &Point3D, k: usize) -> Vec<&V> {
        let mut result = Vec::new();
        if k == 0 {
            return result;
        }
        let Some(root) = self.root.as_ref() else {
            return result;
        };

        let mut seq = 0u64;
        let mut heap = BinaryHeap::new();
        heap.push(NearestEntry {
            dist: root.mbr.distance_to_point(point),
            seq,
            candidate: Candidate::Node(root),
        });

        while let Some(entry) = heap.pop() {
            match entry.candidate {
                Candidate::Node(child) => match child.node.as_ref() {
                    Node::Leaf { values } => {
                        for v in values {
                            seq += 1;
                            heap.push(NearestEntry {
                                dist: v.centroid().distance(point),
                                seq,
                                candidate: Candidate::Value(v),
                            });
                        }
                    }
                    Node::Internal { children } => {
                        for c in children {
                            seq += 1;
                            heap.push(NearestEntry {
                                dist: c.mbr.distance_to_point(point),
                                seq,
                                candidate: Candidate::Node(c),
                            });
                        }
                    }
                },
                Candidate::Value(v) => {
                    result.push(v);
                    if result.len() == k {
                        break;
                    }
                }
            }
        }
        result
    }

    /// Calls `f` for every value whose bounding box overlaps `window`, in
    /// traversal order.
    pub(crate) fn for_each_overlapping<'a>(
        &'a self,
        window: &Box3D,
        f: &mut impl FnMut(&'a V),
    ) {
        if let Some(root) = self.root.as_ref() {
            visit_overlapping(root, window, f);
        }
    }
}

fn visit_overlapping<'a, V: SpatialValue>(
    child: &'a ChildNode<V>,
    window: &Box3D,
    f: &mut impl FnMut(&'a V),
) {
    if !child.mbr.intersects(window) {
        return;
    }
    match child.node.as_ref() {
        Node::Leaf { values } => {
            for v in values {
                if v.bounding_box().intersects(window) {
                    f(v);
                }
            }
        }
        Node::Internal { children } => {
            for c in children {
                visit_overlapping(c, window, f);
            }
        }
    }
}

fn any_intersecting<V: SpatialValue, G: GeometryPolicy>(
    child: &ChildNode<V>,
    shape: &Shape,
    window: &Box3D,
) -> bool {
    if !child.mbr.intersects(window) {
        return false;
    }
    match child.node.as_ref() {
        Node::Leaf { values } => values
            .iter()
            .any(|v| v.bounding_box().intersects(window) && G::intersects(shape, v)),
        Node::Internal { children } => children
            .iter()
            .any(|c| any_intersecting::<V, G>(c, shape, window)),
    }
}

fn insert_recursive<V: SpatialValue>(child: &mut ChildNode<V>, value: V) -> Option<ChildNode<V>> {
    let bbox = value.bounding_box();
    child.mbr.expand(&bbox);
    let node_mbr = child.mbr;

    let split = match child.node.as_mut() {
        Node::Leaf { values } => {
            values.push(value);
            (values.len() > MAX_FANOUT).then(|| split_leaf(values, &node_mbr))
        }
        Node::Internal { children } => {
            let idx = choose_subtree(children, &bbox);
            match insert_recursive(&mut children[idx], value) {
                Some(sibling) => {
                    children.push(sibling);
                    (children.len() > MAX_FANOUT).then(|| split_internal(children, &node_mbr))
                }
                None => None,
            }
        }
    };

    split.map(|(left_mbr, sibling)| {
        child.mbr = left_mbr;
        sibling
    })
}

// ============================================================================
// Nearest-neighbour heap entries
// ============================================================================

enum Candidate<'a, V> {
    Node(&'a ChildNode<V>),
    Value(&'a V),
}

struct NearestEntry<'a, V> {
    dist: CoordType,
    seq: u64,
    candidate: Candidate<'a, V>,
}

impl<V> PartialEq for NearestEntry<'_, V> {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist && self.seq == other.seq
    }
}

impl<V> Eq for NearestEntry<'_, V> {}

impl<V> PartialOrd for NearestEntry<'_, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<V> Ord for NearestEntry<'_, V> {
    // Inverted so the max-heap pops the smallest distance first, earliest
    // sequence number on ties.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .dist
            .partial_cmp(&self.dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ============================================================================
// Serialization
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct TreeHeader {
    magic: u32,
    struct_version: u32,
}

impl TreeHeader {
    fn new() -> Self {
        Self {
            magic: TREE_MAGIC,
            struct_version: STRUCT_VERSION,
        }
    }

    fn validate(&self) -> IndexResult<()> {
        if self.magic != TREE_MAGIC {
            return Err(IndexError::InvalidArgument(
                "not a serialized index tree (bad magic)".into(),
            ));
        }
        if self.struct_version != STRUCT_VERSION {
            return Err(IndexError::VersionMismatch {
                expected: STRUCT_VERSION,
                found: self.struct_version,
            });
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "V: Serialize", deserialize = "V: DeserializeOwned"))]
struct TreeBody<V> {
    len: usize,
    root: Option<ChildNode<V>>,
}

impl<V: SpatialValue + Serialize> IndexTree<V> {
    /// Writes the tree as an opaque binary blob. Round-trip stable on one
    /// build; host byte order, not portable across platforms.
    pub fn serialize_into<W: Write>(&self, writer: &mut W) -> IndexResult<()> {
        let header = bincode::serde::encode_to_vec(TreeHeader::new(), bincode::config::legacy())
            .map_err(IndexError::serialization)?;
        writer.write_all(&header)?;

        let body = TreeBody {
            len: self.len,
            root: self.root.clone(),
        };
        let bytes = bincode::serde::encode_to_vec(&body, bincode::config::legacy())
            .map_err(IndexError::serialization)?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Saves the tree to a file on disk.
    pub fn dump(&self, path: impl AsRef<Path>) -> IndexResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.serialize_into(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

impl<V: SpatialValue + DeserializeOwned> IndexTree<V> {
    pub fn deserialize_from<R: Read>(reader: &mut R) -> IndexResult<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;

        let (header, consumed): (TreeHeader, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
                .map_err(IndexError::serialization)?;
        header.validate()?;

        let (body, _): (TreeBody<V>, usize) =
            bincode::serde::decode_from_slice(&bytes[consumed..], bincode::config::legacy())
                .map_err(IndexError::serialization)?;
        Ok(Self {
            root: body.root,
            len: body.len,
        })
    }

    /// Loads a tree previously written by [`IndexTree::dump`].
    pub fn load(path: impl AsRef<Path>) -> IndexResult<Self> {
        let mut file = File::open(path)?;
        Self::deserialize_from(&mut file)
    }
}

// ============================================================================
// Specialised indices
// ============================================================================

impl IndexTree<IndexedSphere> {
    /// Builds a sphere index from parallel centroid/radius/id arrays.
    pub fn from_spheres(
        centroids: &[Point3D],
        radii: &[CoordType],
        ids: &[u64],
    ) -> IndexResult<Self> {
        if centroids.len() != radii.len() || centroids.len() != ids.len() {
            return Err(IndexError::InvalidArgument(
                "centroids, radii and ids must have equal length".into(),
            ));
        }
        let values = ids
            .iter()
            .zip(centroids)
            .zip(radii)
            .map(|((&id, &c), &r)| IndexedSphere::new(id, c, r))
            .collect();
        Ok(Self::bulk_load(values))
    }

    /// Builds a point index: spheres with radius zero.
    pub fn from_points(centroids: &[Point3D], ids: &[u64]) -> IndexResult<Self> {
        let radii = vec![0.0; centroids.len()];
        Self::from_spheres(centroids, &radii, ids)
    }
}

impl IndexTree<MorphoEntry> {
    /// Adds one segment per consecutive point pair of a section, numbering
    /// segments from zero.
    pub fn add_segments(
        &mut self,
        gid: u64,
        section_id: u32,
        points: &[Point3D],
        radii: &[CoordType],
    ) -> IndexResult<()> {
        if points.len() != radii.len() {
            return Err(IndexError::InvalidArgument(
                "points and radii must have equal length".into(),
            ));
        }
        for (i, pair) in points.windows(2).enumerate() {
            self.insert(MorphoEntry::Segment(Segment::new(
                gid,
                section_id,
                i as u32,
                pair[0],
                pair[1],
                radii[i],
            )));
        }
        Ok(())
    }
}

impl IndexTree<Synapse> {
    pub fn add_synapses(
        &mut self,
        ids: &[u64],
        post_gids: &[u64],
        pre_gids: &[u64],
        centroids: &[Point3D],
    ) -> IndexResult<()> {
        if ids.len() != post_gids.len()
            || ids.len() != pre_gids.len()
            || ids.len() != centroids.len()
        {
            return Err(IndexError::InvalidArgument(
                "synapse arrays must have equal length".into(),
            ));
        }
        for i in 0..ids.len() {
            self.insert(Synapse::new(ids[i], post_gids[i], pre_gids[i], centroids[i]));
        }
        Ok(())
    }

    /// Counts the synapses inside `window`, aggregated by post-synaptic
    /// gid. Uses the exact point-in-box test.
    pub fn count_intersecting_agg_gid(&self, window: &Box3D) -> HashMap<u64, usize> {
        let mut counts = HashMap::new();
        self.for_each_overlapping(window, &mut |syn: &Synapse| {
            if window.contains_point(&syn.centroid) {
                *counts.entry(syn.post_gid).or_insert(0) += 1;
            }
        });
        counts
    }
}
