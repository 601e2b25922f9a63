//! The memdisk R-tree: node layout, updates and queries.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;

use crate::errors::{IndexError, IndexResult};
use crate::geometry::{Box3D, CoordType, GeometryPolicy, Point3D, Shape};
use crate::rtree::MAX_FANOUT;
use crate::sort_tile::centroid_cmp_from;
use crate::values::SpatialValue;

use super::page_cache::PageCache;
use super::page_file::{MemDiskHeader, PageFile};

/// Options accepted by [`MemDiskTree::create`].
#[derive(Debug, Clone)]
pub struct MemDiskOptions {
    /// Initial file allocation in MiB; the file grows past it on demand.
    pub size_mb: usize,
    /// Trim the file to its used pages on close.
    pub close_shrink: bool,
    /// Number of pages kept hot in memory.
    pub cache_pages: usize,
}

impl Default for MemDiskOptions {
    fn default() -> Self {
        Self {
            size_mb: 1024,
            close_shrink: false,
            cache_pages: 256,
        }
    }
}

/// A node stored in one page. Children are referenced by page id, never by
/// address, keeping the file position-independent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "V: Serialize", deserialize = "V: DeserializeOwned"))]
enum DiskNode<V> {
    Leaf { values: Vec<V> },
    Internal { children: Vec<DiskChild> },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct DiskChild {
    mbr: Box3D,
    page_id: u64,
}

/// An R-tree whose nodes live in a single on-disk file.
///
/// The file is exclusively owned by this handle; concurrent writers are
/// not supported.
pub struct MemDiskTree<V: SpatialValue + Serialize + DeserializeOwned> {
    file: PageFile,
    header: MemDiskHeader,
    cache: PageCache<DiskNode<V>>,
    close_shrink: bool,
    closed: bool,
}

impl<V> MemDiskTree<V>
where
    V: SpatialValue + Serialize + DeserializeOwned,
{
    /// Creates a new file-backed tree, replacing any file at `path`.
    pub fn create(path: impl AsRef<Path>, options: MemDiskOptions) -> IndexResult<Self> {
        let file = PageFile::create(path.as_ref(), options.size_mb)?;
        let header = MemDiskHeader::new();
        file.write_header(&header)?;
        Ok(Self {
            file,
            header,
            cache: PageCache::new(options.cache_pages),
            close_shrink: options.close_shrink,
            closed: false,
        })
    }

    /// Opens an existing file. Hard error on `struct_version` mismatch,
    /// warning on platform format mismatch.
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        Self::open_with_cache_pages(path, MemDiskOptions::default().cache_pages)
    }

    pub fn open_with_cache_pages(
        path: impl AsRef<Path>,
        cache_pages: usize,
    ) -> IndexResult<Self> {
        let file = PageFile::open(path.as_ref())?;
        let header = file.read_header()?;
        header.validate()?;
        Ok(Self {
            file,
            header,
            cache: PageCache::new(cache_pages),
            close_shrink: false,
            closed: false,
        })
    }

    pub fn len(&self) -> usize {
        self.header.value_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.value_count == 0
    }

    /// MBR of the root; the empty sentinel box for an empty tree.
    pub fn bounds(&self) -> Box3D {
        if self.header.root_page == 0 {
            Box3D::empty()
        } else {
            self.header.root_mbr
        }
    }

    pub fn insert(&mut self, value: V) -> IndexResult<()> {
        self.ensure_open()?;
        let bbox = value.bounding_box();

        if self.header.root_page == 0 {
            let page_id = self.allocate_page();
            self.write_node(page_id, DiskNode::Leaf {
                values: vec![value],
            })?;
            self.header.root_page = page_id;
            self.header.root_mbr = bbox;
        } else {
            let root_page = self.header.root_page;
            let (root_mbr, sibling) = self.insert_at(root_page, value, &bbox)?;
            match sibling {
                None => self.header.root_mbr = root_mbr,
                Some(sibling) => {
                    let new_root = self.allocate_page();
                    self.header.root_mbr = root_mbr.union(&sibling.mbr);
                    self.write_node(new_root, DiskNode::Internal {
                        children: vec![
                            DiskChild {
                                mbr: root_mbr,
                                page_id: root_page,
                            },
                            sibling,
                        ],
                    })?;
                    self.header.root_page = new_root;
                }
            }
        }

        self.header.value_count += 1;
        Ok(())
    }

    pub fn insert_bulk(&mut self, values: impl IntoIterator<Item = V>) -> IndexResult<()> {
        for value in values {
            self.insert(value)?;
        }
        Ok(())
    }

    /// Inserts `value` only if no existing value whose MBR overlaps
    /// `region` intersects it under exact geometry.
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
        })?;
        if blocked {
            return Ok(false);
        }

        self.insert(value)?;
        Ok(true)
    }

    pub fn is_intersecting<G: GeometryPolicy>(&mut self, shape: &Shape) -> IndexResult<bool> {
        let window = shape.bounding_box();
        let mut hit = false;
        // Traversal cost is dominated by page reads, so the early exit is
        // approximated by skipping the test once a hit is found.
        self.for_each_overlapping(&window, &mut |v: &V| {
            if !hit && G::intersects(shape, v) {
                hit = true;
            }
        })?;
        Ok(hit)
    }

    pub fn find_intersecting<G: GeometryPolicy>(&mut self, shape: &Shape) -> IndexResult<Vec<u64>> {
        let mut ids = Vec::new();
        self.for_each_overlapping(&shape.bounding_box(), &mut |v: &V| {
            if G::intersects(shape, v) {
                ids.push(v.id());
            }
        })?;
        Ok(ids)
    }

    pub fn find_intersecting_objs<G: GeometryPolicy>(
        &mut self,
        shape: &Shape,
    ) -> IndexResult<Vec<V>> {
        let mut objs = Vec::new();
        self.for_each_overlapping(&shape.bounding_box(), &mut |v: &V| {
            if G::intersects(shape, v) {
                objs.push(v.clone());
            }
        })?;
        Ok(objs)
    }

    pub fn count_intersecting<G: GeometryPolicy>(&mut self, shape: &Shape) -> IndexResult<usize> {
        let mut count = 0;
        self.for_each_overlapping(&shape.bounding_box(), &mut |v: &V| {
            if G::intersects(shape, v) {
                count += 1;
            }
        })?;
        Ok(count)
    }

    /// Ids of the `k` values with centroid closest to `point`.
    pub fn find_nearest(&mut self, point: &Point3D, k: usize) -> IndexResult<Vec<u64>> {
        let mut result = Vec::new();
        if k == 0 || self.header.root_page == 0 {
            return Ok(result);
        }

        let mut seq = 0u64;
        let mut heap = BinaryHeap::new();
        heap.push(DiskNearestEntry {
            dist: self.header.root_mbr.distance_to_point(point),
            seq,
            candidate: DiskCandidate::Node(self.header.root_page),
        });

        while let Some(entry) = heap.pop() {
            match entry.candidate {
                DiskCandidate::Node(page_id) => match self.read_node(page_id)? {
                    DiskNode::Leaf { values } => {
                        for v in values {
                            seq += 1;
                            heap.push(DiskNearestEntry {
                                dist: v.centroid().distance(point),
                                seq,
                                candidate: DiskCandidate::Value(v),
                            });
                        }
                    }
                    DiskNode::Internal { children } => {
                        for c in children {
                            seq += 1;
                            heap.push(DiskNearestEntry {
                                dist: c.mbr.distance_to_point(point),
                                seq,
                                candidate: DiskCandidate::Node(c.page_id),
                            });
                        }
                    }
                },
                DiskCandidate::Value(v) => {
                    result.push(v.id());
                    if result.len() == k {
                        break;
                    }
                }
            }
        }
        Ok(result)
    }

    /// Writes dirty pages and the header, then syncs the file.
    pub fn flush(&mut self) -> IndexResult<()> {
        self.ensure_open()?;
        for page_id in self.cache.dirty_pages() {
            if let Some(node) = self.cache.node(page_id) {
                let bytes = encode_node(node)?;
                self.file.write_page_bytes(page_id, bytes)?;
            }
            self.cache.mark_clean(page_id);
        }
        self.file.write_header(&self.header)?;
        self.file.sync()?;
        Ok(())
    }

    /// Flushes and, when configured with `close_shrink`, trims the file to
    /// its used pages. Further operations fail.
    pub fn close(&mut self) -> IndexResult<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        if self.close_shrink {
            log::debug!(
                "shrinking memdisk file to {} pages",
                self.header.next_page_id
            );
            self.file.shrink_to(self.header.next_page_id)?;
        }
        self.closed = true;
        Ok(())
    }

    fn ensure_open(&self) -> IndexResult<()> {
        if self.closed {
            return Err(IndexError::InvalidArgument(
                "memdisk tree is closed".into(),
            ));
        }
        Ok(())
    }

    fn allocate_page(&mut self) -> u64 {
        let page_id = self.header.next_page_id;
        self.header.next_page_id += 1;
        page_id
    }

    fn read_node(&mut self, page_id: u64) -> IndexResult<DiskNode<V>> {
        if let Some(node) = self.cache.get(page_id) {
            return Ok(node);
        }
        let bytes = self.file.read_page_bytes(page_id)?;
        let (node, _): (DiskNode<V>, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
                .map_err(IndexError::serialization)?;
        self.cache.insert(page_id, node.clone(), false);
        self.evict_excess()?;
        Ok(node)
    }

    fn write_node(&mut self, page_id: u64, node: DiskNode<V>) -> IndexResult<()> {
        self.cache.insert(page_id, node, true);
        self.evict_excess()
    }

    fn evict_excess(&mut self) -> IndexResult<()> {
        while self.cache.needs_eviction() {
            let Some((page_id, node, dirty)) = self.cache.evict_oldest() else {
                break;
            };
            if dirty {
                let bytes = encode_node(&node)?;
                self.file.write_page_bytes(page_id, bytes)?;
            }
        }
        Ok(())
    }

    /// Inserts into the subtree at `page_id`; returns the subtree's new
    /// MBR and, after a split, the freshly written right sibling.
    fn insert_at(
        &mut self,
        page_id: u64,
        value: V,
        bbox: &Box3D,
    ) -> IndexResult<(Box3D, Option<DiskChild>)> {
        let mut node = self.read_node(page_id)?;

        let outcome = match &mut node {
            DiskNode::Leaf { values } => {
                values.push(value);
                if values.len() > MAX_FANOUT {
                    let mbr = values_mbr(values);
                    let axis = longest_axis(&mbr);
                    values.sort_by(|a, b| centroid_cmp_from(a, b, axis));
                    let right = values.split_off(values.len() / 2);
                    InsertOutcome::Split {
                        left_mbr: values_mbr(values),
                        right_mbr: values_mbr(&right),
                        right_node: DiskNode::Leaf { values: right },
                    }
                } else {
                    InsertOutcome::NoSplit(values_mbr(values))
                }
            }
            DiskNode::Internal { children } => {
                let idx = choose_child(children, bbox);
                let child_page = children[idx].page_id;
                let (child_mbr, split) = self.insert_at(child_page, value, bbox)?;
                children[idx].mbr = child_mbr;
                if let Some(sibling) = split {
                    children.push(sibling);
                }

                if children.len() > MAX_FANOUT {
                    let mbr = children_mbr(children);
                    let axis = longest_axis(&mbr);
                    children.sort_by(|a, b| {
                        let ca = a.mbr.center().coord(axis);
                        let cb = b.mbr.center().coord(axis);
                        ca.partial_cmp(&cb).unwrap_or(Ordering::Equal)
                    });
                    let right = children.split_off(children.len() / 2);
                    InsertOutcome::Split {
                        left_mbr: children_mbr(children),
                        right_mbr: children_mbr(&right),
                        right_node: DiskNode::Internal { children: right },
                    }
                } else {
                    InsertOutcome::NoSplit(children_mbr(children))
                }
            }
        };

        match outcome {
            InsertOutcome::NoSplit(mbr) => {
                self.write_node(page_id, node)?;
                Ok((mbr, None))
            }
            InsertOutcome::Split {
                left_mbr,
                right_mbr,
                right_node,
            } => {
                let right_page = self.allocate_page();
                self.write_node(right_page, right_node)?;
                self.write_node(page_id, node)?;
                Ok((
                    left_mbr,
                    Some(DiskChild {
                        mbr: right_mbr,
                        page_id: right_page,
                    }),
                ))
            }
        }
    }

    fn for_each_overlapping(
        &mut self,
        window: &Box3D,
        f: &mut impl FnMut(&V),
    ) -> IndexResult<()> {
        if self.header.root_page == 0 || !self.header.root_mbr.intersects(window) {
            return Ok(());
        }
        self.visit_overlapping(self.header.root_page, window, f)
    }

    fn visit_overlapping(
        &mut self,
        page_id: u64,
        window: &Box3D,
        f: &mut impl FnMut(&V),
    ) -> IndexResult<()> {
        match self.read_node(page_id)? {
            DiskNode::Leaf { values } => {
                for v in &values {
                    if v.bounding_box().intersects(window) {
                        f(v);
                    }
                }
            }
            DiskNode::Internal { children } => {
                for c in &children {
                    if c.mbr.intersects(window) {
                        self.visit_overlapping(c.page_id, window, f)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl<V: SpatialValue + Serialize + DeserializeOwned> Drop for MemDiskTree<V> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Best effort: the handle may be dropped mid-error.
        for page_id in self.cache.dirty_pages() {
            let Some(node) = self.cache.node(page_id) else {
                continue;
            };
            match encode_node(node) {
                Ok(bytes) => {
                    if let Err(err) = self.file.write_page_bytes(page_id, bytes) {
                        log::warn!("memdisk flush on drop failed for page {}: {}", page_id, err);
                        return;
                    }
                }
                Err(err) => {
                    log::warn!("memdisk flush on drop failed for page {}: {}", page_id, err);
                    return;
                }
            }
        }
        if let Err(err) = self.file.write_header(&self.header) {
            log::warn!("memdisk header flush on drop failed: {}", err);
        }
    }
}

enum InsertOutcome<V> {
    NoSplit(Box3D),
    Split {
        left_mbr: Box3D,
        right_mbr: Box3D,
        right_node: DiskNode<V>,
    },
}

fn encode_node<V: Serialize>(node: &DiskNode<V>) -> IndexResult<Vec<u8>>
where
    DiskNode<V>: Serialize,
{
    bincode::serde::encode_to_vec(node, bincode::config::legacy())
        .map_err(IndexError::serialization)
}

fn values_mbr<V: SpatialValue>(values: &[V]) -> Box3D {
    let mut mbr = Box3D::empty();
    for v in values {
        mbr.expand(&v.bounding_box());
    }
    mbr
}

fn children_mbr(children: &[DiskChild]) -> Box3D {
    let mut mbr = Box3D::empty();
    for c in children {
        mbr.expand(&c.mbr);
    }
    mbr
}

fn choose_child(children: &[DiskChild], bbox: &Box3D) -> usize {
    let mut best = 0;
    let mut best_enlargement = children[0].mbr.enlargement(bbox);
    let mut best_volume = children[0].mbr.volume();
    for (i, child) in children.iter().enumerate().skip(1) {
        let enlargement = child.mbr.enlargement(bbox);
        let volume = child.mbr.volume();
        if enlargement < best_enlargement
            || (enlargement == best_enlargement && volume < best_volume)
        {
            best = i;
            best_enlargement = enlargement;
            best_volume = volume;
        }
    }
    best
}

fn longest_axis(mbr: &Box3D) -> usize {
    let extents = [
        mbr.max.x - mbr.min.x,
        mbr.max.y - mbr.min.y,
        mbr.max.z - mbr.min.z,
    ];
    let mut axis = 0;
    for (d, extent) in extents.iter().enumerate().skip(1) {
        if *extent > extents[axis] {
            axis = d;
        }
    }
    axis
}

enum DiskCandidate<V> {
    Node(u64),
    Value(V),
}

struct DiskNearestEntry<V> {
    dist: CoordType,
    seq: u64,
    candidate: DiskCandidate<V>,
}

impl<V> PartialEq for DiskNearestEntry<V> {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist && self.seq == other.seq
    }
}

impl<V> Eq for DiskNearestEntry<V> {}

impl<V> PartialOrd for DiskNearestEntry<V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<V> Ord for DiskNearestEntry<V> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .dist
            .partial_cmp(&self.dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{BoundingBoxGeometry, ExactGeometry, Sphere};
    use crate::memdisk::page_file::PAGE_SIZE;
    use crate::values::IndexedSphere;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn p(x: CoordType, y: CoordType, z: CoordType) -> Point3D {
        Point3D::new(x, y, z)
    }

    fn random_spheres(n: usize, seed: u64) -> Vec<IndexedSphere> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n as u64)
            .map(|i| {
                IndexedSphere::new(
                    i,
                    p(
                        rng.gen_range(0.0..50.0),
                        rng.gen_range(0.0..50.0),
                        rng.gen_range(0.0..50.0),
                    ),
                    0.25,
                )
            })
            .collect()
    }

    fn small_options() -> MemDiskOptions {
        MemDiskOptions {
            size_mb: 4,
            close_shrink: false,
            cache_pages: 8,
        }
    }

    #[test]
    fn test_create_insert_close_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spheres.msi");

        let spheres = random_spheres(1000, 21);
        let bounds;
        {
            let mut tree: MemDiskTree<IndexedSphere> =
                MemDiskTree::create(&path, small_options()).unwrap();
            tree.insert_bulk(spheres.clone()).unwrap();
            assert_eq!(tree.len(), 1000);
            bounds = tree.bounds();
            tree.close().unwrap();
        }

        let mut reopened: MemDiskTree<IndexedSphere> = MemDiskTree::open(&path).unwrap();
        assert_eq!(reopened.len(), 1000);
        assert_eq!(reopened.bounds(), bounds);

        // Queries agree with a linear scan after the round trip.
        let shape = Shape::Sphere(Sphere::new(p(25.0, 25.0, 25.0), 10.0));
        let mut found = reopened.find_intersecting::<ExactGeometry>(&shape).unwrap();
        found.sort_unstable();
        let mut expected: Vec<u64> = spheres
            .iter()
            .filter(|s| shape.intersects(&s.shape()))
            .map(|s| s.id)
            .collect();
        expected.sort_unstable();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_version_mismatch_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.msi");

        {
            let mut tree: MemDiskTree<IndexedSphere> =
                MemDiskTree::create(&path, small_options()).unwrap();
            tree.insert(IndexedSphere::new(1, p(0.0, 0.0, 0.0), 1.0))
                .unwrap();
            tree.close().unwrap();
        }

        // Rewrite the header with a foreign struct version.
        let file = PageFile::open(&path).unwrap();
        let mut header = file.read_header().unwrap();
        header.struct_version += 1;
        file.write_header(&header).unwrap();
        file.sync().unwrap();

        let result = MemDiskTree::<IndexedSphere>::open(&path);
        assert!(matches!(
            result,
            Err(IndexError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_close_shrink_trims_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shrunk.msi");

        let mut options = small_options();
        options.close_shrink = true;
        let mut tree: MemDiskTree<IndexedSphere> = MemDiskTree::create(&path, options).unwrap();
        tree.insert_bulk(random_spheres(100, 5)).unwrap();
        let used_pages = tree.header.next_page_id;
        tree.close().unwrap();

        assert_eq!(
            path.metadata().unwrap().len(),
            used_pages * PAGE_SIZE as u64
        );
        assert!(used_pages * (PAGE_SIZE as u64) < 4 * 1024 * 1024);

        // The trimmed file still opens and answers queries.
        let mut reopened: MemDiskTree<IndexedSphere> = MemDiskTree::open(&path).unwrap();
        assert_eq!(reopened.len(), 100);
        assert!(!reopened
            .find_intersecting::<BoundingBoxGeometry>(&Shape::Box(reopened.bounds()))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_operations_after_close_fail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("closed.msi");
        let mut tree: MemDiskTree<IndexedSphere> =
            MemDiskTree::create(&path, small_options()).unwrap();
        tree.close().unwrap();
        let result = tree.insert(IndexedSphere::new(1, p(0.0, 0.0, 0.0), 1.0));
        assert!(matches!(result, Err(IndexError::InvalidArgument(_))));
    }

    #[test]
    fn test_place_and_nearest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("place.msi");
        let mut tree: MemDiskTree<IndexedSphere> =
            MemDiskTree::create(&path, small_options()).unwrap();

        let region = Box3D::new(p(-10.0, -10.0, -10.0), p(10.0, 10.0, 10.0));
        assert!(tree
            .place(&region, IndexedSphere::new(1, p(0.0, 0.0, 0.0), 1.0))
            .unwrap());
        assert!(!tree
            .place(&region, IndexedSphere::new(2, p(0.5, 0.0, 0.0), 1.0))
            .unwrap());
        assert!(tree
            .place(&region, IndexedSphere::new(3, p(5.0, 0.0, 0.0), 1.0))
            .unwrap());
        assert_eq!(tree.len(), 2);

        let nearest = tree.find_nearest(&p(4.0, 0.0, 0.0), 1).unwrap();
        assert_eq!(nearest, [3]);
    }

    #[test]
    fn test_small_cache_spills_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spill.msi");

        let mut options = small_options();
        options.cache_pages = 2;
        let mut tree: MemDiskTree<IndexedSphere> = MemDiskTree::create(&path, options).unwrap();

        let spheres = random_spheres(500, 13);
        tree.insert_bulk(spheres.clone()).unwrap();

        let shape = Shape::Sphere(Sphere::new(p(20.0, 20.0, 20.0), 8.0));
        let mut found = tree.find_intersecting::<ExactGeometry>(&shape).unwrap();
        found.sort_unstable();
        let mut expected: Vec<u64> = spheres
            .iter()
            .filter(|s| shape.intersects(&s.shape()))
            .map(|s| s.id)
            .collect();
        expected.sort_unstable();
        assert_eq!(found, expected);
    }
}
