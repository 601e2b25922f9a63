//! Indexed value types: somas, segments, synapses and generic spheres.
//!
//! Every stored value derives a bounding box (used for R-tree indexing) and
//! a centroid (used for sort-tile-recursion), and exposes its exact shape
//! for the intersection kernel. Morphology indices store the [`MorphoEntry`]
//! tagged union of somas and segments; queries dispatch on the tag only at
//! the exact-intersection stage.

use serde::{Deserialize, Serialize};

use crate::geometry::{Box3D, CoordType, Cylinder, Point3D, Shape, Sphere};

/// Kind tag of an indexed element, stable across language bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElementKind {
    Soma = 0,
    Segment = 1,
    Synapse = 2,
    Sphere = 3,
    SubTree = 4,
}

/// Behaviour shared by every value an index can store.
pub trait SpatialValue: Clone {
    /// Name recorded in the on-disk meta descriptor.
    const ELEMENT_TYPE: &'static str;

    /// Axis-aligned box fully containing the shape.
    fn bounding_box(&self) -> Box3D;

    fn centroid(&self) -> Point3D;

    fn centroid_coord(&self, dim: usize) -> CoordType {
        self.centroid().coord(dim)
    }

    /// Identifier reported by id-returning queries.
    fn id(&self) -> u64;

    /// Exact geometry of the value, for the intersection kernel.
    fn shape(&self) -> Shape;

    fn kind(&self) -> ElementKind;

    /// Number of primitive elements this value stands for. Plain values
    /// count as one; sub-tree descriptors report their element count so
    /// the usage-rate cache can account for them.
    fn element_count(&self) -> usize {
        1
    }
}

/// A neuron cell body, indexed as a sphere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Soma {
    pub gid: u64,
    pub centroid: Point3D,
    pub radius: CoordType,
}

impl Soma {
    pub fn new(gid: u64, centroid: Point3D, radius: CoordType) -> Self {
        Self {
            gid,
            centroid,
            radius,
        }
    }

    fn sphere(&self) -> Sphere {
        Sphere::new(self.centroid, self.radius)
    }
}

impl SpatialValue for Soma {
    const ELEMENT_TYPE: &'static str = "soma";

    fn bounding_box(&self) -> Box3D {
        self.sphere().bounding_box()
    }

    fn centroid(&self) -> Point3D {
        self.centroid
    }

    fn id(&self) -> u64 {
        self.gid
    }

    fn shape(&self) -> Shape {
        Shape::Sphere(self.sphere())
    }

    fn kind(&self) -> ElementKind {
        ElementKind::Soma
    }
}

/// A dendrite or axon segment, indexed as a capped cylinder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub gid: u64,
    pub section_id: u32,
    pub segment_id: u32,
    pub p1: Point3D,
    pub p2: Point3D,
    pub radius: CoordType,
}

impl Segment {
    pub fn new(
        gid: u64,
        section_id: u32,
        segment_id: u32,
        p1: Point3D,
        p2: Point3D,
        radius: CoordType,
    ) -> Self {
        Self {
            gid,
            section_id,
            segment_id,
            p1,
            p2,
            radius,
        }
    }

    fn cylinder(&self) -> Cylinder {
        Cylinder::new(self.p1, self.p2, self.radius)
    }
}

impl SpatialValue for Segment {
    const ELEMENT_TYPE: &'static str = "segment";

    fn bounding_box(&self) -> Box3D {
        self.cylinder().bounding_box()
    }

    fn centroid(&self) -> Point3D {
        self.cylinder().centroid()
    }

    fn id(&self) -> u64 {
        self.gid
    }

    fn shape(&self) -> Shape {
        Shape::Cylinder(self.cylinder())
    }

    fn kind(&self) -> ElementKind {
        ElementKind::Segment
    }
}

/// A synapse, indexed as a point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Synapse {
    pub id: u64,
    pub post_gid: u64,
    pub pre_gid: u64,
    pub centroid: Point3D,
}

impl Synapse {
    pub fn new(id: u64, post_gid: u64, pre_gid: u64, centroid: Point3D) -> Self {
        Self {
            id,
            post_gid,
            pre_gid,
            centroid,
        }
    }
}

impl SpatialValue for Synapse {
    const ELEMENT_TYPE: &'static str = "synapse";

    fn bounding_box(&self) -> Box3D {
        Box3D::new(self.centroid, self.centroid)
    }

    fn centroid(&self) -> Point3D {
        self.centroid
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn shape(&self) -> Shape {
        Shape::Sphere(Sphere::new(self.centroid, 0.0))
    }

    fn kind(&self) -> ElementKind {
        ElementKind::Synapse
    }
}

/// A generic indexed sphere, for sphere-only and point-only indices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexedSphere {
    pub id: u64,
    pub centroid: Point3D,
    pub radius: CoordType,
}

impl IndexedSphere {
    pub fn new(id: u64, centroid: Point3D, radius: CoordType) -> Self {
        Self {
            id,
            centroid,
            radius,
        }
    }
}

impl SpatialValue for IndexedSphere {
    const ELEMENT_TYPE: &'static str = "sphere";

    fn bounding_box(&self) -> Box3D {
        Sphere::new(self.centroid, self.radius).bounding_box()
    }

    fn centroid(&self) -> Point3D {
        self.centroid
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn shape(&self) -> Shape {
        Shape::Sphere(Sphere::new(self.centroid, self.radius))
    }

    fn kind(&self) -> ElementKind {
        ElementKind::Sphere
    }
}

/// Morphology entry: a soma or a segment, with inline payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MorphoEntry {
    Soma(Soma),
    Segment(Segment),
}

impl MorphoEntry {
    pub fn gid(&self) -> u64 {
        match self {
            MorphoEntry::Soma(s) => s.gid,
            MorphoEntry::Segment(s) => s.gid,
        }
    }

    /// `(gid, section_id, segment_id)`; somas report section and segment 0.
    pub fn ids(&self) -> (u64, u32, u32) {
        match self {
            MorphoEntry::Soma(s) => (s.gid, 0, 0),
            MorphoEntry::Segment(s) => (s.gid, s.section_id, s.segment_id),
        }
    }

    /// Segment endpoints; `None` for somas.
    pub fn endpoints(&self) -> Option<(Point3D, Point3D)> {
        match self {
            MorphoEntry::Soma(_) => None,
            MorphoEntry::Segment(s) => Some((s.p1, s.p2)),
        }
    }
}

impl From<Soma> for MorphoEntry {
    fn from(soma: Soma) -> Self {
        MorphoEntry::Soma(soma)
    }
}

impl From<Segment> for MorphoEntry {
    fn from(segment: Segment) -> Self {
        MorphoEntry::Segment(segment)
    }
}

impl SpatialValue for MorphoEntry {
    const ELEMENT_TYPE: &'static str = "morphology";

    fn bounding_box(&self) -> Box3D {
        match self {
            MorphoEntry::Soma(s) => s.bounding_box(),
            MorphoEntry::Segment(s) => s.bounding_box(),
        }
    }

    fn centroid(&self) -> Point3D {
        match self {
            MorphoEntry::Soma(s) => s.centroid(),
            MorphoEntry::Segment(s) => s.centroid(),
        }
    }

    fn id(&self) -> u64 {
        self.gid()
    }

    fn shape(&self) -> Shape {
        match self {
            MorphoEntry::Soma(s) => s.shape(),
            MorphoEntry::Segment(s) => s.shape(),
        }
    }

    fn kind(&self) -> ElementKind {
        match self {
            MorphoEntry::Soma(_) => ElementKind::Soma,
            MorphoEntry::Segment(_) => ElementKind::Segment,
        }
    }
}

/// Descriptor of a persisted sub-tree, stored in the top tree of a
/// multi-index. The element count feeds the usage-rate cache's eviction
/// accounting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubTreeEntry {
    pub sub_tree_id: u64,
    pub mbr: Box3D,
    pub n_elements: usize,
}

impl SubTreeEntry {
    pub fn new(sub_tree_id: u64, mbr: Box3D, n_elements: usize) -> Self {
        Self {
            sub_tree_id,
            mbr,
            n_elements,
        }
    }
}

impl SpatialValue for SubTreeEntry {
    const ELEMENT_TYPE: &'static str = "sub_tree";

    fn bounding_box(&self) -> Box3D {
        self.mbr
    }

    fn centroid(&self) -> Point3D {
        self.mbr.center()
    }

    fn id(&self) -> u64 {
        self.sub_tree_id
    }

    fn shape(&self) -> Shape {
        Shape::Box(self.mbr)
    }

    fn kind(&self) -> ElementKind {
        ElementKind::SubTree
    }

    fn element_count(&self) -> usize {
        self.n_elements
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: CoordType, y: CoordType, z: CoordType) -> Point3D {
        Point3D::new(x, y, z)
    }

    #[test]
    fn test_soma_derivations() {
        let soma = Soma::new(42, p(1.0, 2.0, 3.0), 0.5);
        let bb = soma.bounding_box();
        assert_eq!(bb.min, p(0.5, 1.5, 2.5));
        assert_eq!(bb.max, p(1.5, 2.5, 3.5));
        assert_eq!(soma.centroid(), p(1.0, 2.0, 3.0));
        assert_eq!(soma.id(), 42);
        assert_eq!(soma.kind(), ElementKind::Soma);
    }

    #[test]
    fn test_segment_bounding_box_contains_cylinder() {
        let seg = Segment::new(1, 2, 3, p(0.0, 0.0, 0.0), p(10.0, 0.0, 0.0), 1.0);
        let bb = seg.bounding_box();
        assert_eq!(bb.min, p(-1.0, -1.0, -1.0));
        assert_eq!(bb.max, p(11.0, 1.0, 1.0));
        assert_eq!(seg.centroid(), p(5.0, 0.0, 0.0));
        assert_eq!(seg.centroid_coord(0), 5.0);
    }

    #[test]
    fn test_synapse_is_point_like() {
        let syn = Synapse::new(9, 100, 200, p(1.0, 1.0, 1.0));
        let bb = syn.bounding_box();
        assert_eq!(bb.min, bb.max);
        match syn.shape() {
            Shape::Sphere(s) => assert_eq!(s.radius, 0.0),
            other => panic!("expected sphere shape, got {:?}", other),
        }
    }

    #[test]
    fn test_morpho_entry_dispatch() {
        let soma: MorphoEntry = Soma::new(7, p(0.0, 0.0, 0.0), 1.0).into();
        let seg: MorphoEntry =
            Segment::new(7, 1, 0, p(0.0, 0.0, 0.0), p(4.0, 0.0, 0.0), 0.5).into();

        assert_eq!(soma.ids(), (7, 0, 0));
        assert_eq!(seg.ids(), (7, 1, 0));
        assert!(soma.endpoints().is_none());
        assert_eq!(
            seg.endpoints(),
            Some((p(0.0, 0.0, 0.0), p(4.0, 0.0, 0.0)))
        );
        assert_eq!(soma.kind(), ElementKind::Soma);
        assert_eq!(seg.kind(), ElementKind::Segment);
        assert!(matches!(seg.shape(), Shape::Cylinder(_)));
    }

    #[test]
    fn test_sub_tree_entry_counts_elements() {
        let entry = SubTreeEntry::new(
            3,
            Box3D::new(p(0.0, 0.0, 0.0), p(1.0, 1.0, 1.0)),
            128,
        );
        assert_eq!(entry.element_count(), 128);
        assert_eq!(entry.id(), 3);
        assert_eq!(entry.centroid(), p(0.5, 0.5, 0.5));
    }
}
