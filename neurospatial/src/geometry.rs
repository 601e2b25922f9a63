//! Geometric primitives and exact intersection tests.
//!
//! This module provides the 3D primitives stored and queried by the index
//! (points, axis-aligned boxes, spheres and capped cylinders) together with
//! the exact pairwise intersection kernel. Queries choose between two
//! geometry policies:
//!
//! - [`BoundingBoxGeometry`]: intersection defined through bounding-box
//!   overlap only. Cheap and conservative: may report false positives for
//!   cylinders and oblique shapes, never false negatives.
//! - [`ExactGeometry`]: the exact tests defined here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// Coordinate scalar used throughout the index.
///
/// Single precision by default; enable the `double-precision` feature to
/// switch every coordinate to `f64`.
#[cfg(not(feature = "double-precision"))]
pub type CoordType = f32;
#[cfg(feature = "double-precision")]
pub type CoordType = f64;

/// Denominators with magnitude below this collapse to the degenerate branch
/// in segment distance computations.
pub const EPSILON: CoordType = 1e-6;

/// A point (or vector) in 3D space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3D {
    pub x: CoordType,
    pub y: CoordType,
    pub z: CoordType,
}

impl Point3D {
    pub fn new(x: CoordType, y: CoordType, z: CoordType) -> Self {
        Self { x, y, z }
    }

    /// Coordinate along `dim` (0 = x, 1 = y, 2 = z).
    pub fn coord(&self, dim: usize) -> CoordType {
        match dim {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }

    pub fn dot(&self, other: &Point3D) -> CoordType {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn norm(&self) -> CoordType {
        self.dot(self).sqrt()
    }

    pub fn distance(&self, other: &Point3D) -> CoordType {
        (*self - *other).norm()
    }

    pub fn component_min(&self, other: &Point3D) -> Point3D {
        Point3D::new(
            self.x.min(other.x),
            self.y.min(other.y),
            self.z.min(other.z),
        )
    }

    pub fn component_max(&self, other: &Point3D) -> Point3D {
        Point3D::new(
            self.x.max(other.x),
            self.y.max(other.y),
            self.z.max(other.z),
        )
    }
}

impl Sub for Point3D {
    type Output = Point3D;

    fn sub(self, rhs: Point3D) -> Point3D {
        Point3D::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Add for Point3D {
    type Output = Point3D;

    fn add(self, rhs: Point3D) -> Point3D {
        Point3D::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Mul<CoordType> for Point3D {
    type Output = Point3D;

    fn mul(self, rhs: CoordType) -> Point3D {
        Point3D::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl fmt::Display for Point3D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// An axis-aligned box given by its minimum and maximum corners.
///
/// Valid boxes satisfy `min <= max` componentwise. The [`Box3D::empty`]
/// sentinel inverts that invariant on purpose so that expanding it by any
/// box or point yields that box or point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Box3D {
    pub min: Point3D,
    pub max: Point3D,
}

impl Box3D {
    pub fn new(min: Point3D, max: Point3D) -> Self {
        Self { min, max }
    }

    /// The empty sentinel: `min = +inf`, `max = -inf`.
    pub fn empty() -> Self {
        Self {
            min: Point3D::new(
                CoordType::INFINITY,
                CoordType::INFINITY,
                CoordType::INFINITY,
            ),
            max: Point3D::new(
                CoordType::NEG_INFINITY,
                CoordType::NEG_INFINITY,
                CoordType::NEG_INFINITY,
            ),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn is_valid(&self) -> bool {
        !self.is_empty()
    }

    pub fn center(&self) -> Point3D {
        Point3D::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
            (self.min.z + self.max.z) / 2.0,
        )
    }

    /// Grows this box to cover `other`.
    pub fn expand(&mut self, other: &Box3D) {
        self.min = self.min.component_min(&other.min);
        self.max = self.max.component_max(&other.max);
    }

    pub fn union(&self, other: &Box3D) -> Box3D {
        let mut merged = *self;
        merged.expand(other);
        merged
    }

    /// Volume of the box; zero for empty or degenerate boxes.
    pub fn volume(&self) -> CoordType {
        if self.is_empty() {
            return 0.0;
        }
        (self.max.x - self.min.x) * (self.max.y - self.min.y) * (self.max.z - self.min.z)
    }

    /// Volume increase required to also cover `other`.
    pub fn enlargement(&self, other: &Box3D) -> CoordType {
        self.union(other).volume() - self.volume()
    }

    /// Touching boxes count as intersecting.
    pub fn intersects(&self, other: &Box3D) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn contains_box(&self, other: &Box3D) -> bool {
        other.min.x >= self.min.x
            && other.min.y >= self.min.y
            && other.min.z >= self.min.z
            && other.max.x <= self.max.x
            && other.max.y <= self.max.y
            && other.max.z <= self.max.z
    }

    pub fn contains_point(&self, p: &Point3D) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// Closest point of the box to `p` (clamps componentwise).
    pub fn closest_point(&self, p: &Point3D) -> Point3D {
        p.component_max(&self.min).component_min(&self.max)
    }

    /// Euclidean distance from `p` to the box surface; zero when inside.
    pub fn distance_to_point(&self, p: &Point3D) -> CoordType {
        self.closest_point(p).distance(p)
    }
}

impl fmt::Display for Box3D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Box3D({} - {})", self.min, self.max)
    }
}

/// A sphere given by its centroid and radius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub centroid: Point3D,
    pub radius: CoordType,
}

impl Sphere {
    pub fn new(centroid: Point3D, radius: CoordType) -> Self {
        Self { centroid, radius }
    }

    pub fn bounding_box(&self) -> Box3D {
        let r = Point3D::new(self.radius, self.radius, self.radius);
        Box3D::new(self.centroid - r, self.centroid + r)
    }

    pub fn intersects_sphere(&self, other: &Sphere) -> bool {
        self.centroid.distance(&other.centroid) <= self.radius + other.radius
    }

    /// Closest point of the box to the centroid must lie within the radius,
    /// so a zero-radius sphere degenerates to a point-in-box test.
    pub fn intersects_box(&self, b: &Box3D) -> bool {
        b.distance_to_point(&self.centroid) <= self.radius
    }

    pub fn intersects_cylinder(&self, c: &Cylinder) -> bool {
        if c.is_degenerate() {
            return self.intersects_sphere(&Sphere::new(c.p1, c.radius));
        }

        // Infinite-axis test first: perpendicular distance from the centroid
        // to the cylinder axis.
        let u = self.centroid - c.p1;
        let v = c.p2 - c.p1;
        let proj = u.dot(&v);
        let distance = (u.dot(&u) - proj * proj / v.dot(&v)).max(0.0).sqrt();
        let radii_sum = self.radius + c.radius;

        if distance > radii_sum {
            return false;
        }

        // Cap check: the centroid's largest axial projection, measured from
        // either endpoint, must stay within the axis length plus the sphere
        // radius.
        let w = self.centroid - c.p2;
        let v_norm = v.norm();
        let max_proj = proj.abs().max(w.dot(&v).abs()) / v_norm;
        max_proj < v_norm + self.radius
    }
}

/// A finite capped cylinder between `p1` and `p2`.
///
/// A zero-length axis (`p1 == p2`) degenerates to a sphere at `p1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cylinder {
    pub p1: Point3D,
    pub p2: Point3D,
    pub radius: CoordType,
}

impl Cylinder {
    pub fn new(p1: Point3D, p2: Point3D, radius: CoordType) -> Self {
        Self { p1, p2, radius }
    }

    pub fn is_degenerate(&self) -> bool {
        self.p1 == self.p2
    }

    pub fn axis_length(&self) -> CoordType {
        self.p1.distance(&self.p2)
    }

    pub fn bounding_box(&self) -> Box3D {
        let r = Point3D::new(self.radius, self.radius, self.radius);
        Box3D::new(
            self.p1.component_min(&self.p2) - r,
            self.p1.component_max(&self.p2) + r,
        )
    }

    pub fn centroid(&self) -> Point3D {
        (self.p1 + self.p2) * 0.5
    }

    pub fn intersects_sphere(&self, s: &Sphere) -> bool {
        s.intersects_cylinder(self)
    }

    /// Tie-break: two cylinders whose axes are exactly the radii sum apart
    /// do NOT intersect (strict `<`).
    pub fn intersects_cylinder(&self, other: &Cylinder) -> bool {
        if self.is_degenerate() {
            return Sphere::new(self.p1, self.radius).intersects_cylinder(other);
        }
        if other.is_degenerate() {
            return Sphere::new(other.p1, other.radius).intersects_cylinder(self);
        }
        let min_dist = distance_segment_segment(&self.p1, &self.p2, &other.p1, &other.p2);
        min_dist < self.radius + other.radius
    }
}

/// Minimum distance between the segments `[s1_0, s1_1]` and `[s2_0, s2_1]`.
///
/// Closest-points-on-two-segments with the four edge cases for parallel and
/// near-parallel lines; any denominator below [`EPSILON`] collapses to the
/// zero branch.
pub fn distance_segment_segment(
    s1_0: &Point3D,
    s1_1: &Point3D,
    s2_0: &Point3D,
    s2_1: &Point3D,
) -> CoordType {
    let u = *s1_1 - *s1_0;
    let v = *s2_1 - *s2_0;
    let w = *s1_0 - *s2_0;
    let a = u.dot(&u);
    let b = u.dot(&v);
    let c = v.dot(&v);
    let d = u.dot(&w);
    let e = v.dot(&w);
    let big_d = a * c - b * b;

    let mut s_n;
    let mut s_d = big_d;
    let mut t_n;
    let mut t_d = big_d;

    if big_d < EPSILON {
        // the lines are almost parallel
        s_n = 0.0;
        s_d = 1.0;
        t_n = e;
        t_d = c;
    } else {
        s_n = b * e - c * d;
        t_n = a * e - b * d;
        if s_n < 0.0 {
            // the s=0 edge is visible
            s_n = 0.0;
            t_n = e;
            t_d = c;
        } else if s_n > s_d {
            // the s=1 edge is visible
            s_n = s_d;
            t_n = e + b;
            t_d = c;
        }
    }

    if t_n < 0.0 {
        // the t=0 edge is visible
        t_n = 0.0;
        if -d < 0.0 {
            s_n = 0.0;
        } else if -d > a {
            s_n = s_d;
        } else {
            s_n = -d;
            s_d = a;
        }
    } else if t_n > t_d {
        // the t=1 edge is visible
        t_n = t_d;
        if (-d + b) < 0.0 {
            s_n = 0.0;
        } else if (-d + b) > a {
            s_n = s_d;
        } else {
            s_n = -d + b;
            s_d = a;
        }
    }

    let sc = if s_n.abs() < EPSILON { 0.0 } else { s_n / s_d };
    let tc = if t_n.abs() < EPSILON { 0.0 } else { t_n / t_d };

    let d_p = w + (u * sc) - (v * tc);
    d_p.norm()
}

/// A query shape: the closed set of shapes the index can be probed with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Sphere(Sphere),
    Box(Box3D),
    Cylinder(Cylinder),
}

impl Shape {
    pub fn bounding_box(&self) -> Box3D {
        match self {
            Shape::Sphere(s) => s.bounding_box(),
            Shape::Box(b) => *b,
            Shape::Cylinder(c) => c.bounding_box(),
        }
    }

    /// Exact pairwise intersection.
    ///
    /// Box-cylinder is the one pair without an exact kernel: a degenerate
    /// cylinder is tested as a sphere, otherwise the pair falls back to
    /// bounding-box overlap (conservative, like the bounding-box policy).
    pub fn intersects(&self, other: &Shape) -> bool {
        match (self, other) {
            (Shape::Sphere(a), Shape::Sphere(b)) => a.intersects_sphere(b),
            (Shape::Sphere(s), Shape::Box(b)) | (Shape::Box(b), Shape::Sphere(s)) => {
                s.intersects_box(b)
            }
            (Shape::Sphere(s), Shape::Cylinder(c)) | (Shape::Cylinder(c), Shape::Sphere(s)) => {
                s.intersects_cylinder(c)
            }
            (Shape::Cylinder(a), Shape::Cylinder(b)) => a.intersects_cylinder(b),
            (Shape::Box(a), Shape::Box(b)) => a.intersects(b),
            (Shape::Box(b), Shape::Cylinder(c)) | (Shape::Cylinder(c), Shape::Box(b)) => {
                if c.is_degenerate() {
                    Sphere::new(c.p1, c.radius).intersects_box(b)
                } else {
                    b.intersects(&c.bounding_box())
                }
            }
        }
    }
}

/// How a query shape is tested against stored values.
pub trait GeometryPolicy {
    fn intersects<V: crate::values::SpatialValue>(shape: &Shape, value: &V) -> bool;
}

/// Intersection through bounding-box overlap only. Cheap and conservative:
/// never a false negative against bounding boxes.
pub struct BoundingBoxGeometry;

impl GeometryPolicy for BoundingBoxGeometry {
    fn intersects<V: crate::values::SpatialValue>(shape: &Shape, value: &V) -> bool {
        shape.bounding_box().intersects(&value.bounding_box())
    }
}

/// Exact intersection, dispatching on the stored value's shape.
pub struct ExactGeometry;

impl GeometryPolicy for ExactGeometry {
    fn intersects<V: crate::values::SpatialValue>(shape: &Shape, value: &V) -> bool {
        shape.intersects(&value.shape())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: CoordType, y: CoordType, z: CoordType) -> Point3D {
        Point3D::new(x, y, z)
    }

    #[test]
    fn test_empty_box_sentinel() {
        let empty = Box3D::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.volume(), 0.0);

        let mut grown = empty;
        let b = Box3D::new(p(0.0, 0.0, 0.0), p(1.0, 2.0, 3.0));
        grown.expand(&b);
        assert_eq!(grown, b);
    }

    #[test]
    fn test_box_intersects_touching() {
        let a = Box3D::new(p(0.0, 0.0, 0.0), p(1.0, 1.0, 1.0));
        let b = Box3D::new(p(1.0, 1.0, 1.0), p(2.0, 2.0, 2.0));
        let c = Box3D::new(p(1.5, 0.0, 0.0), p(2.0, 1.0, 1.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_box_contains() {
        let outer = Box3D::new(p(0.0, 0.0, 0.0), p(10.0, 10.0, 10.0));
        let inner = Box3D::new(p(2.0, 2.0, 2.0), p(8.0, 8.0, 8.0));
        assert!(outer.contains_box(&inner));
        assert!(!inner.contains_box(&outer));
        assert!(outer.contains_point(&p(0.0, 10.0, 5.0)));
        assert!(!outer.contains_point(&p(-0.1, 5.0, 5.0)));
    }

    #[test]
    fn test_sphere_sphere() {
        let a = Sphere::new(p(0.0, 0.0, 0.0), 1.0);
        let b = Sphere::new(p(3.0, 0.0, 0.0), 2.0);
        let c = Sphere::new(p(3.1, 0.0, 0.0), 2.0);
        // Touching spheres intersect.
        assert!(a.intersects_sphere(&b));
        assert!(!a.intersects_sphere(&c));
    }

    #[test]
    fn test_zero_radius_sphere_is_point_in_box() {
        let b = Box3D::new(p(0.0, 0.0, 0.0), p(1.0, 1.0, 1.0));
        assert!(Sphere::new(p(0.5, 0.5, 0.5), 0.0).intersects_box(&b));
        assert!(Sphere::new(p(1.0, 1.0, 1.0), 0.0).intersects_box(&b));
        assert!(!Sphere::new(p(1.1, 0.5, 0.5), 0.0).intersects_box(&b));
    }

    #[test]
    fn test_sphere_cylinder_sideways() {
        let c = Cylinder::new(p(0.0, 0.0, 0.0), p(10.0, 0.0, 0.0), 1.0);
        // Perpendicular distance from the axis is 3; the surface gap is 2.
        assert!(!Sphere::new(p(5.0, 0.0, 3.0), 1.9).intersects_cylinder(&c));
        assert!(Sphere::new(p(5.0, 0.0, 3.0), 2.1).intersects_cylinder(&c));
    }

    #[test]
    fn test_sphere_cylinder_beyond_cap() {
        let c = Cylinder::new(p(0.0, 0.0, 0.0), p(10.0, 0.0, 0.0), 1.0);
        // On-axis but past the far cap.
        assert!(!Sphere::new(p(30.0, 0.0, 0.0), 2.0).intersects_cylinder(&c));
        assert!(Sphere::new(p(10.5, 0.0, 0.0), 1.0).intersects_cylinder(&c));
    }

    #[test]
    fn test_degenerate_cylinder_is_sphere() {
        let degenerate = Cylinder::new(p(1.0, 1.0, 1.0), p(1.0, 1.0, 1.0), 2.0);
        let s = Sphere::new(p(4.0, 1.0, 1.0), 1.0);
        // Centers 3 apart, radii sum 3: the sphere-sphere rule applies.
        assert!(s.intersects_cylinder(&degenerate));
        let far = Sphere::new(p(4.1, 1.0, 1.0), 1.0);
        assert!(!far.intersects_cylinder(&degenerate));
    }

    #[test]
    fn test_cylinder_cylinder_strict_boundary() {
        let a = Cylinder::new(p(0.0, 0.0, 0.0), p(10.0, 0.0, 0.0), 1.0);
        // Parallel axis exactly radius-sum (2.0) away: strict `<` says no.
        let touching = Cylinder::new(p(0.0, 2.0, 0.0), p(10.0, 2.0, 0.0), 1.0);
        assert!(!a.intersects_cylinder(&touching));
        let overlapping = Cylinder::new(p(0.0, 1.9, 0.0), p(10.0, 1.9, 0.0), 1.0);
        assert!(a.intersects_cylinder(&overlapping));
    }

    #[test]
    fn test_cylinder_cylinder_skew() {
        let a = Cylinder::new(p(0.0, 0.0, 0.0), p(10.0, 0.0, 0.0), 0.5);
        let b = Cylinder::new(p(5.0, -5.0, 0.6), p(5.0, 5.0, 0.6), 0.5);
        // Crossing axes 0.6 apart, radii sum 1.0.
        assert!(a.intersects_cylinder(&b));
        let c = Cylinder::new(p(5.0, -5.0, 1.1), p(5.0, 5.0, 1.1), 0.5);
        assert!(!a.intersects_cylinder(&c));
    }

    #[test]
    fn test_segment_segment_distance() {
        // Parallel segments.
        let d = distance_segment_segment(
            &p(0.0, 0.0, 0.0),
            &p(10.0, 0.0, 0.0),
            &p(0.0, 3.0, 0.0),
            &p(10.0, 3.0, 0.0),
        );
        assert!((d - 3.0).abs() < 1e-5);

        // Disjoint collinear segments.
        let d = distance_segment_segment(
            &p(0.0, 0.0, 0.0),
            &p(1.0, 0.0, 0.0),
            &p(3.0, 0.0, 0.0),
            &p(4.0, 0.0, 0.0),
        );
        assert!((d - 2.0).abs() < 1e-5);

        // Crossing segments touch.
        let d = distance_segment_segment(
            &p(-1.0, 0.0, 0.0),
            &p(1.0, 0.0, 0.0),
            &p(0.0, -1.0, 0.0),
            &p(0.0, 1.0, 0.0),
        );
        assert!(d.abs() < 1e-5);
    }

    #[test]
    fn test_shape_dispatch() {
        let sphere = Shape::Sphere(Sphere::new(p(0.0, 0.0, 0.0), 1.0));
        let bx = Shape::Box(Box3D::new(p(0.5, 0.0, 0.0), p(2.0, 1.0, 1.0)));
        let cyl = Shape::Cylinder(Cylinder::new(p(-5.0, 0.0, 0.0), p(5.0, 0.0, 0.0), 0.5));
        assert!(sphere.intersects(&bx));
        assert!(sphere.intersects(&cyl));
        assert!(bx.intersects(&cyl));
        let far = Shape::Sphere(Sphere::new(p(100.0, 0.0, 0.0), 1.0));
        assert!(!far.intersects(&bx));
        assert!(!far.intersects(&cyl));
    }
}
