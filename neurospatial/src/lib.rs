//! # Neurospatial - 3D Spatial Indexing for Neuron Morphologies
//!
//! This crate indexes neuron morphology data - somas, dendritic and axonal
//! segments, and synapses - for fast window, nearest-neighbour and
//! intersection queries against spheres, boxes and capped cylinders.
//!
//! ## Features
//!
//! - **Exact Geometry**: sphere/cylinder/box intersection beyond bounding
//!   boxes, switchable per query
//! - **STR Bulk Loading**: balanced trees built with Sort-Tile-Recursion
//! - **Out-of-Core Multi-Index**: a top tree over many persisted sub-trees
//!   with a usage-rate cache bounding resident memory
//! - **Distributed Construction**: two-level STR across ranks behind an
//!   opaque communicator abstraction
//! - **Single-File Persistence**: page-based memdisk trees with a
//!   versioning header, plus plain dump/load of in-memory trees
//!
//! ## Quick Start
//!
//! ```rust
//! use neurospatial::{ExactGeometry, IndexTree, IndexedSphere, Point3D, Shape, Sphere};
//!
//! let centroids = [
//!     Point3D::new(0.0, 0.0, 0.0),
//!     Point3D::new(10.0, 0.0, 0.0),
//!     Point3D::new(0.0, 10.0, 0.0),
//! ];
//! let tree = IndexTree::from_spheres(&centroids, &[1.0, 1.0, 1.0], &[7, 8, 9]).unwrap();
//!
//! let probe = Shape::Sphere(Sphere::new(Point3D::new(0.5, 0.0, 0.0), 1.0));
//! assert_eq!(tree.find_intersecting::<ExactGeometry>(&probe), [7]);
//! ```
//!
//! ## Morphology Index
//!
//! ```rust
//! use neurospatial::{
//!     ExactGeometry, IndexTree, MorphoEntry, Point3D, Segment, Shape, Soma, Sphere,
//! };
//!
//! let mut index: IndexTree<MorphoEntry> = IndexTree::new();
//! index.insert(Soma::new(1, Point3D::new(0.0, 0.0, 0.0), 2.0).into());
//! index.insert(
//!     Segment::new(1, 1, 0, Point3D::new(0.0, 0.0, 0.0), Point3D::new(10.0, 0.0, 0.0), 1.0)
//!         .into(),
//! );
//!
//! let probe = Shape::Sphere(Sphere::new(Point3D::new(5.0, 0.0, 3.0), 2.1));
//! assert!(index.is_intersecting::<ExactGeometry>(&probe));
//! ```

pub mod cancel;
pub mod distributed;
pub mod errors;
pub mod geometry;
pub mod memdisk;
pub mod multi_index;
pub mod rtree;
pub mod sort_tile;
pub mod values;

// Re-export geometry types
pub use geometry::{
    distance_segment_segment, BoundingBoxGeometry, Box3D, CoordType, Cylinder, ExactGeometry,
    GeometryPolicy, Point3D, Shape, Sphere,
};

// Re-export the value model
pub use values::{
    ElementKind, IndexedSphere, MorphoEntry, Segment, Soma, SpatialValue, SubTreeEntry, Synapse,
};

// Re-export the tree types and their support
pub use cancel::CancelToken;
pub use errors::{IndexError, IndexResult};
pub use memdisk::{MemDiskOptions, MemDiskTree};
pub use multi_index::{
    IndexVariant, MetaData, MultiIndexTree, NativeStorage, UsageRateCache, UsageRateCacheParams,
};
pub use rtree::{IndexTree, Predicate};
pub use sort_tile::{balanced_chunk_sizes, serial_sort_tile_recursion, SerialStrParams};

// Re-export distributed construction
pub use distributed::{
    two_level_str_heuristic, CentroidMajorOrder, Communicator, DistributedSorter, LocalCluster,
    LocalComm, MultiIndexBuildOptions, MultiIndexBulkBuilder, SortOrder, SubComm,
    TwoLevelStrParams,
};

/// Morphology index: somas and segments in one tree.
pub type MorphIndex = IndexTree<MorphoEntry>;

/// Synapse index with per-gid aggregation support.
pub type SynapseIndex = IndexTree<Synapse>;

/// Plain sphere index.
pub type SphereIndex = IndexTree<IndexedSphere>;
