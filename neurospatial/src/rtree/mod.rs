//! In-memory R-tree with STR bulk loading.
//!
//! [`IndexTree`] is the core container: a balanced R-tree over any
//! [`crate::values::SpatialValue`], bulk-loaded with Sort-Tile-Recursion
//! and queried through bounding-box or exact geometry policies.

mod node;
mod tree;

pub use tree::{IndexTree, Predicate};

pub(crate) use node::MAX_FANOUT;
pub(crate) use tree::STRUCT_VERSION;
