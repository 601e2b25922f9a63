//! Distributed construction: communicator abstraction, balanced
//! distributed sorting, and the two-level STR bulk builder.

mod builder;
mod comm;
mod sorter;

pub use builder::{
    two_level_str_heuristic, MultiIndexBuildOptions, MultiIndexBulkBuilder, TwoLevelStrParams,
};
pub use comm::{
    assert_count_is_safe, shrink, split, Communicator, LocalCluster, LocalComm, SubComm,
};
pub use sorter::{CentroidMajorOrder, DistributedSorter, SortOrder};
