//! Out-of-core multi-index: a persisted top tree over many persisted
//! sub-trees, queried through a bounded-memory usage-rate cache.

mod cache;
mod storage;
mod tree;

pub use cache::{UsageRateCache, UsageRateCacheParams};
pub use storage::{IndexVariant, MetaData, NativeStorage, VariantSection};
pub use tree::MultiIndexTree;
