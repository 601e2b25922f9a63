//! Single-file persistent R-tree.
//!
//! Nodes are stored as fixed-size pages addressed by page id, so the file
//! is position-independent; an LRU cache keeps hot pages in memory. Page 0
//! holds the versioning header: opening a file whose `struct_version`
//! differs from this build's is a hard error, while a different
//! `platform_format_version` (pointer width, coordinate width, byte order)
//! only logs a warning.

mod page_cache;
mod page_file;
mod tree;

pub use tree::{MemDiskOptions, MemDiskTree};
