//! File layout of a persisted multi-index.
//!
//! A multi-index lives in a flat directory: `top.bin` for the top tree,
//! `sub_<k>.bin` for each sub-tree, and a small `meta_data.json` descriptor
//! identifying the index kind and version. The storage layer owns the
//! filename discipline and directory creation; the file contents are
//! whatever the tree serializer writes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::errors::{IndexError, IndexResult};
use crate::rtree::{IndexTree, STRUCT_VERSION};
use crate::values::{SpatialValue, SubTreeEntry};

const TOP_TREE_FILENAME: &str = "top.bin";
const META_FILENAME: &str = "meta_data.json";

fn sub_tree_filename(sub_tree_id: u64) -> String {
    format!("sub_{}.bin", sub_tree_id)
}

/// Version section of one index variant in the meta descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSection {
    pub version: u32,
}

/// The kind of index a directory or file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexVariant {
    InMemory,
    MemoryMapped,
    MultiIndex,
}

/// On-disk meta descriptor, one JSON object per index.
///
/// Exactly one of the variant sections must be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaData {
    pub element_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_memory: Option<VariantSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mapped: Option<VariantSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multi_index: Option<VariantSection>,
}

impl MetaData {
    pub fn new(element_type: &str, variant: IndexVariant) -> Self {
        let section = Some(VariantSection {
            version: STRUCT_VERSION,
        });
        let mut meta = Self {
            element_type: element_type.to_string(),
            in_memory: None,
            memory_mapped: None,
            multi_index: None,
        };
        match variant {
            IndexVariant::InMemory => meta.in_memory = section,
            IndexVariant::MemoryMapped => meta.memory_mapped = section,
            IndexVariant::MultiIndex => meta.multi_index = section,
        }
        meta
    }

    /// The single variant this descriptor declares.
    pub fn variant(&self) -> IndexResult<IndexVariant> {
        let present = [
            self.in_memory.map(|_| IndexVariant::InMemory),
            self.memory_mapped.map(|_| IndexVariant::MemoryMapped),
            self.multi_index.map(|_| IndexVariant::MultiIndex),
        ];
        let mut variants = present.into_iter().flatten();
        match (variants.next(), variants.next()) {
            (Some(variant), None) => Ok(variant),
            (None, _) => Err(IndexError::InvalidArgument(
                "meta data declares no index variant".into(),
            )),
            (Some(_), Some(_)) => Err(IndexError::InvalidArgument(
                "meta data declares multiple index variants".into(),
            )),
        }
    }
}

/// Storage for a multi-index directory.
#[derive(Debug, Clone)]
pub struct NativeStorage {
    output_dir: PathBuf,
    cancel: CancelToken,
}

impl NativeStorage {
    /// Creates the output directory (and parents) for a builder.
    pub fn create(output_dir: impl AsRef<Path>) -> IndexResult<Self> {
        fs::create_dir_all(output_dir.as_ref())?;
        Ok(Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            cancel: CancelToken::default(),
        })
    }

    /// Opens an existing multi-index directory read-only.
    pub fn open(output_dir: impl AsRef<Path>) -> IndexResult<Self> {
        let dir = output_dir.as_ref();
        if !dir.is_dir() {
            return Err(IndexError::InvalidArgument(format!(
                "not a multi-index directory: {}",
                dir.display()
            )));
        }
        Ok(Self {
            output_dir: dir.to_path_buf(),
            cancel: CancelToken::default(),
        })
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn top_tree_path(&self) -> PathBuf {
        self.output_dir.join(TOP_TREE_FILENAME)
    }

    pub fn sub_tree_path(&self, sub_tree_id: u64) -> PathBuf {
        self.output_dir.join(sub_tree_filename(sub_tree_id))
    }

    pub fn meta_path(&self) -> PathBuf {
        self.output_dir.join(META_FILENAME)
    }

    pub fn save_top_tree(&self, tree: &IndexTree<SubTreeEntry>) -> IndexResult<()> {
        tree.dump(self.top_tree_path())?;
        self.cancel.check()
    }

    pub fn save_sub_tree<V>(&self, sub_tree_id: u64, tree: &IndexTree<V>) -> IndexResult<()>
    where
        V: SpatialValue + Serialize,
    {
        tree.dump(self.sub_tree_path(sub_tree_id))?;
        self.cancel.check()
    }

    pub fn load_top_tree(&self) -> IndexResult<IndexTree<SubTreeEntry>> {
        let tree = IndexTree::load(self.top_tree_path())?;
        self.cancel.check()?;
        Ok(tree)
    }

    pub fn load_sub_tree<V>(&self, sub_tree_id: u64) -> IndexResult<IndexTree<V>>
    where
        V: SpatialValue + DeserializeOwned,
    {
        let tree = IndexTree::load(self.sub_tree_path(sub_tree_id))?;
        self.cancel.check()?;
        Ok(tree)
    }

    pub fn write_meta(&self, meta: &MetaData) -> IndexResult<()> {
        let json = serde_json::to_string_pretty(meta).map_err(IndexError::serialization)?;
        fs::write(self.meta_path(), json)?;
        Ok(())
    }

    pub fn read_meta(&self) -> IndexResult<MetaData> {
        let json = fs::read_to_string(self.meta_path())?;
        serde_json::from_str(&json).map_err(IndexError::serialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Box3D, Point3D};
    use crate::values::IndexedSphere;
    use tempfile::tempdir;

    #[test]
    fn test_filenames() {
        let dir = tempdir().unwrap();
        let storage = NativeStorage::create(dir.path().join("index")).unwrap();
        assert!(storage.output_dir().is_dir());
        assert!(storage.top_tree_path().ends_with("top.bin"));
        assert!(storage.sub_tree_path(42).ends_with("sub_42.bin"));
        assert!(storage.meta_path().ends_with("meta_data.json"));
    }

    #[test]
    fn test_open_missing_directory() {
        let dir = tempdir().unwrap();
        let result = NativeStorage::open(dir.path().join("missing"));
        assert!(matches!(result, Err(IndexError::InvalidArgument(_))));
    }

    #[test]
    fn test_save_and_load_trees() {
        let dir = tempdir().unwrap();
        let storage = NativeStorage::create(dir.path()).unwrap();

        let sub = IndexTree::bulk_load(vec![IndexedSphere::new(
            1,
            Point3D::new(0.0, 0.0, 0.0),
            1.0,
        )]);
        storage.save_sub_tree(0, &sub).unwrap();

        let top = IndexTree::bulk_load(vec![SubTreeEntry::new(0, sub.bounds(), sub.len())]);
        storage.save_top_tree(&top).unwrap();

        let loaded_top = storage.load_top_tree().unwrap();
        assert_eq!(loaded_top.len(), 1);
        let loaded_sub: IndexTree<IndexedSphere> = storage.load_sub_tree(0).unwrap();
        assert_eq!(loaded_sub.len(), 1);
        assert_eq!(loaded_sub.bounds(), sub.bounds());
    }

    #[test]
    fn test_load_missing_sub_tree_is_io_error() {
        let dir = tempdir().unwrap();
        let storage = NativeStorage::create(dir.path()).unwrap();
        let result: IndexResult<IndexTree<IndexedSphere>> = storage.load_sub_tree(99);
        assert!(matches!(result, Err(IndexError::Io(_))));
    }

    #[test]
    fn test_canceled_save_surfaces() {
        let dir = tempdir().unwrap();
        let token = CancelToken::new();
        let storage = NativeStorage::create(dir.path())
            .unwrap()
            .with_cancel_token(token.clone());

        token.cancel();
        let top = IndexTree::bulk_load(vec![SubTreeEntry::new(0, Box3D::empty(), 0)]);
        assert!(matches!(
            storage.save_top_tree(&top),
            Err(IndexError::Canceled)
        ));
    }

    #[test]
    fn test_meta_round_trip_and_validation() {
        let dir = tempdir().unwrap();
        let storage = NativeStorage::create(dir.path()).unwrap();

        let meta = MetaData::new("morphology", IndexVariant::MultiIndex);
        storage.write_meta(&meta).unwrap();

        let read = storage.read_meta().unwrap();
        assert_eq!(read.element_type, "morphology");
        assert_eq!(read.variant().unwrap(), IndexVariant::MultiIndex);

        // Multiple variant sections are rejected.
        let mut bad = MetaData::new("morphology", IndexVariant::MultiIndex);
        bad.in_memory = Some(VariantSection { version: 1 });
        assert!(matches!(
            bad.variant(),
            Err(IndexError::InvalidArgument(_))
        ));
    }
}
