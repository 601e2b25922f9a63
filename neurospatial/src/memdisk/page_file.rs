//! Page-granular file I/O and the versioning header.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::errors::{IndexError, IndexResult};
use crate::geometry::{Box3D, CoordType};
use crate::rtree::STRUCT_VERSION;

/// Size of one page; the header occupies page 0.
pub(crate) const PAGE_SIZE: usize = 16 * 1024;

const MEMDISK_MAGIC: u32 = 0x4E53_4D44; // "NSMD"

/// Encodes pointer width, coordinate width and byte order of the build
/// that wrote a file. Persisted trees use host byte order and are not
/// portable; a mismatch is reported but not fatal.
pub(crate) fn platform_format_version() -> u32 {
    let endian: u32 = if cfg!(target_endian = "little") { 1 } else { 2 };
    let coord_width = std::mem::size_of::<CoordType>() as u32;
    let pointer_width = std::mem::size_of::<usize>() as u32;
    (pointer_width << 16) | (coord_width << 8) | endian
}

/// The named versioning record at the start of every memdisk file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MemDiskHeader {
    pub magic: u32,
    pub struct_version: u32,
    pub platform_format_version: u32,
    /// Page of the root node; 0 while the tree is empty.
    pub root_page: u64,
    pub next_page_id: u64,
    pub value_count: u64,
    pub root_mbr: Box3D,
}

impl MemDiskHeader {
    pub fn new() -> Self {
        Self {
            magic: MEMDISK_MAGIC,
            struct_version: STRUCT_VERSION,
            platform_format_version: platform_format_version(),
            root_page: 0,
            next_page_id: 1,
            value_count: 0,
            root_mbr: Box3D::empty(),
        }
    }

    pub fn validate(&self) -> IndexResult<()> {
        if self.magic != MEMDISK_MAGIC {
            return Err(IndexError::InvalidArgument(
                "not a memdisk index file (bad magic)".into(),
            ));
        }
        if self.struct_version != STRUCT_VERSION {
            return Err(IndexError::VersionMismatch {
                expected: STRUCT_VERSION,
                found: self.struct_version,
            });
        }
        if self.platform_format_version != platform_format_version() {
            log::warn!(
                "memdisk platform format mismatch: expected {:#x}, found {:#x}; \
                 the file may not load correctly on this platform",
                platform_format_version(),
                self.platform_format_version
            );
        }
        Ok(())
    }
}

/// Reads and writes pages one at a time; no preloading.
pub(crate) struct PageFile {
    file: RwLock<File>,
}

impl PageFile {
    /// Creates the backing file, pre-allocating `size_mb` MiB. An existing
    /// file at `path` is replaced.
    pub fn create(path: &Path, size_mb: usize) -> IndexResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((size_mb * 1024 * 1024) as u64)?;
        Ok(Self {
            file: RwLock::new(file),
        })
    }

    pub fn open(path: &Path) -> IndexResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: RwLock::new(file),
        })
    }

    pub fn read_header(&self) -> IndexResult<MemDiskHeader> {
        let bytes = self.read_page_bytes(0)?;
        bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
            .map(|(header, _)| header)
            .map_err(IndexError::serialization)
    }

    pub fn write_header(&self, header: &MemDiskHeader) -> IndexResult<()> {
        let bytes = bincode::serde::encode_to_vec(header, bincode::config::legacy())
            .map_err(IndexError::serialization)?;
        self.write_page_bytes(0, bytes)
    }

    /// One seek and one read of exactly one page.
    pub fn read_page_bytes(&self, page_id: u64) -> IndexResult<Vec<u8>> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(page_id * PAGE_SIZE as u64))?;
        let mut buffer = vec![0u8; PAGE_SIZE];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    pub fn write_page_bytes(&self, page_id: u64, bytes: Vec<u8>) -> IndexResult<()> {
        if bytes.len() > PAGE_SIZE {
            return Err(IndexError::Serialization(format!(
                "node too large for one page: {} bytes (max {})",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let mut padded = bytes;
        padded.resize(PAGE_SIZE, 0);

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(page_id * PAGE_SIZE as u64))?;
        file.write_all(&padded)?;
        Ok(())
    }

    pub fn sync(&self) -> IndexResult<()> {
        self.file.write().sync_all()?;
        Ok(())
    }

    /// Truncates the file to `n_pages` pages.
    pub fn shrink_to(&self, n_pages: u64) -> IndexResult<()> {
        self.file.write().set_len(n_pages * PAGE_SIZE as u64)?;
        Ok(())
    }
}
