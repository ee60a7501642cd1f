//! Record-file storage for the mdbox box cache.
//!
//! This crate is the block layer underneath the disk buffer: a
//! [`RecordFile`] trait for positioned reads and writes against one backing
//! file, a [`FreeSpaceMap`] that tracks reusable extents of that file, and
//! two implementations of the trait, [`PosixFile`] and [`MemoryFile`].

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub mod error;
pub mod free_space;
pub mod memory;
pub mod metrics;
#[cfg(unix)]
pub mod posixio;

pub use error::StorageError;
pub use free_space::FreeSpaceMap;
pub use memory::MemoryFile;
#[cfg(unix)]
pub use posixio::PosixFile;

/// A contiguous range of a file.
///
/// The unit is chosen by the owner: the storage layer itself always talks
/// in bytes, while the disk buffer keeps its extents in values and converts
/// at the boundary.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Extent {
    /// Start of the range.
    pub offset: u64,

    /// Length of the range.
    pub len: u64,
}

impl Extent {
    pub const fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// One past the last unit covered.
    pub const fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Converts an extent measured in records of `record_size` bytes to
    /// bytes.
    pub const fn to_bytes(&self, record_size: u64) -> Self {
        Self {
            offset: self.offset * record_size,
            len: self.len * record_size,
        }
    }
}

impl Display for Extent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Alignment of file offsets, transfer lengths, and memory buffers for
/// [StorageCacheConfig::DirectIo].  A multiple of every common logical block
/// size.
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

/// How to cache access to a backing file.
#[derive(Copy, Clone, Default, Deserialize, Serialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageCacheConfig {
    /// Use the operating system's page cache underneath the disk buffer.
    #[default]
    PageCache,

    /// Bypass the page cache, so that the disk buffer is the only cache.
    /// Transfers are widened to whole [DIRECT_IO_ALIGNMENT] blocks.
    DirectIo,
}

impl StorageCacheConfig {
    #[cfg(unix)]
    pub fn to_custom_open_flags(&self) -> i32 {
        match self {
            StorageCacheConfig::PageCache => (),
            StorageCacheConfig::DirectIo => {
                #[cfg(target_os = "linux")]
                return libc::O_DIRECT;
            }
        }
        0
    }
}

/// A file addressed by byte offset, shared by every thread that flushes or
/// loads boxes.
pub trait RecordFile: Send + Sync {
    /// Reads exactly `location.len` bytes at `location.offset`.  Reading
    /// past the end of the file is an error rather than a short result.
    fn read_at(&self, location: Extent) -> Result<Vec<u8>, StorageError>;

    /// Writes `data` at byte `offset`, extending the file if needed.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.write_vectored(offset, &[data])
    }

    /// Writes the concatenation of `bufs` starting at byte `offset`.
    fn write_vectored(&self, offset: u64, bufs: &[&[u8]]) -> Result<(), StorageError>;

    /// Returns the file's size in bytes.
    fn len(&self) -> Result<u64, StorageError>;

    /// Returns true if the file holds no bytes.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Flushes written data to stable storage.
    fn sync(&self) -> Result<(), StorageError>;
}
