//! [RecordFile] implementation using POSIX I/O.

use metrics::{counter, histogram};
use std::{
    fs::{File, OpenOptions},
    io::IoSlice,
    os::unix::fs::{FileExt, OpenOptionsExt},
    path::{Path, PathBuf},
    sync::{LazyLock, Mutex},
    time::Instant,
};
use tracing::debug;

use crate::metrics::{
    describe_disk_metrics, READS_FAILED, READS_SUCCESS, READ_LATENCY, TOTAL_BYTES_READ,
    TOTAL_BYTES_WRITTEN, WRITES_FAILED, WRITES_SUCCESS, WRITE_LATENCY,
};
use crate::{Extent, RecordFile, StorageCacheConfig, StorageError, DIRECT_IO_ALIGNMENT};

/// Maximum number of buffers the kernel accepts in one `pwritev`.
pub static IOV_MAX: LazyLock<usize> = LazyLock::new(|| {
    use nix::unistd::{sysconf, SysconfVar};

    sysconf(SysconfVar::IOV_MAX)
        .ok()
        .flatten()
        .and_then(|limit| usize::try_from(limit).ok())
        .filter(|&limit| limit > 0)
        .unwrap_or(1024)
});

/// A zeroed byte buffer whose start is aligned to [DIRECT_IO_ALIGNMENT].
struct AlignedBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    fn zeroed(len: usize) -> Self {
        let storage = vec![0; len + DIRECT_IO_ALIGNMENT];
        let start = storage
            .as_ptr()
            .align_offset(DIRECT_IO_ALIGNMENT)
            .min(DIRECT_IO_ALIGNMENT);
        Self {
            storage,
            start,
            len,
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }
}

/// Rounds `offset` down and `end` up to block boundaries.
fn aligned_range(offset: u64, end: u64) -> (u64, u64) {
    let block = DIRECT_IO_ALIGNMENT as u64;
    (offset / block * block, end.div_ceil(block) * block)
}

/// A backing file accessed with positioned reads and writes.
///
/// All operations take `&self`: `pread`/`pwrite` carry their own offsets,
/// so concurrent readers never contend on a shared cursor.
///
/// With [StorageCacheConfig::DirectIo], every transfer goes through an
/// aligned buffer covering whole blocks.  Writes read back the partial
/// blocks at either end and are serialized among themselves, and the file
/// keeps the length the caller wrote rather than a whole number of blocks.
#[derive(Debug)]
pub struct PosixFile {
    file: File,
    path: PathBuf,
    cache: StorageCacheConfig,

    /// Held across the read-modify-write of a direct write.
    direct_writes: Mutex<()>,
}

impl PosixFile {
    /// Creates a new, empty file at `path`.  Fails if the file exists.
    pub fn create<P: AsRef<Path>>(path: P, cache: StorageCacheConfig) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .custom_flags(cache.to_custom_open_flags())
            .open(&path)?;
        describe_disk_metrics();
        debug!("created backing file {} ({cache:?})", path.display());
        Ok(Self::new(file, path, cache))
    }

    /// Opens an existing file at `path` for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P, cache: StorageCacheConfig) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(cache.to_custom_open_flags())
            .open(&path)?;
        describe_disk_metrics();
        debug!("opened backing file {} ({cache:?})", path.display());
        Ok(Self::new(file, path, cache))
    }

    fn new(file: File, path: PathBuf, cache: StorageCacheConfig) -> Self {
        Self {
            file,
            path,
            cache,
            direct_writes: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cache(&self) -> StorageCacheConfig {
        self.cache
    }

    fn is_direct(&self) -> bool {
        self.cache == StorageCacheConfig::DirectIo
    }

    fn write_vectored_inner(&self, offset: u64, bufs: &[&[u8]]) -> Result<usize, StorageError> {
        if self.is_direct() {
            return self.write_direct(offset, bufs);
        }
        let mut total = 0;
        for chunk in bufs.chunks(*IOV_MAX) {
            total += self.write_chunk(offset + total as u64, chunk)?;
        }
        Ok(total)
    }

    /// Writes at most [IOV_MAX] buffers.
    fn write_chunk(&self, offset: u64, bufs: &[&[u8]]) -> Result<usize, StorageError> {
        use nix::sys::uio::pwritev;

        let total = bufs.iter().map(|buf| buf.len()).sum::<usize>();
        let slices: Vec<_> = bufs.iter().map(|buf| IoSlice::new(buf)).collect();
        let written = pwritev(&self.file, &slices, offset as i64)?;

        // `pwritev` may stop early; finish off what's left one buffer at a
        // time.
        let mut skip = written;
        let mut position = offset + written as u64;
        for buf in bufs {
            if skip >= buf.len() {
                skip -= buf.len();
                continue;
            }
            let rest = &buf[skip..];
            self.file.write_all_at(rest, position)?;
            position += rest.len() as u64;
            skip = 0;
        }
        Ok(total)
    }

    /// Reads whole blocks starting at aligned `offset`, stopping at the end of
    /// the file.  Returns the number of bytes read.
    fn read_blocks(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            filled += n;
            // Anything short of a whole block means the end of the file.
            if n == 0 || filled % DIRECT_IO_ALIGNMENT != 0 {
                break;
            }
        }
        Ok(filled)
    }

    fn read_direct(&self, location: Extent) -> Result<Vec<u8>, StorageError> {
        let (start, end) = aligned_range(location.offset, location.end());
        let mut block = AlignedBuf::zeroed((end - start) as usize);
        let filled = self.read_blocks(block.as_mut_slice(), start)?;
        let head = (location.offset - start) as usize;
        let wanted = head + location.len as usize;
        if filled < wanted {
            return Err(StorageError::ShortRead);
        }
        Ok(block.as_slice()[head..wanted].to_vec())
    }

    fn write_direct(&self, offset: u64, bufs: &[&[u8]]) -> Result<usize, StorageError> {
        let total = bufs.iter().map(|buf| buf.len()).sum::<usize>();
        if total == 0 {
            return Ok(0);
        }
        let _guard = self.direct_writes.lock().unwrap();
        let write_end = offset + total as u64;
        let (start, end) = aligned_range(offset, write_end);
        let old_len = self.file.metadata()?.len();
        let mut block = AlignedBuf::zeroed((end - start) as usize);

        // The first and last blocks may hold bytes outside the write.
        let head = (offset - start) as usize;
        if head > 0 {
            self.read_blocks(&mut block.as_mut_slice()[..DIRECT_IO_ALIGNMENT], start)?;
        }
        let last = (end - start) as usize - DIRECT_IO_ALIGNMENT;
        if write_end < end && (last > 0 || head == 0) {
            self.read_blocks(
                &mut block.as_mut_slice()[last..],
                start + last as u64,
            )?;
        }

        let mut position = head;
        for buf in bufs {
            block.as_mut_slice()[position..position + buf.len()].copy_from_slice(buf);
            position += buf.len();
        }
        self.file.write_all_at(block.as_slice(), start)?;

        let new_len = old_len.max(write_end);
        if end > new_len {
            self.file.set_len(new_len)?;
        }
        Ok(total)
    }
}

impl RecordFile for PosixFile {
    fn read_at(&self, location: Extent) -> Result<Vec<u8>, StorageError> {
        let request_start = Instant::now();
        let result = if self.is_direct() {
            self.read_direct(location)
        } else {
            let mut buffer = vec![0; location.len as usize];
            self.file
                .read_exact_at(&mut buffer, location.offset)
                .map(|()| buffer)
                .map_err(|error| {
                    if error.kind() == std::io::ErrorKind::UnexpectedEof {
                        StorageError::ShortRead
                    } else {
                        error.into()
                    }
                })
        };
        match result {
            Ok(buffer) => {
                counter!(TOTAL_BYTES_READ).increment(location.len);
                counter!(READS_SUCCESS).increment(1);
                histogram!(READ_LATENCY).record(request_start.elapsed().as_secs_f64());
                Ok(buffer)
            }
            Err(error) => {
                counter!(READS_FAILED).increment(1);
                Err(error)
            }
        }
    }

    fn write_vectored(&self, offset: u64, bufs: &[&[u8]]) -> Result<(), StorageError> {
        let request_start = Instant::now();
        match self.write_vectored_inner(offset, bufs) {
            Ok(total) => {
                counter!(TOTAL_BYTES_WRITTEN).increment(total as u64);
                counter!(WRITES_SUCCESS).increment(1);
                histogram!(WRITE_LATENCY).record(request_start.elapsed().as_secs_f64());
                Ok(())
            }
            Err(error) => {
                counter!(WRITES_FAILED).increment(1);
                Err(error)
            }
        }
    }

    fn len(&self) -> Result<u64, StorageError> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&self) -> Result<(), StorageError> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{PosixFile, IOV_MAX};
    use crate::{Extent, RecordFile, StorageCacheConfig, StorageError, DIRECT_IO_ALIGNMENT};

    /// Opens a direct-I/O file, or returns `None` where the filesystem
    /// under the temporary directory does not support `O_DIRECT`.
    fn direct_file(dir: &Path) -> Option<PosixFile> {
        match PosixFile::create(dir.join("direct.bin"), StorageCacheConfig::DirectIo) {
            Ok(file) => Some(file),
            Err(error) => {
                eprintln!("skipping, direct I/O unavailable: {error}");
                None
            }
        }
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = PosixFile::create(dir.path().join("boxes.bin"), StorageCacheConfig::default())
            .unwrap();
        file.write_at(0, b"hello").unwrap();
        file.write_vectored(5, &[b", ", b"world"]).unwrap();
        assert_eq!(file.len().unwrap(), 12);
        assert_eq!(file.read_at(Extent::new(0, 12)).unwrap(), b"hello, world");
        assert_eq!(file.read_at(Extent::new(7, 5)).unwrap(), b"world");
    }

    #[test]
    fn read_past_end_is_short() {
        let dir = tempfile::tempdir().unwrap();
        let file = PosixFile::create(dir.path().join("boxes.bin"), StorageCacheConfig::default())
            .unwrap();
        file.write_at(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            file.read_at(Extent::new(2, 4)).unwrap_err(),
            StorageError::ShortRead
        );
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boxes.bin");
        PosixFile::create(&path, StorageCacheConfig::default()).unwrap();
        assert!(PosixFile::create(&path, StorageCacheConfig::default()).is_err());
        let reopened = PosixFile::open(&path, StorageCacheConfig::default()).unwrap();
        assert!(reopened.is_empty().unwrap());
    }

    #[test]
    fn more_buffers_than_iov_max() {
        let dir = tempfile::tempdir().unwrap();
        let file = PosixFile::create(dir.path().join("boxes.bin"), StorageCacheConfig::default())
            .unwrap();
        let n = *IOV_MAX * 2 + 7;
        let values: Vec<[u8; 2]> = (0..n).map(|i| (i as u16).to_le_bytes()).collect();
        let bufs: Vec<&[u8]> = values.iter().map(|value| value.as_slice()).collect();
        file.write_vectored(10, &bufs).unwrap();
        assert_eq!(file.len().unwrap(), 10 + 2 * n as u64);
        let last = n - 1;
        assert_eq!(
            file.read_at(Extent::new(10 + 2 * last as u64, 2)).unwrap(),
            (last as u16).to_le_bytes()
        );
        assert_eq!(
            file.read_at(Extent::new(10 + 2 * *IOV_MAX as u64, 2)).unwrap(),
            (*IOV_MAX as u16).to_le_bytes()
        );
    }

    #[test]
    fn direct_io_unaligned_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let Some(file) = direct_file(dir.path()) else {
            return;
        };
        assert_eq!(file.cache(), StorageCacheConfig::DirectIo);
        file.write_at(0, b"hello").unwrap();
        file.write_vectored(5, &[b", ", b"world"]).unwrap();
        assert_eq!(file.len().unwrap(), 12);
        assert_eq!(file.read_at(Extent::new(7, 5)).unwrap(), b"world");

        // Straddle a block boundary, leaving a hole before it.
        let offset = DIRECT_IO_ALIGNMENT as u64 - 3;
        file.write_at(offset, b"abcdef").unwrap();
        assert_eq!(file.len().unwrap(), offset + 6);
        assert_eq!(file.read_at(Extent::new(offset, 6)).unwrap(), b"abcdef");
        assert_eq!(file.read_at(Extent::new(0, 12)).unwrap(), b"hello, world");
        assert_eq!(file.read_at(Extent::new(12, 4)).unwrap(), [0u8; 4]);

        // Rewrite in the middle without disturbing the neighbours.
        file.write_at(2, b"LL").unwrap();
        assert_eq!(file.read_at(Extent::new(0, 12)).unwrap(), b"heLLo, world");
        assert_eq!(file.len().unwrap(), offset + 6);
        assert_eq!(
            file.read_at(Extent::new(offset, 7)).unwrap_err(),
            StorageError::ShortRead
        );
    }
}
