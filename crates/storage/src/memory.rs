//! Implementation of [RecordFile] using memory.
//!
//! This is useful for testing the disk buffer without touching the
//! filesystem, not as part of a production system.  It can also be told to
//! fail writes or reads, to exercise error propagation.

use metrics::counter;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    RwLock,
};

use crate::metrics::{
    describe_disk_metrics, READS_FAILED, READS_SUCCESS, TOTAL_BYTES_READ, TOTAL_BYTES_WRITTEN,
    WRITES_FAILED, WRITES_SUCCESS,
};
use crate::{Extent, RecordFile, StorageError};

#[derive(Debug, Default)]
pub struct MemoryFile {
    data: RwLock<Vec<u8>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    n_writes: AtomicUsize,
    n_reads: AtomicUsize,
}

impl MemoryFile {
    pub fn new() -> Self {
        describe_disk_metrics();
        Self::default()
    }

    /// Makes every subsequent write fail with an I/O error until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Makes every subsequent read fail with an I/O error until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Number of successful calls to [RecordFile::write_vectored] so far.
    pub fn n_writes(&self) -> usize {
        self.n_writes.load(Ordering::Relaxed)
    }

    /// Number of successful calls to [RecordFile::read_at] so far.
    pub fn n_reads(&self) -> usize {
        self.n_reads.load(Ordering::Relaxed)
    }

    /// Returns a copy of the file's contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().unwrap().clone()
    }
}

impl RecordFile for MemoryFile {
    fn read_at(&self, location: Extent) -> Result<Vec<u8>, StorageError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            counter!(READS_FAILED).increment(1);
            return Err(StorageError::StdIo(std::io::ErrorKind::Other));
        }
        let data = self.data.read().unwrap();
        let len = data.len() as u64;
        if location.end() > len {
            counter!(READS_FAILED).increment(1);
            return Err(StorageError::ShortRead);
        }
        self.n_reads.fetch_add(1, Ordering::Relaxed);
        counter!(TOTAL_BYTES_READ).increment(location.len);
        counter!(READS_SUCCESS).increment(1);
        Ok(data[location.offset as usize..location.end() as usize].to_vec())
    }

    fn write_vectored(&self, offset: u64, bufs: &[&[u8]]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            counter!(WRITES_FAILED).increment(1);
            return Err(StorageError::StdIo(std::io::ErrorKind::Other));
        }
        let total = bufs.iter().map(|buf| buf.len()).sum::<usize>();
        let mut data = self.data.write().unwrap();
        let end = offset as usize + total;
        if data.len() < end {
            data.resize(end, 0);
        }
        let mut position = offset as usize;
        for buf in bufs {
            data[position..position + buf.len()].copy_from_slice(buf);
            position += buf.len();
        }
        self.n_writes.fetch_add(1, Ordering::Relaxed);
        counter!(TOTAL_BYTES_WRITTEN).increment(total as u64);
        counter!(WRITES_SUCCESS).increment(1);
        Ok(())
    }

    fn len(&self) -> Result<u64, StorageError> {
        Ok(self.data.read().unwrap().len() as u64)
    }

    fn sync(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryFile;
    use crate::{Extent, RecordFile, StorageError};

    #[test]
    fn holes_read_as_zero() {
        let file = MemoryFile::new();
        file.write_at(4, &[9, 9]).unwrap();
        assert_eq!(file.contents(), vec![0, 0, 0, 0, 9, 9]);
        assert_eq!(file.read_at(Extent::new(3, 2)).unwrap(), vec![0, 9]);
    }

    #[test]
    fn injected_failures() {
        let file = MemoryFile::new();
        file.set_fail_writes(true);
        assert!(matches!(file.write_at(0, &[1]), Err(StorageError::StdIo(_))));
        assert_eq!(file.n_writes(), 0);
        file.set_fail_writes(false);
        file.write_at(0, &[1]).unwrap();
        file.set_fail_reads(true);
        assert!(file.read_at(Extent::new(0, 1)).is_err());
    }
}
