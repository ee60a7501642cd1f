//! Disk buffer statistics.

use std::fmt::Display;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};

use enum_map::{Enum, EnumMap};
use mdbox_storage::metrics::{DISK_BUFFER_HIT, DISK_BUFFER_MISS};
use metrics::counter;

/// Whether a lookup in the disk buffer was a hit or a miss.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum CacheAccess {
    /// The payload was in memory.
    Hit,

    /// The payload had to be read from the backing file.
    Miss,
}

impl Display for CacheAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hit => write!(f, "cache hits"),
            Self::Miss => write!(f, "cache misses"),
        }
    }
}

/// Counters that can be updated from many threads at once.
#[derive(Debug, Default)]
pub(super) struct AtomicDiskBufferStats {
    accesses: EnumMap<CacheAccess, AtomicAccessCounts>,
    boxes_flushed: AtomicU64,
    values_flushed: AtomicU64,
    failed_flushes: AtomicU64,
}

#[derive(Debug, Default)]
struct AtomicAccessCounts {
    count: AtomicU64,
    values: AtomicU64,
}

impl AtomicDiskBufferStats {
    /// Records an access to a box of `values` values.
    pub(super) fn record(&self, access: CacheAccess, values: usize) {
        let counts = &self.accesses[access];
        counts.count.fetch_add(1, Ordering::Relaxed);
        counts.values.fetch_add(values as u64, Ordering::Relaxed);
        match access {
            CacheAccess::Hit => counter!(DISK_BUFFER_HIT).increment(1),
            CacheAccess::Miss => counter!(DISK_BUFFER_MISS).increment(1),
        }
    }

    pub(super) fn record_flush(&self, boxes: usize, values: u64) {
        self.boxes_flushed.fetch_add(boxes as u64, Ordering::Relaxed);
        self.values_flushed.fetch_add(values, Ordering::Relaxed);
    }

    pub(super) fn record_failed_flush(&self) {
        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn read(&self) -> DiskBufferStats {
        DiskBufferStats {
            accesses: EnumMap::from_fn(|access| {
                let counts: &AtomicAccessCounts = &self.accesses[access];
                AccessCounts {
                    count: counts.count.load(Ordering::Relaxed),
                    values: counts.values.load(Ordering::Relaxed),
                }
            }),
            boxes_flushed: self.boxes_flushed.load(Ordering::Relaxed),
            values_flushed: self.values_flushed.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
        }
    }
}

/// Number and total size of accesses of one kind.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessCounts {
    pub count: u64,

    /// Total values across the accessed boxes.
    pub values: u64,
}

impl AddAssign for AccessCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.count += rhs.count;
        self.values += rhs.values;
    }
}

/// A snapshot of disk buffer activity.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskBufferStats {
    pub accesses: EnumMap<CacheAccess, AccessCounts>,

    /// Boxes written to the backing file.
    pub boxes_flushed: u64,

    /// Values written to the backing file.
    pub values_flushed: u64,

    /// Flush attempts that failed with an I/O error.
    pub failed_flushes: u64,
}

impl DiskBufferStats {
    pub fn hits(&self) -> u64 {
        self.accesses[CacheAccess::Hit].count
    }

    pub fn misses(&self) -> u64 {
        self.accesses[CacheAccess::Miss].count
    }

    /// Fraction of lookups served from memory, or `None` before any lookup.
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits() + self.misses();
        (total > 0).then(|| self.hits() as f64 / total as f64)
    }
}

impl Add for DiskBufferStats {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self::Output {
        self.add_assign(rhs);
        self
    }
}

impl AddAssign for DiskBufferStats {
    fn add_assign(&mut self, rhs: Self) {
        for (access, counts) in &mut self.accesses {
            *counts += rhs.accesses[access];
        }
        self.boxes_flushed += rhs.boxes_flushed;
        self.values_flushed += rhs.values_flushed;
        self.failed_flushes += rhs.failed_flushes;
    }
}
