//! Storage metrics.
//!
//! The constants defined in this module are the names of metrics that record
//! files and the disk buffer maintain via [`metrics`] crate interfaces.
use ::metrics::{describe_counter, describe_histogram, Unit};
use std::sync::Once;

/// Total number of successful disk writes.
pub const WRITES_SUCCESS: &str = "disk.total_writes_success";

/// Total number of failed disk writes.
pub const WRITES_FAILED: &str = "disk.total_writes_failed";

/// Total number of successful disk reads.
pub const READS_SUCCESS: &str = "disk.total_reads_success";

/// Total number of failed disk reads.
pub const READS_FAILED: &str = "disk.total_reads_failed";

/// Total number of bytes successfully written.
pub const TOTAL_BYTES_WRITTEN: &str = "disk.total_bytes_written";

/// Total number of bytes successfully read.
pub const TOTAL_BYTES_READ: &str = "disk.total_bytes_read";

/// Histogram of read latency.
pub const READ_LATENCY: &str = "disk.read_latency";

/// Histogram of write latency.
pub const WRITE_LATENCY: &str = "disk.write_latency";

/// Total number of disk buffer hits.
pub const DISK_BUFFER_HIT: &str = "disk.buffer_hit";

/// Total number of disk buffer misses.
pub const DISK_BUFFER_MISS: &str = "disk.buffer_miss";

/// Total number of boxes written out by flushes.
pub const BOXES_FLUSHED: &str = "disk.boxes_flushed";

/// Number of boxes per flush batch.
pub const FLUSH_BATCH_SIZE: &str = "disk.flush_batch_size";

/// Adds descriptions for the metrics we expose.
///
/// Idempotent.
pub fn describe_disk_metrics() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        describe_counter!(WRITES_SUCCESS, "total number of disk writes");
        describe_counter!(WRITES_FAILED, "total number of failed writes");
        describe_counter!(READS_SUCCESS, "total number of disk reads");
        describe_counter!(READS_FAILED, "total number of failed reads");

        describe_counter!(
            TOTAL_BYTES_WRITTEN,
            Unit::Bytes,
            "total number of bytes written to disk"
        );
        describe_counter!(
            TOTAL_BYTES_READ,
            Unit::Bytes,
            "total number of bytes read from disk"
        );

        describe_histogram!(READ_LATENCY, Unit::Seconds, "Read request latency");
        describe_histogram!(WRITE_LATENCY, Unit::Seconds, "Write request latency");

        describe_counter!(DISK_BUFFER_HIT, "total number of disk buffer hits");
        describe_counter!(DISK_BUFFER_MISS, "total number of disk buffer misses");
        describe_counter!(BOXES_FLUSHED, "total number of boxes flushed to disk");
        describe_histogram!(
            FLUSH_BATCH_SIZE,
            Unit::Count,
            "Number of boxes written by one flush"
        );
    });
}
