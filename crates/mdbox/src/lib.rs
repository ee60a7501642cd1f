//! Out-of-core caching for multidimensional event datasets that do not fit
//! in memory.
//!
//! A dataset is a tree of boxes that split as they fill.  The pieces are:
//!
//! - [BoxController]: splitting policy, box-ID allocation, and per-depth
//!   box counts for one dataset.
//!
//! - [DiskBuffer]: a write-behind cache of box payloads over a backing file,
//!   with LRU eviction, batched write-back, and reuse of freed file space.
//!
//! - [MruList]: a bounded most-recently-used container, and
//!   [DerivedValueCache], which keeps one such container per worker thread
//!   for per-spectrum derived vectors.
//!
//! - [MutexScheduler] and [WorkerPool]: cost-ordered background tasks, with
//!   mutual exclusion between tasks of the same [MutexGroup], for example
//!   flushes of one backing file.

pub mod box_controller;
pub mod config;
pub mod derived_cache;
pub mod disk_buffer;
pub mod error;
pub mod mru;
pub mod scheduler;


/// Identifies a box within one dataset.
pub type BoxId = u64;

pub use box_controller::BoxController;
pub use config::{BoxControllerConfig, CacheConfig, StorageCacheConfig};
pub use derived_cache::{DerivedValueCache, DerivedVector, Quantity};
pub use disk_buffer::{DiskBuffer, DiskBufferStats, FlushStats, FlushTicket, Payload, Pinned};
pub use error::Error;
pub use mru::MruList;
pub use scheduler::{FnTask, MutexGroup, MutexScheduler, Task, WorkerPool};

pub use mdbox_storage as storage;
