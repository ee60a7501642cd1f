//! Per-thread caches of derived per-spectrum vectors.
//!
//! Each worker thread gets its own [MruList] for each [Quantity], so that
//! threads computing derived values for different spectra never contend on
//! the same lock.  A vector that a reader has pinned is never dropped by the
//! cache: if it is evicted or invalidated while pinned, it moves to a pending
//! list that [DerivedValueCache::clear] drains once the pin is released.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use enum_map::{Enum, EnumMap};
use tracing::debug;

use crate::mru::MruList;
use crate::Error;

/// Default number of vectors cached per thread and quantity.
pub const DEFAULT_CAPACITY: usize = 50;

/// The derived quantities kept per spectrum.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum Quantity {
    /// Signal-like values.
    Y,

    /// Error-like values.
    E,
}

/// A derived vector for one spectrum.
#[derive(Debug)]
pub struct DerivedVector {
    index: usize,
    values: Vec<f64>,
    pinned: AtomicBool,
}

impl DerivedVector {
    pub fn new(index: usize, values: Vec<f64>) -> Self {
        Self {
            index,
            values,
            pinned: AtomicBool::new(false),
        }
    }

    /// The spectrum this vector was derived from.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Marks the vector as being read.
    pub fn pin(&self) {
        self.pinned.store(true, Ordering::Release);
    }

    pub fn unpin(&self) {
        self.pinned.store(false, Ordering::Release);
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }
}

type ThreadBuffer = MruList<usize, Arc<DerivedVector>>;

struct QuantityCache {
    /// One list per worker thread, indexed by thread number.
    buffers: RwLock<Vec<Arc<ThreadBuffer>>>,

    /// Vectors evicted or invalidated while pinned.
    pending: Mutex<Vec<Arc<DerivedVector>>>,
}

impl QuantityCache {
    fn new() -> Self {
        Self {
            buffers: RwLock::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn buffer(&self, thread_num: usize) -> Option<Arc<ThreadBuffer>> {
        self.buffers.read().unwrap().get(thread_num).cloned()
    }

    fn retire(&self, vector: Arc<DerivedVector>) {
        if vector.is_pinned() {
            self.pending.lock().unwrap().push(vector);
        }
    }
}

/// Per-thread MRU caches for each [Quantity].
pub struct DerivedValueCache {
    quantities: EnumMap<Quantity, QuantityCache>,
    capacity: NonZeroUsize,
}

impl Default for DerivedValueCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap())
    }
}

impl DerivedValueCache {
    /// Creates a cache whose per-thread lists each hold up to `capacity`
    /// vectors.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            quantities: EnumMap::from_fn(|_| QuantityCache::new()),
            capacity,
        }
    }

    /// Makes sure that thread `thread_num` has a list for every quantity.
    pub fn ensure_enough_buffers(&self, thread_num: usize) {
        for (quantity, cache) in &self.quantities {
            if cache.buffers.read().unwrap().len() > thread_num {
                continue;
            }
            let mut buffers = cache.buffers.write().unwrap();
            if buffers.len() <= thread_num {
                debug!(
                    "growing {quantity:?} cache from {} to {} threads",
                    buffers.len(),
                    thread_num + 1
                );
                buffers.resize_with(thread_num + 1, || Arc::new(MruList::new(self.capacity)));
            }
        }
    }

    /// Number of threads with lists for `quantity`.
    pub fn num_buffers(&self, quantity: Quantity) -> usize {
        self.quantities[quantity].buffers.read().unwrap().len()
    }

    /// Looks up the vector of `quantity` for spectrum `index` in thread
    /// `thread_num`'s list.
    pub fn find(
        &self,
        quantity: Quantity,
        thread_num: usize,
        index: usize,
    ) -> Option<Arc<DerivedVector>> {
        self.quantities[quantity].buffer(thread_num)?.find(&index)
    }

    /// Caches `vector` in thread `thread_num`'s list for `quantity`.
    ///
    /// Fails if [Self::ensure_enough_buffers] has not been called for the
    /// thread.
    pub fn insert(
        &self,
        quantity: Quantity,
        thread_num: usize,
        vector: Arc<DerivedVector>,
    ) -> Result<(), Error> {
        let cache = &self.quantities[quantity];
        let buffer = cache.buffer(thread_num).ok_or(Error::OutOfRange {
            what: "thread number",
            index: thread_num,
            limit: self.num_buffers(quantity),
        })?;
        if let Some((_, evicted)) = buffer.insert(vector.index(), vector) {
            cache.retire(evicted);
        }
        Ok(())
    }

    /// Invalidates spectrum `index` in every thread's lists for every
    /// quantity.
    pub fn delete_index(&self, index: usize) {
        for cache in self.quantities.values() {
            let buffers = cache.buffers.read().unwrap().clone();
            for buffer in buffers {
                if let Some(vector) = buffer.delete_index(&index) {
                    cache.retire(vector);
                }
            }
        }
    }

    /// Empties every list and drops pending vectors that are no longer
    /// pinned.  Vectors still pinned stay pending.
    pub fn clear(&self) {
        for cache in self.quantities.values() {
            let buffers = cache.buffers.read().unwrap().clone();
            for buffer in buffers {
                for (_, vector) in buffer.drain() {
                    cache.retire(vector);
                }
            }
            cache
                .pending
                .lock()
                .unwrap()
                .retain(|vector| vector.is_pinned());
        }
    }

    /// Number of vectors awaiting deletion because they were pinned when
    /// they left the cache.
    pub fn pending_deletions(&self) -> usize {
        self.quantities
            .values()
            .map(|cache| cache.pending.lock().unwrap().len())
            .sum()
    }
}
