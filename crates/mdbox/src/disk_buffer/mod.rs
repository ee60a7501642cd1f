//! A write-behind cache of box payloads over one backing file.
//!
//! Boxes enter memory either through [DiskBuffer::to_write], which stages a
//! modified payload as dirty, or through [DiskBuffer::load_required], which
//! reads a clean copy from the box's extent in the backing file.  Both count
//! against one budget, the write buffer size, measured in values.  When the
//! budget is exceeded, boxes leave memory in least-recently-used order:
//! clean copies are simply dropped, dirty ones are written back in a single
//! batch first.  Boxes pinned by a reader are skipped, so the buffer may sit
//! above budget until they are released.
//!
//! A dirty box only becomes clean through a successful write.  If the write
//! fails, the box stays dirty in memory and the error goes back to whoever
//! triggered the eviction, and the next eviction tries again.
//!
//! Extents in the backing file are measured in values.  Space released by
//! relocated or deleted boxes goes into a [FreeSpaceMap] and is reused by
//! later writes; free space at the end of the file shrinks the file instead.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug};
use std::ops::Deref;
#[cfg(unix)]
use std::path::Path;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{bounded, Receiver, Sender};
use mdbox_storage::metrics::{BOXES_FLUSHED, FLUSH_BATCH_SIZE};
#[cfg(unix)]
use mdbox_storage::PosixFile;
use mdbox_storage::{Extent, FreeSpaceMap, RecordFile, StorageCacheConfig};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

mod payload;
mod stats;

pub use payload::Payload;
pub use stats::{AccessCounts, CacheAccess, DiskBufferStats};
use stats::AtomicDiskBufferStats;

use crate::config::CacheConfig;
use crate::scheduler::{MutexGroup, MutexScheduler, Task};
use crate::{BoxId, Error};

/// Outcome of one write-back.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Boxes written.
    pub boxes: usize,

    /// Values written across those boxes.
    pub values: u64,

    /// Calls to the backing file, after coalescing adjacent extents.
    pub writes: usize,
}

struct Entry<P> {
    payload: Arc<P>,
    num_values: usize,
    dirty: bool,

    /// Serial number for LRU purposes.
    serial: u64,

    /// Readers currently holding a [Pinned] guard.
    pins: usize,
}

/// Where a box is persisted, and which write put it there.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Persisted {
    extent: Extent,
    generation: u64,
}

struct Inner<P> {
    /// Payloads held in memory, clean or dirty.
    entries: HashMap<BoxId, Entry<P>>,

    /// Map from LRU serial number to box.  The smallest serial number was
    /// least recently used.
    lru: BTreeMap<u64, BoxId>,

    /// Serial number to use the next time we touch a box.
    next_serial: u64,

    /// Where each persisted box lives in the backing file.
    extents: HashMap<BoxId, Persisted>,

    /// Generation to stamp on the next persisted box.
    next_generation: u64,

    free_space: FreeSpaceMap,

    /// Length of the backing file, in values.
    file_length: u64,

    file: Option<Arc<dyn RecordFile>>,

    /// Sum of `entries[*].num_values`.
    write_buffer_used: usize,

    /// Budget for `write_buffer_used`.
    write_buffer_size: usize,

    value_size: usize,

    /// Write every staged box immediately instead of coalescing.
    write_through: bool,

    /// How backing files opened by the buffer itself use the page cache.
    storage_cache: StorageCacheConfig,
}

impl<P: Payload> Inner<P> {
    fn new(config: &CacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            next_serial: 0,
            extents: HashMap::new(),
            next_generation: 0,
            free_space: FreeSpaceMap::new(),
            file_length: 0,
            file: None,
            write_buffer_used: 0,
            write_buffer_size: config.write_buffer_entries,
            value_size: config.value_size_bytes,
            write_through: false,
            storage_cache: config.storage_cache,
        }
    }

    #[allow(dead_code)]
    fn check_invariants(&self) {
        assert_eq!(self.entries.len(), self.lru.len());
        let mut used = 0;
        for (id, entry) in &self.entries {
            assert_eq!(self.lru.get(&entry.serial), Some(id));
            used += entry.num_values;
        }
        assert_eq!(used, self.write_buffer_used);
        for persisted in self.extents.values() {
            assert!(persisted.extent.end() <= self.file_length);
        }
    }

    fn debug_check_invariants(&self) {
        #[cfg(debug_assertions)]
        self.check_invariants()
    }

    /// Returns the in-memory payload for `id`, marking it most recently used
    /// and optionally pinning it.
    fn lookup(&mut self, id: BoxId, pin: bool) -> Option<(Arc<P>, usize)> {
        let serial = self.next_serial;
        let entry = self.entries.get_mut(&id)?;
        self.lru.remove(&entry.serial);
        entry.serial = serial;
        if pin {
            entry.pins += 1;
        }
        self.lru.insert(serial, id);
        self.next_serial += 1;
        Some((entry.payload.clone(), entry.num_values))
    }

    fn insert_entry(&mut self, id: BoxId, payload: Arc<P>, dirty: bool, pins: usize) {
        let pins = pins + self.remove_entry(id).map_or(0, |old| old.pins);
        let num_values = payload.num_values();
        self.entries.insert(
            id,
            Entry {
                payload,
                num_values,
                dirty,
                serial: self.next_serial,
                pins,
            },
        );
        self.lru.insert(self.next_serial, id);
        self.next_serial += 1;
        self.write_buffer_used += num_values;
    }

    fn remove_entry(&mut self, id: BoxId) -> Option<Entry<P>> {
        let entry = self.entries.remove(&id)?;
        self.lru.remove(&entry.serial);
        self.write_buffer_used -= entry.num_values;
        Some(entry)
    }

    /// Finds room for `len` values, preferring free space over growing the
    /// file.
    fn place(&mut self, len: u64) -> Extent {
        if len == 0 {
            return Extent::default();
        }
        match self.free_space.allocate(len) {
            Some(offset) => Extent::new(offset, len),
            None => {
                let offset = self.file_length;
                self.file_length += len;
                Extent::new(offset, len)
            }
        }
    }

    /// Gives `extent` back, shrinking the file if it ends in free space.
    fn release(&mut self, extent: Extent) -> Result<(), Error> {
        if extent.end() > self.file_length {
            return Err(Error::OutOfRange {
                what: "block end",
                index: extent.end() as usize,
                limit: self.file_length as usize,
            });
        }
        self.free_space.free(extent)?;
        while let Some(tail) = self.free_space.take_tail(self.file_length) {
            self.file_length = tail.offset;
        }
        Ok(())
    }

    /// Writes the in-memory payloads of `ids` to the backing file and marks
    /// them clean.  Either every box is written and recorded, or none is.
    /// Extents replaced by a successful write go back to the free list last.
    fn write_boxes(
        &mut self,
        ids: &[BoxId],
        stats: &AtomicDiskBufferStats,
    ) -> Result<FlushStats, Error> {
        let file = self.file.clone().ok_or(Error::NotFileBacked)?;
        let value_size = self.value_size;

        let mut encoded = Vec::with_capacity(ids.len());
        for &id in ids {
            let entry = self.entries.get(&id).ok_or(Error::NotFound(id))?;
            let mut bytes = Vec::with_capacity(entry.num_values * value_size);
            entry.payload.encode(value_size, &mut bytes)?;
            if bytes.len() != entry.num_values * value_size {
                return Err(Error::invalid(
                    "payload",
                    format!(
                        "box {id} encoded to {} bytes instead of {} values of {value_size} bytes",
                        bytes.len(),
                        entry.num_values
                    ),
                ));
            }
            encoded.push((id, entry.num_values as u64, bytes));
        }

        // Boxes that keep their length are rewritten in place.  The others get
        // fresh space, and their old extents are only released once the new
        // copies are safely written.
        let mut planned = Vec::with_capacity(encoded.len());
        for (id, len, bytes) in encoded {
            let old = self.extents.get(&id).map(|persisted| persisted.extent);
            let new = match old {
                Some(old) if old.len == len => old,
                _ => self.place(len),
            };
            planned.push((id, old, new, bytes));
        }
        planned.sort_by_key(|(_, _, new, _)| new.offset);

        let mut writes = 0;
        let mut result = Ok(());
        let mut run_start = 0;
        while run_start < planned.len() {
            let mut run_end = run_start + 1;
            while run_end < planned.len()
                && planned[run_end - 1].2.end() == planned[run_end].2.offset
            {
                run_end += 1;
            }
            let run = &planned[run_start..run_end];
            let bufs: Vec<&[u8]> = run
                .iter()
                .filter(|(_, _, new, _)| !new.is_empty())
                .map(|(_, _, _, bytes)| bytes.as_slice())
                .collect();
            if !bufs.is_empty() {
                let offset = run[0].2.offset * value_size as u64;
                if let Err(error) = file.write_vectored(offset, &bufs) {
                    result = Err(Error::from(error));
                    break;
                }
                writes += 1;
            }
            run_start = run_end;
        }

        if let Err(error) = result {
            for (_, old, new, _) in &planned {
                if Some(*new) != *old {
                    if let Err(release_error) = self.release(*new) {
                        warn!("could not release extent {new} after failed flush: {release_error}");
                    }
                }
            }
            stats.record_failed_flush();
            warn!(
                "flush of {} boxes failed, keeping them dirty in memory: {error}",
                ids.len()
            );
            self.debug_check_invariants();
            return Err(error);
        }

        let mut flushed = FlushStats {
            boxes: planned.len(),
            values: 0,
            writes,
        };
        let mut superseded = Vec::new();
        for (id, old, new, _) in planned {
            if let Some(old) = old.filter(|&old| old != new) {
                superseded.push(old);
            }
            let generation = self.next_generation;
            self.next_generation += 1;
            self.extents.insert(
                id,
                Persisted {
                    extent: new,
                    generation,
                },
            );
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.dirty = false;
            }
            flushed.values += new.len;
        }
        for old in superseded {
            if let Err(error) = self.release(old) {
                warn!("could not release superseded extent {old}: {error}");
            }
        }
        stats.record_flush(flushed.boxes, flushed.values);
        counter!(BOXES_FLUSHED).increment(flushed.boxes as u64);
        histogram!(FLUSH_BATCH_SIZE).record(flushed.boxes as f64);
        debug!(
            "flushed {} boxes ({} values) in {} writes",
            flushed.boxes, flushed.values, flushed.writes
        );
        self.debug_check_invariants();
        Ok(flushed)
    }

    /// Evicts least recently used boxes until at most `budget` values remain
    /// in memory, writing back dirty boxes first.
    fn evict_to(&mut self, budget: usize, stats: &AtomicDiskBufferStats) -> Result<(), Error> {
        if self.write_buffer_used <= budget {
            return Ok(());
        }
        let mut excess = self.write_buffer_used - budget;
        let can_write = self.file.is_some();
        let mut clean = Vec::new();
        let mut dirty = Vec::new();
        for id in self.lru.values() {
            if excess == 0 {
                break;
            }
            let entry = &self.entries[id];
            if entry.pins > 0 || (entry.dirty && !can_write) {
                continue;
            }
            if entry.dirty {
                dirty.push(*id);
            } else {
                clean.push(*id);
            }
            excess = excess.saturating_sub(entry.num_values);
        }

        for id in clean {
            self.remove_entry(id);
        }
        if !dirty.is_empty() {
            self.write_boxes(&dirty, stats)?;
            for id in dirty {
                self.remove_entry(id);
            }
        }
        if self.write_buffer_used > budget {
            debug!(
                "write buffer holds {} values over its budget of {budget}; remaining boxes are pinned or have nowhere to go",
                self.write_buffer_used - budget
            );
        }
        self.debug_check_invariants();
        Ok(())
    }

    /// Fails if a persisted box other than `owner` occupies part of
    /// `extent`.
    fn check_unclaimed(&self, extent: Extent, owner: Option<BoxId>) -> Result<(), Error> {
        if extent.is_empty() {
            return Ok(());
        }
        let conflict = self.extents.iter().find(|&(&id, persisted)| {
            let other = persisted.extent;
            Some(id) != owner
                && !other.is_empty()
                && other.offset < extent.end()
                && extent.offset < other.end()
        });
        match conflict {
            Some((id, persisted)) => Err(Error::invalid(
                "extent",
                format!("{extent} overlaps extent {} of box {id}", persisted.extent),
            )),
            None => Ok(()),
        }
    }

    fn dirty_ids(&self) -> Vec<BoxId> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// A write-behind cache of box payloads.
pub struct DiskBuffer<P> {
    inner: Mutex<Inner<P>>,
    stats: AtomicDiskBufferStats,
}

impl<P> Debug for DiskBuffer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskBuffer").finish()
    }
}

impl<P: Payload> DiskBuffer<P> {
    /// Creates a buffer with no backing file.
    pub fn new(config: &CacheConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    pub(crate) fn from_valid_config(config: &CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::new(config)),
            stats: AtomicDiskBufferStats::default(),
        }
    }

    /// Attaches the backing file, whose first `file_length` values are
    /// already in use.
    pub fn attach_file(&self, file: Arc<dyn RecordFile>, file_length: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.file = Some(file);
        inner.file_length = file_length;
        info!("disk buffer attached to backing file of {file_length} values");
    }

    /// Creates a backing file at `path` with this buffer's
    /// [StorageCacheConfig] and attaches it, empty.
    #[cfg(unix)]
    pub fn create_backing_file<Q: AsRef<Path>>(&self, path: Q) -> Result<Arc<PosixFile>, Error> {
        let file = Arc::new(PosixFile::create(path, self.storage_cache())?);
        self.attach_file(file.clone(), 0);
        Ok(file)
    }

    /// Opens the existing backing file at `path` with this buffer's
    /// [StorageCacheConfig] and attaches it, with its first `file_length`
    /// values in use.
    #[cfg(unix)]
    pub fn open_backing_file<Q: AsRef<Path>>(
        &self,
        path: Q,
        file_length: u64,
    ) -> Result<Arc<PosixFile>, Error> {
        let file = Arc::new(PosixFile::open(path, self.storage_cache())?);
        let bytes = file.len()?;
        let value_size = self.value_size() as u64;
        if file_length.saturating_mul(value_size) > bytes {
            return Err(Error::invalid(
                "file_length",
                format!(
                    "{file_length} values of {value_size} bytes do not fit in {} ({bytes} bytes)",
                    file.path().display()
                ),
            ));
        }
        self.attach_file(file.clone(), file_length);
        Ok(file)
    }

    pub fn storage_cache(&self) -> StorageCacheConfig {
        self.inner.lock().unwrap().storage_cache
    }

    pub fn is_file_backed(&self) -> bool {
        self.inner.lock().unwrap().file.is_some()
    }

    /// Records that `id` is persisted at `extent` in the backing file, as
    /// when reopening a file-backed dataset.
    pub fn set_extent(&self, id: BoxId, extent: Extent) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if extent.end() > inner.file_length {
            return Err(Error::OutOfRange {
                what: "extent end",
                index: extent.end() as usize,
                limit: inner.file_length as usize,
            });
        }
        inner.check_unclaimed(extent, Some(id))?;
        if let Some(block) = inner.free_space.overlapping(extent) {
            return Err(Error::invalid(
                "extent",
                format!("extent {extent} of box {id} overlaps free block {block}"),
            ));
        }
        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.extents.insert(id, Persisted { extent, generation });
        Ok(())
    }

    /// Sets the number of values the buffer may hold before evicting.
    pub fn set_write_buffer_size(&self, entries: usize) -> Result<(), Error> {
        if entries == 0 {
            return Err(Error::invalid(
                "write_buffer_entries",
                "a zero-sized write buffer cannot coalesce any writes",
            ));
        }
        self.inner.lock().unwrap().write_buffer_size = entries;
        debug!("write buffer size set to {entries} values");
        Ok(())
    }

    pub fn write_buffer_size(&self) -> usize {
        self.inner.lock().unwrap().write_buffer_size
    }

    /// Sets the on-disk size of one payload value.  Refused once any box has
    /// been persisted, because existing extents would be misread.
    pub fn set_value_size(&self, bytes: usize) -> Result<(), Error> {
        if bytes == 0 {
            return Err(Error::invalid(
                "value_size_bytes",
                "the size of a cached value must be positive",
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.value_size != bytes && !inner.extents.is_empty() {
            return Err(Error::invalid(
                "value_size_bytes",
                format!(
                    "cannot change from {} to {bytes} bytes with boxes already on disk",
                    inner.value_size
                ),
            ));
        }
        inner.value_size = bytes;
        Ok(())
    }

    pub fn value_size(&self) -> usize {
        self.inner.lock().unwrap().value_size
    }

    /// With write-through on, every staged box is written immediately.
    pub fn set_write_through(&self, write_through: bool) {
        self.inner.lock().unwrap().write_through = write_through;
    }

    pub fn write_through(&self) -> bool {
        self.inner.lock().unwrap().write_through
    }

    /// Stages `payload` as the new, dirty contents of box `id`, evicting
    /// older boxes if that takes the buffer over budget.
    ///
    /// An error means that a write-back failed.  The new payload is staged
    /// regardless.
    pub fn to_write(&self, id: BoxId, payload: P) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.insert_entry(id, Arc::new(payload), true, 0);
        if inner.write_through && inner.file.is_some() {
            inner.write_boxes(&[id], &self.stats)?;
        }
        let budget = inner.write_buffer_size;
        inner.evict_to(budget, &self.stats)
    }

    /// Returns the payload of box `id`, reading it from the backing file if
    /// it is not in memory.
    pub fn load_required(&self, id: BoxId) -> Result<Arc<P>, Error> {
        self.load(id, false)
    }

    /// Like [Self::load_required], but also keeps the box in memory until
    /// the returned guard is dropped.
    pub fn pin(&self, id: BoxId) -> Result<Pinned<'_, P>, Error> {
        let payload = self.load(id, true)?;
        Ok(Pinned {
            buffer: self,
            id,
            payload,
        })
    }

    fn load(&self, id: BoxId, pin: bool) -> Result<Arc<P>, Error> {
        loop {
            let (file, persisted, value_size) = {
                let mut inner = self.inner.lock().unwrap();
                if let Some((payload, num_values)) = inner.lookup(id, pin) {
                    self.stats.record(CacheAccess::Hit, num_values);
                    return Ok(payload);
                }
                let persisted = inner.extents.get(&id).copied().ok_or(Error::NotFound(id))?;
                let file = inner.file.clone().ok_or(Error::NotFileBacked)?;
                (file, persisted, inner.value_size)
            };
            let extent = persisted.extent;

            // Read without holding the lock.
            let bytes = if extent.is_empty() {
                Vec::new()
            } else {
                file.read_at(extent.to_bytes(value_size as u64))?
            };
            let payload = Arc::new(P::decode(&bytes, value_size)?);

            let mut inner = self.inner.lock().unwrap();
            // Another loader won the race, so this access is served from memory.
            if let Some((existing, num_values)) = inner.lookup(id, pin) {
                self.stats.record(CacheAccess::Hit, num_values);
                return Ok(existing);
            }
            match inner.extents.get(&id) {
                // The box was rewritten while we were reading.
                Some(&current) if current != persisted => continue,
                Some(_) => (),
                None => return Err(Error::NotFound(id)),
            }
            self.stats.record(CacheAccess::Miss, payload.num_values());
            inner.insert_entry(id, payload.clone(), false, usize::from(pin));
            let budget = inner.write_buffer_size;
            inner.evict_to(budget, &self.stats)?;
            return Ok(payload);
        }
    }

    fn unpin(&self, id: BoxId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// Writes every dirty box to the backing file and syncs it.  The boxes
    /// stay in memory, now clean.
    pub fn flush_cache(&self) -> Result<FlushStats, Error> {
        let mut inner = self.inner.lock().unwrap();
        let ids = inner.dirty_ids();
        if ids.is_empty() {
            return Ok(FlushStats::default());
        }
        let flushed = inner.write_boxes(&ids, &self.stats)?;
        if let Some(file) = &inner.file {
            file.sync()?;
        }
        Ok(flushed)
    }

    /// Forgets box `id`: drops any in-memory copy without writing it and
    /// releases its extent.  Returns whether the box was known.
    pub fn object_deleted(&self, id: BoxId) -> Result<bool, Error> {
        let mut inner = self.inner.lock().unwrap();
        let in_memory = inner.remove_entry(id).is_some();
        let on_disk = match inner.extents.remove(&id) {
            Some(persisted) => {
                inner.release(persisted.extent)?;
                true
            }
            None => false,
        };
        Ok(in_memory || on_disk)
    }

    /// Returns `len` values at `offset` to the free list.
    pub fn free_block(&self, offset: u64, len: u64) -> Result<(), Error> {
        self.inner
            .lock()
            .unwrap()
            .release(Extent::new(offset, len))
    }

    /// Reserves `len` values of the backing file and returns their offset.
    pub fn allocate(&self, len: u64) -> u64 {
        self.inner.lock().unwrap().place(len).offset
    }

    /// Resizes the block of `old_len` values at `old_offset` to `new_len`,
    /// returning its (possibly new) offset.  The caller moves the data.
    pub fn relocate(&self, old_offset: u64, old_len: u64, new_len: u64) -> Result<u64, Error> {
        let mut inner = self.inner.lock().unwrap();
        if new_len == old_len {
            Ok(old_offset)
        } else if new_len < old_len {
            inner.release(Extent::new(old_offset + new_len, old_len - new_len))?;
            Ok(old_offset)
        } else {
            inner.release(Extent::new(old_offset, old_len))?;
            Ok(inner.place(new_len).offset)
        }
    }

    /// The free list as `[offset, len, offset, len, ...]`.
    pub fn free_space_vector(&self) -> Vec<u64> {
        self.inner.lock().unwrap().free_space.to_vector()
    }

    /// Replaces the free list with one saved by [Self::free_space_vector].
    pub fn set_free_space_vector(&self, vector: &[u64]) -> Result<(), Error> {
        let free_space = FreeSpaceMap::from_vector(vector)?;
        let mut inner = self.inner.lock().unwrap();
        for block in free_space.iter() {
            if block.end() > inner.file_length {
                return Err(Error::invalid(
                    "free_space",
                    format!(
                        "free block {block} ends past the file length of {} values",
                        inner.file_length
                    ),
                ));
            }
            inner.check_unclaimed(block, None)?;
        }
        inner.free_space = free_space;
        Ok(())
    }

    /// Length of the backing file, in values.
    pub fn file_length(&self) -> u64 {
        self.inner.lock().unwrap().file_length
    }

    /// Values currently held in memory.
    pub fn write_buffer_used(&self) -> usize {
        self.inner.lock().unwrap().write_buffer_used
    }

    /// Values held in memory that are not yet persisted.
    pub fn dirty_values(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|entry| entry.dirty)
            .map(|entry| entry.num_values)
            .sum()
    }

    pub fn is_dirty(&self, id: BoxId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&id)
            .is_some_and(|entry| entry.dirty)
    }

    /// Whether box `id` is in memory, clean or dirty.
    pub fn is_cached(&self, id: BoxId) -> bool {
        self.inner.lock().unwrap().entries.contains_key(&id)
    }

    /// Where box `id` is persisted, if it is.
    pub fn extent(&self, id: BoxId) -> Option<Extent> {
        self.inner
            .lock()
            .unwrap()
            .extents
            .get(&id)
            .map(|persisted| persisted.extent)
    }

    pub fn stats(&self) -> DiskBufferStats {
        self.stats.read()
    }

    /// Queues a [Self::flush_cache] on `scheduler` under
    /// [MutexGroup::DISK_IO], so that it never runs concurrently with other
    /// disk tasks.
    pub fn schedule_flush(self: &Arc<Self>, scheduler: &MutexScheduler) -> FlushTicket {
        let (sender, receiver) = bounded(1);
        let cost = self.dirty_values() as f64;
        scheduler.push(Box::new(FlushTask {
            buffer: self.clone(),
            cost,
            reply: sender,
        }));
        FlushTicket { receiver }
    }
}

/// A box payload that stays in memory while the guard lives.
pub struct Pinned<'a, P: Payload> {
    buffer: &'a DiskBuffer<P>,
    id: BoxId,
    payload: Arc<P>,
}

impl<P: Payload> Pinned<'_, P> {
    pub fn id(&self) -> BoxId {
        self.id
    }

    pub fn payload(&self) -> &Arc<P> {
        &self.payload
    }
}

impl<P: Payload> Deref for Pinned<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.payload
    }
}

impl<P: Payload> Drop for Pinned<'_, P> {
    fn drop(&mut self) {
        self.buffer.unpin(self.id);
    }
}

struct FlushTask<P: Payload> {
    buffer: Arc<DiskBuffer<P>>,
    cost: f64,
    reply: Sender<Result<FlushStats, Error>>,
}

impl<P: Payload> Task for FlushTask<P> {
    fn cost(&self) -> f64 {
        self.cost
    }

    fn mutex_group(&self) -> Option<MutexGroup> {
        Some(MutexGroup::DISK_IO)
    }

    fn run(&mut self) -> Result<(), Error> {
        let result = self.buffer.flush_cache();
        // The ticket may have been dropped; nobody is waiting then.
        let _ = self.reply.send(result.clone());
        result.map(|_| ())
    }
}

/// Completion handle for [DiskBuffer::schedule_flush].
pub struct FlushTicket {
    receiver: Receiver<Result<FlushStats, Error>>,
}

impl FlushTicket {
    /// Blocks until the flush has run and returns its outcome.  If the task
    /// was dropped without running, because the scheduler was cleared or
    /// aborted, this returns [Error::Aborted].
    pub fn wait(self) -> Result<FlushStats, Error> {
        self.receiver.recv().unwrap_or_else(|_| {
            Err(Error::Aborted(
                "flush task was dropped before it ran".to_string(),
            ))
        })
    }

    /// Returns the outcome if the flush has finished.
    pub fn try_wait(&self) -> Option<Result<FlushStats, Error>> {
        self.receiver.try_recv().ok()
    }
}
