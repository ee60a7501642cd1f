//! Splitting policy, box-ID allocation, and per-depth bookkeeping for one
//! dataset's box tree.
//!
//! A [BoxController] decides when a leaf box should split
//! ([BoxController::will_split]), hands out IDs for the children
//! ([BoxController::get_next_id]), and keeps count of how many boxes exist at
//! each depth ([BoxController::track_num_boxes]).  It also owns the
//! dataset's [DiskBuffer].
//!
//! [BoxController::will_split] and the split that follows are separate
//! calls.  Two threads can both see `true` for the same box, and callers
//! that split concurrently must make sure that only one of them acts on it.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{BoxControllerConfig, CacheConfig};
use crate::disk_buffer::{DiskBuffer, Payload};
use crate::{BoxId, Error};

/// Default cap on the depth of the box tree.
pub const DEFAULT_MAX_DEPTH: usize = 1000;

/// Default number of values above which a leaf may split.
pub const DEFAULT_SPLIT_THRESHOLD: usize = 1024;

/// Largest accepted maximum depth.  Per-depth tables hold `max_depth + 2`
/// entries.
pub const MAX_DEPTH_LIMIT: usize = 1 << 16;

fn check_max_depth(name: &'static str, max_depth: usize) -> Result<(), Error> {
    if max_depth > MAX_DEPTH_LIMIT {
        return Err(Error::invalid(
            name,
            format!("maximum depth {max_depth} exceeds the limit of {MAX_DEPTH_LIMIT}"),
        ));
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct BoxCounts {
    /// Boxes currently existing at each depth.
    num_md_boxes: Vec<u64>,

    /// Boxes at each depth that have been split into children.
    num_md_grid_boxes: Vec<u64>,
}

impl BoxCounts {
    /// Counts for a tree of only a root box, with room for depths
    /// `0..=max_depth + 1`.
    fn root(max_depth: usize) -> Self {
        let mut counts = Self {
            num_md_boxes: vec![0; max_depth + 2],
            num_md_grid_boxes: vec![0; max_depth + 2],
        };
        counts.num_md_boxes[0] = 1;
        counts
    }

    fn resize(&mut self, len: usize) {
        self.num_md_boxes.resize(len, 0);
        self.num_md_grid_boxes.resize(len, 0);
    }
}

/// The serialized form of a [BoxController].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ControllerState {
    #[serde(rename = "NDims")]
    n_dims: usize,
    max_id: BoxId,
    split_threshold: usize,
    max_depth: usize,
    split_into: Vec<usize>,
    num_split: usize,
    #[serde(rename = "NumMDBoxes")]
    num_md_boxes: Vec<u64>,
    #[serde(rename = "NumMDGridBoxes")]
    num_md_grid_boxes: Vec<u64>,

    /// Ceilings that overflow `f64` are written as `null`.
    #[serde(rename = "MaxNumMDBoxes")]
    max_num_md_boxes: Vec<Option<f64>>,
    use_write_buffer: bool,
}

/// Controls the splitting of one dataset's boxes.
pub struct BoxController<P: Payload = Vec<f64>> {
    n_dims: usize,
    split_threshold: usize,
    max_depth: usize,

    /// Children per dimension when a box splits.
    split_into: Vec<usize>,

    /// Product of `split_into`: children per split.
    num_split: usize,

    /// `num_split.pow(depth)` for each depth, as `f64` because it overflows
    /// any integer type long before the maximum depth.
    max_num_md_boxes: Vec<f64>,

    next_id: AtomicU64,
    counts: Mutex<BoxCounts>,
    use_write_buffer: bool,
    disk_buffer: Arc<DiskBuffer<P>>,
}

impl<P: Payload> Debug for BoxController<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxController")
            .field("n_dims", &self.n_dims)
            .field("split_threshold", &self.split_threshold)
            .field("max_depth", &self.max_depth)
            .field("split_into", &self.split_into)
            .field("max_id", &self.get_max_id())
            .finish()
    }
}

fn ceilings(num_split: usize, max_depth: usize) -> Vec<f64> {
    (0..max_depth + 2)
        .map(|depth| (num_split as f64).powi(i32::try_from(depth).unwrap_or(i32::MAX)))
        .collect()
}

fn product(split_into: &[usize]) -> Result<usize, Error> {
    split_into
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| {
            Error::invalid(
                "split_into",
                format!("{split_into:?} splits a box into more children than can be counted"),
            )
        })
}

impl<P: Payload> BoxController<P> {
    /// Creates a controller for `n_dims` dimensions with default settings.
    pub fn new(n_dims: usize) -> Result<Self, Error> {
        Self::with_config(n_dims, &BoxControllerConfig::default())
    }

    pub fn with_config(n_dims: usize, config: &BoxControllerConfig) -> Result<Self, Error> {
        if n_dims == 0 {
            return Err(Error::invalid(
                "n_dims",
                "a box controller needs at least one dimension",
            ));
        }
        check_max_depth("max_depth", config.max_depth)?;
        let split_into = match config.split_into.as_slice() {
            [value] => vec![*value; n_dims],
            values if values.len() == n_dims => values.to_vec(),
            values => {
                return Err(Error::invalid(
                    "split_into",
                    format!(
                        "expected 1 or {n_dims} split factors but got {}",
                        values.len()
                    ),
                ))
            }
        };
        if split_into.contains(&0) {
            return Err(Error::invalid(
                "split_into",
                "every split factor must be at least 1",
            ));
        }
        let disk_buffer = Arc::new(DiskBuffer::new(&config.cache)?);
        disk_buffer.set_write_through(!config.use_write_buffer);

        let num_split = product(&split_into)?;
        Ok(Self {
            n_dims,
            split_threshold: config.split_threshold,
            max_depth: config.max_depth,
            max_num_md_boxes: ceilings(num_split, config.max_depth),
            split_into,
            num_split,
            next_id: AtomicU64::new(0),
            counts: Mutex::new(BoxCounts::root(config.max_depth)),
            use_write_buffer: config.use_write_buffer,
            disk_buffer,
        })
    }

    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    pub fn split_threshold(&self) -> usize {
        self.split_threshold
    }

    pub fn set_split_threshold(&mut self, threshold: usize) {
        self.split_threshold = threshold;
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Sets the maximum depth of the tree, at most [MAX_DEPTH_LIMIT].
    /// Counts for depths that remain in range are kept.
    pub fn set_max_depth(&mut self, max_depth: usize) -> Result<(), Error> {
        check_max_depth("max_depth", max_depth)?;
        self.max_depth = max_depth;
        self.counts.lock().unwrap().resize(max_depth + 2);
        self.recompute_ceilings();
        Ok(())
    }

    /// Returns the split factor along `dim`.
    pub fn split_into(&self, dim: usize) -> Result<usize, Error> {
        self.split_into.get(dim).copied().ok_or(Error::OutOfRange {
            what: "dimension",
            index: dim,
            limit: self.n_dims,
        })
    }

    /// Sets the split factor along `dim`.
    pub fn set_split_into(&mut self, dim: usize, value: usize) -> Result<(), Error> {
        if dim >= self.n_dims {
            return Err(Error::invalid(
                "dim",
                format!("dimension {dim} does not exist in {} dimensions", self.n_dims),
            ));
        }
        let mut split_into = self.split_into.clone();
        split_into[dim] = value;
        self.apply_split_into(split_into)
    }

    /// Sets the same split factor along every dimension.
    pub fn set_split_into_all(&mut self, value: usize) -> Result<(), Error> {
        self.apply_split_into(vec![value; self.n_dims])
    }

    fn apply_split_into(&mut self, split_into: Vec<usize>) -> Result<(), Error> {
        if split_into.contains(&0) {
            return Err(Error::invalid(
                "split_into",
                "every split factor must be at least 1",
            ));
        }
        self.num_split = product(&split_into)?;
        self.split_into = split_into;
        self.recompute_ceilings();
        debug!(
            "split factors {:?}, {} children per split",
            self.split_into, self.num_split
        );
        Ok(())
    }

    fn recompute_ceilings(&mut self) {
        self.max_num_md_boxes = ceilings(self.num_split, self.max_depth);
    }

    /// Number of children one split produces.
    pub fn num_split(&self) -> usize {
        self.num_split
    }

    /// Returns a fresh box ID.
    pub fn get_next_id(&self) -> BoxId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserves `n` consecutive IDs and returns the first.
    pub fn claim_id_range(&self, n: u64) -> BoxId {
        self.next_id.fetch_add(n, Ordering::Relaxed)
    }

    /// The next ID that will be handed out, that is, one more than the
    /// largest ID handed out so far.
    pub fn get_max_id(&self) -> BoxId {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Moves the ID cursor, as when restoring a dataset whose boxes already
    /// use IDs below `max_id`.
    pub fn set_max_id(&self, max_id: BoxId) {
        self.next_id.store(max_id, Ordering::Relaxed);
    }

    /// Whether a leaf holding `count` values at `depth` should split.
    pub fn will_split(&self, count: usize, depth: usize) -> bool {
        count > self.split_threshold && depth < self.max_depth
    }

    /// Records that one box at `depth` has just split into
    /// [Self::num_split] children at `depth + 1`.
    pub fn track_num_boxes(&self, depth: usize) -> Result<(), Error> {
        if depth > self.max_depth {
            return Err(Error::OutOfRange {
                what: "depth",
                index: depth,
                limit: self.max_depth + 1,
            });
        }
        let mut counts = self.counts.lock().unwrap();
        match counts.num_md_boxes[depth].checked_sub(1) {
            Some(n) => counts.num_md_boxes[depth] = n,
            None => warn!("split a box at depth {depth}, where no boxes were counted"),
        }
        counts.num_md_grid_boxes[depth] += 1;
        counts.num_md_boxes[depth + 1] += self.num_split as u64;
        Ok(())
    }

    /// Boxes at each depth.
    pub fn num_md_boxes(&self) -> Vec<u64> {
        self.counts.lock().unwrap().num_md_boxes.clone()
    }

    /// Split boxes at each depth.
    pub fn num_md_grid_boxes(&self) -> Vec<u64> {
        self.counts.lock().unwrap().num_md_grid_boxes.clone()
    }

    pub fn total_num_md_boxes(&self) -> u64 {
        self.counts.lock().unwrap().num_md_boxes.iter().sum()
    }

    /// The most boxes that can exist at each depth.
    pub fn max_num_md_boxes(&self) -> &[f64] {
        &self.max_num_md_boxes
    }

    /// Forgets every split, leaving only a root box.
    pub fn reset_num_boxes(&self) {
        *self.counts.lock().unwrap() = BoxCounts::root(self.max_depth);
    }

    /// Mean depth of the existing boxes, or 0 if there are none.
    pub fn average_depth(&self) -> f64 {
        let counts = self.counts.lock().unwrap();
        let (weighted, total) = counts
            .num_md_boxes
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(weighted, total), (depth, &n)| {
                (weighted + depth as f64 * n as f64, total + n as f64)
            });
        if total == 0.0 {
            0.0
        } else {
            weighted / total
        }
    }

    pub fn use_write_buffer(&self) -> bool {
        self.use_write_buffer
    }

    /// Without a write buffer, every modified box is written immediately.
    pub fn set_use_write_buffer(&mut self, use_write_buffer: bool) {
        self.use_write_buffer = use_write_buffer;
        self.disk_buffer.set_write_through(!use_write_buffer);
    }

    /// Configures the disk buffer: each value occupies `value_size_bytes`
    /// on disk, and `write_buffer_entries` values may be held in memory.
    pub fn set_cache_parameters(
        &self,
        value_size_bytes: usize,
        write_buffer_entries: usize,
    ) -> Result<(), Error> {
        CacheConfig {
            value_size_bytes,
            write_buffer_entries,
            storage_cache: self.disk_buffer.storage_cache(),
        }
        .validate()?;
        self.disk_buffer.set_value_size(value_size_bytes)?;
        self.disk_buffer.set_write_buffer_size(write_buffer_entries)
    }

    pub fn disk_buffer(&self) -> &Arc<DiskBuffer<P>> {
        &self.disk_buffer
    }

    fn state(&self) -> ControllerState {
        let counts = self.counts.lock().unwrap().clone();
        ControllerState {
            n_dims: self.n_dims,
            max_id: self.get_max_id(),
            split_threshold: self.split_threshold,
            max_depth: self.max_depth,
            split_into: self.split_into.clone(),
            num_split: self.num_split,
            num_md_boxes: counts.num_md_boxes,
            num_md_grid_boxes: counts.num_md_grid_boxes,
            max_num_md_boxes: self
                .max_num_md_boxes
                .iter()
                .map(|&n| n.is_finite().then_some(n))
                .collect(),
            use_write_buffer: self.use_write_buffer,
        }
    }

    /// The controller's state as JSON, to be stored with the dataset.
    pub fn serialize(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(&self.state())?)
    }

    /// Replaces this controller's state with one produced by
    /// [Self::serialize], including its number of dimensions.  The disk
    /// buffer is not affected.  On error, the controller is unchanged.
    pub fn deserialize(&mut self, json: &str) -> Result<(), Error> {
        let state: ControllerState = serde_json::from_str(json)?;
        if state.n_dims == 0 {
            return Err(Error::invalid(
                "NDims",
                "a box controller needs at least one dimension",
            ));
        }
        if state.split_into.len() != state.n_dims {
            return Err(Error::invalid(
                "SplitInto",
                format!(
                    "{} split factors for {} dimensions",
                    state.split_into.len(),
                    state.n_dims
                ),
            ));
        }
        if state.split_into.contains(&0) {
            return Err(Error::invalid(
                "SplitInto",
                "every split factor must be at least 1",
            ));
        }
        let num_split = product(&state.split_into)?;
        if num_split != state.num_split {
            return Err(Error::invalid(
                "NumSplit",
                format!(
                    "{} does not match split factors {:?}",
                    state.num_split, state.split_into
                ),
            ));
        }
        check_max_depth("MaxDepth", state.max_depth)?;
        let len = state.max_depth + 2;
        for (name, actual) in [
            ("NumMDBoxes", state.num_md_boxes.len()),
            ("NumMDGridBoxes", state.num_md_grid_boxes.len()),
            ("MaxNumMDBoxes", state.max_num_md_boxes.len()),
        ] {
            if actual != len {
                return Err(Error::invalid(
                    name,
                    format!(
                        "{actual} entries for maximum depth {}, expected {len}",
                        state.max_depth
                    ),
                ));
            }
        }

        self.n_dims = state.n_dims;
        self.next_id.store(state.max_id, Ordering::Relaxed);
        self.split_threshold = state.split_threshold;
        self.max_depth = state.max_depth;
        self.split_into = state.split_into;
        self.num_split = num_split;
        self.recompute_ceilings();
        *self.counts.lock().unwrap() = BoxCounts {
            num_md_boxes: state.num_md_boxes,
            num_md_grid_boxes: state.num_md_grid_boxes,
        };
        self.set_use_write_buffer(state.use_write_buffer);
        info!(
            "restored {}-dimensional box controller with {} boxes, next ID {}",
            self.n_dims,
            self.total_num_md_boxes(),
            state.max_id
        );
        Ok(())
    }
}

impl<P: Payload> Clone for BoxController<P> {
    /// Duplicates the policy, counts, and ID cursor.  The clone gets its own
    /// empty disk buffer with the same cache parameters and no backing file.
    fn clone(&self) -> Self {
        let cache = CacheConfig {
            value_size_bytes: self.disk_buffer.value_size(),
            write_buffer_entries: self.disk_buffer.write_buffer_size(),
            storage_cache: self.disk_buffer.storage_cache(),
        };
        let disk_buffer = Arc::new(DiskBuffer::from_valid_config(&cache));
        disk_buffer.set_write_through(!self.use_write_buffer);
        Self {
            n_dims: self.n_dims,
            split_threshold: self.split_threshold,
            max_depth: self.max_depth,
            split_into: self.split_into.clone(),
            num_split: self.num_split,
            max_num_md_boxes: self.max_num_md_boxes.clone(),
            next_id: AtomicU64::new(self.get_max_id()),
            counts: Mutex::new(self.counts.lock().unwrap().clone()),
            use_write_buffer: self.use_write_buffer,
            disk_buffer,
        }
    }
}
