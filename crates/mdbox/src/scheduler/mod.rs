//! Cost-ordered task scheduling with mutual-exclusion groups.
//!
//! Tasks carry a cost, where a larger cost is scheduled first, and an
//! optional [MutexGroup].  At most one task of any group is in flight at a
//! time: a task is in flight from the [MutexScheduler::pop] that hands it
//! out until the matching [MutexScheduler::finished].  Tasks without a group
//! run freely in parallel.
//!
//! Costs are a throughput heuristic, not a strict priority: a cheap task in
//! a free group can run before an expensive one waiting on a busy group.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Debug, Display};
use std::sync::Mutex;

use ordered_float::OrderedFloat;
use tracing::{debug, warn};

use crate::Error;

mod pool;
#[cfg(test)]
mod tests;

pub use pool::WorkerPool;

/// Identifies a class of tasks that must not run concurrently, for example
/// tasks that all touch the same file handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutexGroup(pub u32);

impl MutexGroup {
    /// Tasks that read or write a disk buffer's backing file.
    pub const DISK_IO: Self = Self(0);
}

impl Display for MutexGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::DISK_IO => write!(f, "disk-io"),
            Self(n) => write!(f, "group-{n}"),
        }
    }
}

/// A unit of work for a [MutexScheduler].
pub trait Task: Send {
    /// Relative cost of the task.  Higher-cost tasks are handed out first.
    fn cost(&self) -> f64 {
        1.0
    }

    /// The group this task is exclusive with, if any.
    fn mutex_group(&self) -> Option<MutexGroup> {
        None
    }

    fn run(&mut self) -> Result<(), Error>;
}

/// A [Task] that runs a closure once.
pub struct FnTask<F> {
    f: Option<F>,
    cost: f64,
    mutex_group: Option<MutexGroup>,
}

impl<F> FnTask<F>
where
    F: FnOnce() -> Result<(), Error> + Send,
{
    pub fn new(cost: f64, f: F) -> Self {
        Self {
            f: Some(f),
            cost,
            mutex_group: None,
        }
    }

    pub fn with_mutex_group(mut self, group: MutexGroup) -> Self {
        self.mutex_group = Some(group);
        self
    }
}

impl<F> Task for FnTask<F>
where
    F: FnOnce() -> Result<(), Error> + Send,
{
    fn cost(&self) -> f64 {
        self.cost
    }

    fn mutex_group(&self) -> Option<MutexGroup> {
        self.mutex_group
    }

    fn run(&mut self) -> Result<(), Error> {
        match self.f.take() {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}

/// Orders tasks within a group: highest cost first, then first pushed.
type TaskKey = (OrderedFloat<f64>, Reverse<u64>);

#[derive(Default)]
struct Inner {
    /// Queued tasks per group.  `None` holds tasks without a group.  Empty
    /// groups are removed.
    supermap: BTreeMap<Option<MutexGroup>, BTreeMap<TaskKey, Box<dyn Task>>>,

    /// Groups with a task in flight.
    busy: HashSet<MutexGroup>,

    in_flight: usize,

    /// Cost of everything pushed since the last clear.
    cost: f64,

    /// Cost of everything finished since the last clear.
    cost_executed: f64,

    next_seq: u64,

    aborted: Option<Error>,
}

impl Inner {
    fn queued(&self) -> usize {
        self.supermap.values().map(BTreeMap::len).sum()
    }

    /// The group whose top task should run next, if any is eligible.
    fn choose(&self) -> Option<Option<MutexGroup>> {
        let best_exclusive = self
            .supermap
            .iter()
            .filter_map(|(group, tasks)| group.map(|group| (group, tasks)))
            .filter(|(group, _)| !self.busy.contains(group))
            .filter_map(|(group, tasks)| tasks.last_key_value().map(|(key, _)| (key.0, group)))
            .max_by_key(|(cost, _)| *cost)
            .map(|(_, group)| Some(group));
        best_exclusive.or_else(|| self.supermap.contains_key(&None).then_some(None))
    }
}

/// A thread-safe queue of [Task]s that enforces mutual exclusion between
/// tasks of the same [MutexGroup].
#[derive(Default)]
pub struct MutexScheduler {
    inner: Mutex<Inner>,
}

impl Debug for MutexScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MutexScheduler")
            .field("queued", &inner.queued())
            .field("in_flight", &inner.in_flight)
            .field("busy", &inner.busy)
            .finish()
    }
}

impl MutexScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task`.  A task pushed to an aborted scheduler is dropped.
    pub fn push(&self, task: Box<dyn Task>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted.is_some() {
            debug!("dropping task pushed to aborted scheduler");
            return;
        }
        let cost = task.cost();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.cost += cost;
        inner
            .supermap
            .entry(task.mutex_group())
            .or_default()
            .insert((OrderedFloat(cost), Reverse(seq)), task);
    }

    /// Hands out the next task for `worker` to run, marking its group busy.
    ///
    /// `None` means that no task is eligible right now, either because the
    /// queue is empty or because every queued task waits on a busy group.
    /// Use [Self::is_idle] to tell the two apart.
    pub fn pop(&self, worker: usize) -> Option<Box<dyn Task>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted.is_some() {
            return None;
        }
        let group = inner.choose()?;
        let tasks = inner.supermap.get_mut(&group)?;
        let (_, task) = tasks.pop_last()?;
        if tasks.is_empty() {
            inner.supermap.remove(&group);
        }
        if let Some(group) = group {
            inner.busy.insert(group);
        }
        inner.in_flight += 1;
        debug!(
            "worker {worker} took task of cost {} from {}",
            task.cost(),
            group.map_or_else(|| "no group".to_string(), |group| group.to_string())
        );
        Some(task)
    }

    /// Records that `task`, handed out by [Self::pop], has completed on
    /// `worker`, making its group eligible again.
    pub fn finished(&self, task: &dyn Task, worker: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(group) = task.mutex_group() {
            if !inner.busy.remove(&group) {
                warn!("worker {worker} finished a task in {group}, which was not busy");
            }
        }
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.cost_executed += task.cost();
    }

    /// Number of queued tasks, not counting those in flight.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().queued()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight
    }

    /// Whether nothing is queued and nothing is in flight.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.in_flight == 0 && inner.supermap.is_empty()
    }

    /// Total cost pushed since the last [Self::clear].
    pub fn total_cost(&self) -> f64 {
        self.inner.lock().unwrap().cost
    }

    /// Total cost finished since the last [Self::clear].
    pub fn cost_executed(&self) -> f64 {
        self.inner.lock().unwrap().cost_executed
    }

    /// Drops every queued task and resets the cost counters and any abort.
    /// Tasks already in flight are unaffected and keep their groups busy
    /// until they finish.
    pub fn clear(&self) {
        let dropped = {
            let mut inner = self.inner.lock().unwrap();
            inner.cost = 0.0;
            inner.cost_executed = 0.0;
            inner.aborted = None;
            std::mem::take(&mut inner.supermap)
        };
        // Task destructors run without the lock held.
        drop(dropped);
    }

    /// Stops handing out tasks and drops everything queued.  `error` is kept
    /// as the reason, and the first abort wins.
    pub fn abort(&self, error: Error) {
        let dropped = {
            let mut inner = self.inner.lock().unwrap();
            if inner.aborted.is_none() {
                warn!("aborting scheduler: {error}");
                inner.aborted = Some(error);
            }
            std::mem::take(&mut inner.supermap)
        };
        drop(dropped);
    }

    /// The error the scheduler was aborted with, if any.
    pub fn aborted(&self) -> Option<Error> {
        self.inner.lock().unwrap().aborted.clone()
    }
}
