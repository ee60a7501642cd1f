use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use proptest::prelude::*;

use super::{FnTask, MutexGroup, MutexScheduler, Task, WorkerPool};
use crate::test::init_test_logger;
use crate::Error;

/// A task that records its label when run and counts its own destruction.
struct Tracked {
    label: usize,
    cost: f64,
    group: Option<MutexGroup>,
    ran: Arc<Mutex<Vec<usize>>>,
    dropped: Arc<AtomicUsize>,
}

impl Task for Tracked {
    fn cost(&self) -> f64 {
        self.cost
    }

    fn mutex_group(&self) -> Option<MutexGroup> {
        self.group
    }

    fn run(&mut self) -> Result<(), Error> {
        self.ran.lock().unwrap().push(self.label);
        Ok(())
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct TrackedTasks {
    ran: Arc<Mutex<Vec<usize>>>,
    dropped: Arc<AtomicUsize>,
}

impl TrackedTasks {
    fn task(&self, label: usize, cost: f64, group: Option<MutexGroup>) -> Box<dyn Task> {
        Box::new(Tracked {
            label,
            cost,
            group,
            ran: self.ran.clone(),
            dropped: self.dropped.clone(),
        })
    }

    fn ran(&self) -> Vec<usize> {
        self.ran.lock().unwrap().clone()
    }
}

fn run_one(scheduler: &MutexScheduler, worker: usize) -> Option<Box<dyn Task>> {
    let mut task = scheduler.pop(worker)?;
    task.run().unwrap();
    Some(task)
}

#[test]
fn highest_cost_first() {
    let tracked = TrackedTasks::default();
    let scheduler = MutexScheduler::new();
    scheduler.push(tracked.task(1, 1.0, None));
    scheduler.push(tracked.task(2, 5.0, None));
    scheduler.push(tracked.task(3, 3.0, None));
    scheduler.push(tracked.task(4, 5.0, None));
    assert_eq!(scheduler.size(), 4);
    assert_eq!(scheduler.total_cost(), 14.0);

    while let Some(task) = run_one(&scheduler, 0) {
        scheduler.finished(task.as_ref(), 0);
    }
    // Equal costs run in push order.
    assert_eq!(tracked.ran(), vec![2, 4, 3, 1]);
    assert_eq!(scheduler.cost_executed(), 14.0);
    assert!(scheduler.is_idle());
}

#[test]
fn busy_group_is_skipped() {
    let tracked = TrackedTasks::default();
    let scheduler = MutexScheduler::new();
    let disk = Some(MutexGroup::DISK_IO);
    scheduler.push(tracked.task(1, 10.0, disk));
    scheduler.push(tracked.task(2, 20.0, disk));
    scheduler.push(tracked.task(3, 1.0, None));

    let first = run_one(&scheduler, 0).unwrap();
    assert_eq!(first.mutex_group(), disk);
    assert_eq!(first.cost(), 20.0);

    // The disk group is busy, so only the ungrouped task is eligible.
    let second = run_one(&scheduler, 1).unwrap();
    assert_eq!(second.mutex_group(), None);
    assert!(scheduler.pop(2).is_none());
    assert!(!scheduler.is_idle());
    assert_eq!(scheduler.size(), 1);
    assert_eq!(scheduler.in_flight(), 2);

    scheduler.finished(first.as_ref(), 0);
    let third = run_one(&scheduler, 2).unwrap();
    assert_eq!(third.cost(), 10.0);
    scheduler.finished(third.as_ref(), 2);
    scheduler.finished(second.as_ref(), 1);
    assert_eq!(tracked.ran(), vec![2, 3, 1]);
    assert!(scheduler.is_idle());
}

#[test]
fn free_groups_beat_ungrouped_tasks() {
    let tracked = TrackedTasks::default();
    let scheduler = MutexScheduler::new();
    scheduler.push(tracked.task(1, 100.0, None));
    scheduler.push(tracked.task(2, 1.0, Some(MutexGroup(1))));
    scheduler.push(tracked.task(3, 2.0, Some(MutexGroup(2))));

    let a = run_one(&scheduler, 0).unwrap();
    let b = run_one(&scheduler, 0).unwrap();
    let c = run_one(&scheduler, 0).unwrap();
    assert_eq!(tracked.ran(), vec![3, 2, 1]);
    for task in [a, b, c] {
        scheduler.finished(task.as_ref(), 0);
    }
}

#[test]
fn clear_destroys_queued_tasks() {
    let tracked = TrackedTasks::default();
    let scheduler = MutexScheduler::new();
    let disk = Some(MutexGroup::DISK_IO);
    scheduler.push(tracked.task(1, 1.0, disk));
    scheduler.push(tracked.task(2, 1.0, disk));
    scheduler.push(tracked.task(3, 1.0, None));
    let in_flight = scheduler.pop(0).unwrap();

    scheduler.clear();
    assert_eq!(tracked.dropped.load(Ordering::Relaxed), 2);
    assert_eq!(scheduler.size(), 0);
    assert_eq!(scheduler.total_cost(), 0.0);

    // The in-flight task still holds its group.
    scheduler.push(tracked.task(4, 1.0, disk));
    assert!(scheduler.pop(1).is_none());
    scheduler.finished(in_flight.as_ref(), 0);
    assert!(scheduler.pop(1).is_some());
}

#[test]
fn abort_stops_scheduling() {
    let tracked = TrackedTasks::default();
    let scheduler = MutexScheduler::new();
    scheduler.push(tracked.task(1, 1.0, None));
    scheduler.abort(Error::Aborted("first".into()));
    scheduler.abort(Error::Aborted("second".into()));
    assert_eq!(tracked.dropped.load(Ordering::Relaxed), 1);
    assert!(scheduler.pop(0).is_none());

    scheduler.push(tracked.task(2, 1.0, None));
    assert_eq!(scheduler.size(), 0);
    assert_eq!(scheduler.aborted(), Some(Error::Aborted("first".into())));

    scheduler.clear();
    assert_eq!(scheduler.aborted(), None);
    scheduler.push(tracked.task(3, 1.0, None));
    assert!(scheduler.pop(0).is_some());
}

#[test]
fn fn_task_runs_once() {
    let count = Arc::new(AtomicUsize::new(0));
    let mut task = FnTask::new(2.5, {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    })
    .with_mutex_group(MutexGroup(7));
    assert_eq!(task.cost(), 2.5);
    assert_eq!(task.mutex_group(), Some(MutexGroup(7)));
    task.run().unwrap();
    task.run().unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 1);
}

#[test]
fn pool_drains_queue() {
    init_test_logger();
    let scheduler = Arc::new(MutexScheduler::new());
    let count = Arc::new(AtomicUsize::new(0));
    for i in 0..100 {
        let count = count.clone();
        let task = FnTask::new(i as f64, move || {
            count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        scheduler.push(Box::new(task));
    }
    let pool = WorkerPool::start(scheduler.clone(), NonZeroUsize::new(4).unwrap()).unwrap();
    assert_eq!(pool.n_workers(), 4);
    pool.join().unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 100);
    assert_eq!(scheduler.cost_executed(), scheduler.total_cost());
}

#[test]
fn failing_task_aborts_pool() {
    init_test_logger();
    let scheduler = Arc::new(MutexScheduler::new());
    let disk = MutexGroup::DISK_IO;
    scheduler.push(Box::new(
        FnTask::new(10.0, || Err(Error::NotFileBacked)).with_mutex_group(disk),
    ));
    for _ in 0..10 {
        scheduler.push(Box::new(FnTask::new(1.0, || Ok(())).with_mutex_group(disk)));
    }
    let pool = WorkerPool::start(scheduler.clone(), NonZeroUsize::new(2).unwrap()).unwrap();
    assert_eq!(pool.join(), Err(Error::NotFileBacked));
    assert_eq!(scheduler.size(), 0);
}

#[test]
fn panicking_task_aborts_pool() {
    init_test_logger();
    let scheduler = Arc::new(MutexScheduler::new());
    scheduler.push(Box::new(FnTask::new(1.0, || panic!("task bug"))));
    let pool = WorkerPool::start(scheduler.clone(), NonZeroUsize::new(1).unwrap()).unwrap();
    assert!(matches!(pool.join(), Err(Error::Aborted(_))));
    assert!(scheduler.is_idle());
}

/// Many workers, few groups: no two tasks of one group may overlap.
#[test]
fn groups_never_overlap_under_stress() {
    init_test_logger();
    const GROUPS: usize = 3;
    let scheduler = Arc::new(MutexScheduler::new());
    let running: Arc<Vec<AtomicUsize>> = Arc::new((0..GROUPS).map(|_| AtomicUsize::new(0)).collect());
    let ungrouped_peak = Arc::new(AtomicUsize::new(0));
    let ungrouped_running = Arc::new(AtomicUsize::new(0));

    for i in 0..300 {
        let cost = (i * 7 % 13) as f64;
        if i % 4 == 0 {
            let peak = ungrouped_peak.clone();
            let now = ungrouped_running.clone();
            scheduler.push(Box::new(FnTask::new(cost, move || {
                let n = now.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(n, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(50));
                now.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })));
        } else {
            let group = i % GROUPS;
            let running = running.clone();
            let task = FnTask::new(cost, move || {
                let overlapping = running[group].fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(20));
                running[group].fetch_sub(1, Ordering::SeqCst);
                if overlapping == 0 {
                    Ok(())
                } else {
                    Err(Error::Aborted(format!("group {group} ran {overlapping} tasks at once")))
                }
            })
            .with_mutex_group(MutexGroup(group as u32));
            scheduler.push(Box::new(task));
        }
    }

    let pool = WorkerPool::start(scheduler.clone(), NonZeroUsize::new(8).unwrap()).unwrap();
    pool.join().unwrap();
    assert!(scheduler.is_idle());
    assert!(ungrouped_peak.load(Ordering::SeqCst) >= 1);
}

/// Hand-driven workers on separate threads, each holding its task for a
/// while before calling `finished`.
#[test]
fn concurrent_push_pop_finished() {
    let scheduler = Arc::new(MutexScheduler::new());
    let in_flight_groups = Arc::new(Mutex::new(HashSet::new()));
    let done = Arc::new(AtomicUsize::new(0));
    const TASKS_PER_PRODUCER: usize = 200;

    let producers: Vec<_> = (0..2)
        .map(|p| {
            let scheduler = scheduler.clone();
            thread::spawn(move || {
                for i in 0..TASKS_PER_PRODUCER {
                    let group = (i % 5 != 0).then_some(MutexGroup((i % 3) as u32));
                    let mut task = FnTask::new(((p + i) % 11) as f64, || Ok(()));
                    if let Some(group) = group {
                        task = task.with_mutex_group(group);
                    }
                    scheduler.push(Box::new(task));
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..4)
        .map(|worker| {
            let scheduler = scheduler.clone();
            let in_flight_groups = in_flight_groups.clone();
            let done = done.clone();
            thread::spawn(move || {
                while done.load(Ordering::SeqCst) < 2 * TASKS_PER_PRODUCER {
                    let Some(mut task) = scheduler.pop(worker) else {
                        thread::yield_now();
                        continue;
                    };
                    if let Some(group) = task.mutex_group() {
                        assert!(in_flight_groups.lock().unwrap().insert(group));
                    }
                    task.run().unwrap();
                    thread::yield_now();
                    if let Some(group) = task.mutex_group() {
                        assert!(in_flight_groups.lock().unwrap().remove(&group));
                    }
                    scheduler.finished(task.as_ref(), worker);
                    done.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in producers.into_iter().chain(consumers) {
        handle.join().unwrap();
    }
    assert!(scheduler.is_idle());
    assert_eq!(scheduler.cost_executed(), scheduler.total_cost());
}

#[derive(Clone, Debug)]
enum Op {
    Push(f64, Option<u32>),
    Pop,
    Finish(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0.0..10.0f64, prop::option::of(0..3u32)).prop_map(|(cost, group)| Op::Push(cost, group)),
        Just(Op::Pop),
        any::<usize>().prop_map(Op::Finish),
    ]
}

proptest! {
    /// `pop` hands out a task exactly when one is eligible, never one from
    /// a busy group, and always the most expensive among free groups.
    #[test]
    fn pop_respects_groups(ops in prop::collection::vec(op(), 1..200)) {
        let scheduler = MutexScheduler::new();
        let mut queued: Vec<(f64, Option<MutexGroup>)> = Vec::new();
        let mut in_flight: Vec<Box<dyn Task>> = Vec::new();
        for op in ops {
            match op {
                Op::Push(cost, group) => {
                    let group = group.map(MutexGroup);
                    let task = FnTask::new(cost, || Ok(()));
                    let task: Box<dyn Task> = match group {
                        Some(group) => Box::new(task.with_mutex_group(group)),
                        None => Box::new(task),
                    };
                    scheduler.push(task);
                    queued.push((cost, group));
                }
                Op::Pop => {
                    let busy: HashSet<MutexGroup> =
                        in_flight.iter().filter_map(|task| task.mutex_group()).collect();
                    let best_grouped = queued
                        .iter()
                        .filter(|(_, group)| group.is_some_and(|group| !busy.contains(&group)))
                        .map(|(cost, _)| *cost)
                        .fold(None, |best: Option<f64>, cost| Some(best.map_or(cost, |b| b.max(cost))));
                    let any_ungrouped = queued.iter().any(|(_, group)| group.is_none());
                    match scheduler.pop(0) {
                        Some(task) => {
                            let group = task.mutex_group();
                            if let Some(group) = group {
                                prop_assert!(!busy.contains(&group));
                                prop_assert_eq!(Some(task.cost()), best_grouped);
                            } else {
                                prop_assert!(best_grouped.is_none());
                            }
                            let position = queued
                                .iter()
                                .position(|&(cost, g)| cost == task.cost() && g == group)
                                .unwrap();
                            queued.remove(position);
                            in_flight.push(task);
                        }
                        None => prop_assert!(best_grouped.is_none() && !any_ungrouped),
                    }
                }
                Op::Finish(index) => {
                    if !in_flight.is_empty() {
                        let task = in_flight.remove(index % in_flight.len());
                        scheduler.finished(task.as_ref(), 0);
                    }
                }
            }
            prop_assert_eq!(scheduler.size(), queued.len());
            prop_assert_eq!(scheduler.in_flight(), in_flight.len());
        }
    }
}
