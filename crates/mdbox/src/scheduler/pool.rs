use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, Builder, JoinHandle};
use std::time::Duration;

use crossbeam_utils::Backoff;
use tracing::{debug, error, info};

use super::MutexScheduler;
use crate::Error;

/// Longest a worker sleeps between polls once spinning has not helped.
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// A fixed set of threads that drain a [MutexScheduler].
///
/// Workers run until the scheduler is idle, meaning nothing is queued and
/// nothing is in flight, or until it is aborted.  A task that fails aborts
/// the scheduler, which stops the other workers after their current task.
/// A task that panics counts as failed.
pub struct WorkerPool {
    scheduler: Arc<MutexScheduler>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `n_workers` threads working on `scheduler`.
    pub fn start(scheduler: Arc<MutexScheduler>, n_workers: NonZeroUsize) -> Result<Self, Error> {
        let mut workers = Vec::with_capacity(n_workers.get());
        for worker in 0..n_workers.get() {
            let scheduler_clone = scheduler.clone();
            let handle = Builder::new()
                .name(format!("mdbox-worker-{worker}"))
                .spawn(move || work(&scheduler_clone, worker))
                .map_err(|error| {
                    scheduler.abort(Error::Aborted(format!(
                        "failed to spawn worker thread {worker}: {error}"
                    )));
                    Error::Io(error.into())
                })?;
            workers.push(handle);
        }
        info!("started {} scheduler workers", workers.len());
        Ok(Self { scheduler, workers })
    }

    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every worker to exit.  Returns the error that aborted the
    /// scheduler, if a task failed.
    pub fn join(self) -> Result<(), Error> {
        let mut panicked = false;
        for handle in self.workers {
            panicked |= handle.join().is_err();
        }
        if let Some(error) = self.scheduler.aborted() {
            return Err(error);
        }
        if panicked {
            return Err(Error::Aborted("a worker thread panicked".to_string()));
        }
        Ok(())
    }
}

fn work(scheduler: &MutexScheduler, worker: usize) {
    let backoff = Backoff::new();
    loop {
        match scheduler.pop(worker) {
            Some(mut task) => {
                backoff.reset();
                let result = catch_unwind(AssertUnwindSafe(|| task.run())).unwrap_or_else(|_| {
                    Err(Error::Aborted(format!("task on worker {worker} panicked")))
                });
                scheduler.finished(task.as_ref(), worker);
                if let Err(error) = result {
                    error!("task on worker {worker} failed: {error}");
                    scheduler.abort(error);
                }
            }
            None if scheduler.aborted().is_some() || scheduler.is_idle() => break,
            None if backoff.is_completed() => thread::sleep(MAX_IDLE_SLEEP),
            None => backoff.snooze(),
        }
    }
    debug!("worker {worker} exiting");
}
