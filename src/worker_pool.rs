//! Fixed-size worker pool draining a FIFO job queue.
//!
//! The pool is either Stopped (initial and terminal state) or Running. Jobs are accepted only
//! while Running and are executed in submission order by whichever worker wakes first. Stopping
//! drains: every job accepted before [`WorkerPool::stop`] runs to completion before it returns.
//!
//! A panicking job is caught at the worker boundary, logged, and reported through its
//! [`JobHandle`]; the worker moves on to the next job.

use crate::error::{JobError, Result, SchedulerError};
use crate::threading::set_thread_core;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Result reported for each accepted job.
pub type JobOutcome = std::result::Result<(), JobError>;

pub(crate) type OutcomeSender = Sender<JobOutcome>;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Envelope {
    run: Job,
    outcome: Option<OutcomeSender>,
}

struct PoolState {
    jobs: VecDeque<Envelope>,
    running: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Observes the outcome of one submitted job.
///
/// The outcome is delivered once. Dropping the handle does not affect the job.
pub struct JobHandle {
    receiver: Receiver<JobOutcome>,
}

impl JobHandle {
    pub(crate) fn channel() -> (OutcomeSender, JobHandle) {
        let (sender, receiver) = bounded(1);
        (sender, JobHandle { receiver })
    }

    /// Block until the job finishes. A job dropped without running reports
    /// [`JobError::Discarded`].
    pub fn wait(self) -> JobOutcome {
        self.receiver.recv().unwrap_or(Err(JobError::Discarded))
    }

    /// Block for at most `timeout`; `None` if the job is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobOutcome> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(JobError::Discarded)),
        }
    }

    /// Non-blocking check; `None` if the job is still pending.
    pub fn try_result(&self) -> Option<JobOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(JobError::Discarded)),
        }
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
    thread_name: String,
    worker_cores: Vec<usize>,
}

impl WorkerPool {
    /// Create a stopped pool of `threads` workers. Zero is clamped to one.
    pub fn new(threads: usize) -> Self {
        let thread_count = if threads == 0 {
            warn!("worker pool requested with zero threads, using one");
            1
        } else {
            threads
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    jobs: VecDeque::new(),
                    running: false,
                }),
                available: Condvar::new(),
            }),
            threads: Mutex::new(Vec::with_capacity(thread_count)),
            thread_count,
            thread_name: "worker".to_string(),
            worker_cores: Vec::new(),
        }
    }

    /// Prefix for worker thread names (`{prefix}-{id}`).
    pub fn with_thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    /// Pin worker `i` to `cores[i % cores.len()]`. Empty means no pinning.
    pub fn with_worker_cores(mut self, cores: Vec<usize>) -> Self {
        self.worker_cores = cores;
        self
    }

    /// Spawn the workers. Calling `start` on a running pool does nothing.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.running {
                return Ok(());
            }
            state.running = true;
        }

        let mut threads = self.threads.lock();
        for worker_id in 0..self.thread_count {
            let shared = Arc::clone(&self.shared);
            let core = (!self.worker_cores.is_empty())
                .then(|| self.worker_cores[worker_id % self.worker_cores.len()]);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.thread_name, worker_id))
                .spawn(move || {
                    if let Some(core) = core {
                        if !set_thread_core(core) {
                            debug!(worker_id, core, "could not pin worker thread");
                        }
                    }
                    worker_loop(worker_id, &shared);
                });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    drop(threads);
                    self.stop();
                    return Err(SchedulerError::Spawn(err));
                }
            }
        }
        debug!(threads = self.thread_count, name = %self.thread_name, "worker pool started");
        Ok(())
    }

    /// Stop accepting jobs, let workers drain everything already accepted, and join them.
    ///
    /// A no-op when the pool is already stopped. A worker calling `stop` on its own pool is not
    /// joined (it would wait on itself); it exits once the queue is drained.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            self.shared.available.notify_all();
        }

        let handles = std::mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                warn!("worker pool stopped from one of its own workers, skipping self-join");
                continue;
            }
            if handle.join().is_err() {
                warn!("worker thread terminated abnormally");
            }
        }
        debug!(name = %self.thread_name, "worker pool stopped");
    }

    /// Queue `job` and return a handle to its outcome.
    ///
    /// Fails with [`SchedulerError::PoolStopped`] when the pool is not running; the job is then
    /// dropped without running.
    pub fn submit<F>(&self, job: F) -> Result<JobHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let (sender, handle) = JobHandle::channel();
        self.submit_boxed(Box::new(job), Some(sender))?;
        Ok(handle)
    }

    /// Fire-and-forget variant of [`submit`](Self::submit).
    pub fn submit_detached<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_boxed(Box::new(job), None)
    }

    pub(crate) fn submit_boxed(&self, run: Job, outcome: Option<OutcomeSender>) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.running {
            return Err(SchedulerError::PoolStopped);
        }
        state.jobs.push_back(Envelope { run, outcome });
        self.shared.available.notify_one();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Jobs accepted but not yet picked up by a worker.
    pub fn pending_jobs(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(worker_id: usize, shared: &Shared) {
    loop {
        let envelope = {
            let mut state = shared.state.lock();
            loop {
                if let Some(envelope) = state.jobs.pop_front() {
                    break envelope;
                }
                if !state.running {
                    return;
                }
                shared.available.wait(&mut state);
            }
        };
        run_job(worker_id, envelope);
    }
}

fn run_job(worker_id: usize, envelope: Envelope) {
    let Envelope { run, outcome } = envelope;
    let result = panic::catch_unwind(AssertUnwindSafe(run)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        warn!(worker_id, error = %message, "job panicked");
        JobError::Panicked(message)
    });
    if let Some(outcome) = outcome {
        let _ = outcome.send(result);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn running_pool(threads: usize) -> WorkerPool {
        let pool = WorkerPool::new(threads).with_thread_name("test-worker");
        pool.start().unwrap();
        pool
    }

    #[test]
    fn submitted_job_runs() {
        let pool = running_pool(4);
        let handle = pool.submit(|| {}).unwrap();
        assert_eq!(handle.wait_timeout(Duration::from_secs(1)), Some(Ok(())));
    }

    #[test]
    fn many_jobs_all_run() {
        let pool = running_pool(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.wait(), Ok(()));
        }
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn panicking_job_does_not_block_others() {
        let pool = running_pool(1);
        let failing = pool.submit(|| panic!("fail")).unwrap();
        let safe = pool.submit(|| {}).unwrap();

        assert_eq!(
            failing.wait_timeout(Duration::from_secs(1)),
            Some(Err(JobError::Panicked("fail".to_string())))
        );
        assert_eq!(safe.wait_timeout(Duration::from_secs(1)), Some(Ok(())));
    }

    #[test]
    fn no_jobs_run_after_stop() {
        let pool = running_pool(2);
        pool.stop();
        assert!(!pool.is_running());

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let rejected = pool.submit(move || {
            ran_clone.fetch_add(1, Ordering::Relaxed);
        });
        assert!(matches!(rejected, Err(SchedulerError::PoolStopped)));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn pending_jobs_drained_on_stop() {
        let pool = running_pool(2);
        let gate = Arc::new(Barrier::new(3));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let gate = Arc::clone(&gate);
            let done = Arc::clone(&done);
            pool.submit_detached(move || {
                gate.wait();
                done.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        for _ in 0..3 {
            let done = Arc::clone(&done);
            pool.submit_detached(move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }

        gate.wait();
        pool.stop();
        assert_eq!(done.load(Ordering::Relaxed), 5);
        assert_eq!(pool.pending_jobs(), 0);
    }

    #[test]
    fn zero_threads_clamped_to_one() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.thread_count(), 1);
        pool.start().unwrap();
        assert_eq!(
            pool.submit(|| {})
                .unwrap()
                .wait_timeout(Duration::from_secs(1)),
            Some(Ok(()))
        );
    }

    #[test]
    fn single_worker_preserves_fifo() {
        let pool = running_pool(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let seen = Arc::clone(&seen);
            pool.submit_detached(move || seen.lock().push(i)).unwrap();
        }
        pool.stop();
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let pool = running_pool(2);
        pool.start().unwrap();
        assert!(pool.is_running());
        pool.stop();
        pool.stop();
        assert!(!pool.is_running());
    }

    #[test]
    fn pool_can_restart_after_stop() {
        let pool = running_pool(2);
        pool.stop();
        pool.start().unwrap();
        assert_eq!(
            pool.submit(|| {})
                .unwrap()
                .wait_timeout(Duration::from_secs(1)),
            Some(Ok(()))
        );
    }

    #[test]
    fn unusable_core_leaves_worker_unpinned() {
        let pool = WorkerPool::new(1).with_worker_cores(vec![5000]);
        pool.start().unwrap();
        let handle = pool.submit(|| {}).unwrap();
        assert_eq!(handle.wait_timeout(Duration::from_secs(1)), Some(Ok(())));
        pool.stop();
    }

    #[test]
    fn dropping_pool_drains_jobs() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = running_pool(1);
            for _ in 0..4 {
                let done = Arc::clone(&done);
                pool.submit_detached(move || {
                    thread::sleep(Duration::from_millis(2));
                    done.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            }
        }
        assert_eq!(done.load(Ordering::Relaxed), 4);
    }
}
