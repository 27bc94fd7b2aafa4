//! Scheduler orchestration.
//!
//! This module wires the priority task queue, the worker pool and the latency statistics
//! together. Callers push one-shot or recurring tasks; one or more dispatch threads pop the head
//! of the queue, hand its callable to the pool and re-arm recurring tasks once their interval has
//! elapsed.
//!
//! Teardown order is fixed: dispatch threads stop first, then the pool drains every job it already
//! accepted, then whatever is still queued is discarded without running.

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SchedulerError};
use crate::queue::TaskQueue;
use crate::statistics::{LatencySnapshot, LatencyStatistics};
use crate::task::{next_sequence, Rearm, Task};
use crate::threading::default_parallelism;
use crate::worker_pool::{JobHandle, WorkerPool};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Top-level scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker pool size. Zero is clamped to one.
    pub worker_threads: usize,
    /// Number of dispatch threads moving tasks from the queue to the pool. Zero is clamped to one.
    pub dispatch_threads: usize,
    /// Prefix for every thread the scheduler spawns.
    pub thread_name_prefix: String,
    /// Cores the workers are pinned to, round robin. Empty disables pinning.
    pub worker_cores: Vec<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_parallelism(),
            dispatch_threads: 1,
            thread_name_prefix: "task-scheduler".to_string(),
            worker_cores: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_worker_threads(worker_threads: usize) -> Self {
        Self {
            worker_threads,
            ..Self::default()
        }
    }
}

/// Stops future runs of a recurring task.
///
/// Cancelling is cooperative: a run already handed to the worker pool still completes, but no
/// queued or re-armed successor is dispatched afterwards.
#[derive(Debug, Clone)]
pub struct RecurringHandle {
    cancelled: Arc<AtomicBool>,
    first_sequence: u64,
}

impl RecurringHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }

    /// Sequence number of the first run.
    pub fn first_sequence(&self) -> u64 {
        self.first_sequence
    }
}

/// Recurring task waiting for its interval to elapse.
struct PendingRearm {
    due: Instant,
    order: u64,
    rearm: Rearm,
}

impl Ord for PendingRearm {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap (earliest due first)
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for PendingRearm {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PendingRearm {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingRearm {}

struct DispatchControl {
    paused: bool,
    stopping: bool,
}

struct Shared {
    queue: TaskQueue,
    pool: WorkerPool,
    stats: Arc<LatencyStatistics>,
    clock: Arc<dyn Clock>,
    accepting: AtomicBool,
    /// Cleared while paused or stopping; `pop_wait` returns as soon as it is false.
    active: AtomicBool,
    control: Mutex<DispatchControl>,
    resumed: Condvar,
    rearms: Mutex<BinaryHeap<PendingRearm>>,
}

impl Shared {
    /// Push the successor of every recurring task whose interval has elapsed.
    ///
    /// A task whose previous run has not finished yet is pushed back by one interval instead, so
    /// a slow recurring task holds at most one run in the worker pool.
    ///
    /// Returns the time until the next re-arm is due, if any.
    fn fire_due_rearms(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut rearms = self.rearms.lock();
        loop {
            match rearms.peek() {
                None => return None,
                Some(next) if next.due > now => return Some(next.due.duration_since(now)),
                Some(_) => {}
            }
            if let Some(pending) = rearms.pop() {
                if pending.rearm.is_cancelled() {
                    continue;
                }
                if pending.rearm.is_in_flight() {
                    trace!("previous run still in flight, deferring re-arm");
                    rearms.push(PendingRearm {
                        due: now + pending.rearm.interval(),
                        order: next_sequence(),
                        rearm: pending.rearm,
                    });
                    continue;
                }
                self.queue.push(pending.rearm.successor(now));
            }
        }
    }

    fn schedule_rearm(&self, rearm: Rearm, now: Instant) {
        let pending = PendingRearm {
            due: now + rearm.interval(),
            order: next_sequence(),
            rearm,
        };
        self.rearms.lock().push(pending);
    }

    /// Wrap a task so the worker records its queueing latency right before running it.
    fn dispatch(&self, task: Task) -> Result<()> {
        let enqueue_time = task.enqueue_time();
        let in_flight = InFlight::mark(task.in_flight_flag());
        let (work, outcome) = task.into_job();
        let stats = Arc::clone(&self.stats);
        let clock = Arc::clone(&self.clock);
        let job = Box::new(move || {
            let _in_flight = in_flight;
            stats.update(latency_micros(enqueue_time, clock.now()));
            work();
        });
        self.pool.submit_boxed(job, outcome)
    }
}

/// Holds a recurring task's in-flight flag and clears it when the run ends, panics included.
/// A job dropped without running clears it as well.
struct InFlight(Option<Arc<AtomicBool>>);

impl InFlight {
    fn mark(flag: Option<Arc<AtomicBool>>) -> Self {
        if let Some(flag) = &flag {
            flag.store(true, AtomicOrdering::Release);
        }
        Self(flag)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(flag) = &self.0 {
            flag.store(false, AtomicOrdering::Release);
        }
    }
}

fn latency_micros(enqueued: Instant, started: Instant) -> i64 {
    i64::try_from(started.saturating_duration_since(enqueued).as_micros()).unwrap_or(i64::MAX)
}

fn dispatch_loop(dispatcher_id: usize, shared: &Shared) {
    debug!(dispatcher_id, "dispatch loop started");
    loop {
        {
            let mut control = shared.control.lock();
            while control.paused && !control.stopping {
                shared.resumed.wait(&mut control);
            }
            if control.stopping {
                break;
            }
        }

        let timeout = shared.fire_due_rearms();
        let Some(task) = shared.queue.pop_wait(&shared.active, timeout) else {
            continue;
        };

        let sequence = task.sequence_number();
        if task.is_cancelled() {
            trace!(dispatcher_id, sequence, "skipping cancelled task");
            continue;
        }

        let rearm = task.rearm();
        if let Err(err) = shared.dispatch(task) {
            debug!(dispatcher_id, sequence, error = %err, "task dropped, dispatch loop exiting");
            break;
        }
        trace!(dispatcher_id, sequence, "task dispatched");

        if let Some(rearm) = rearm {
            shared.schedule_rearm(rearm, shared.clock.now());
        }
    }
    debug!(dispatcher_id, "dispatch loop exited");
}

/// In-process priority/deadline task scheduler.
///
/// Dropping the scheduler runs [`Scheduler::shutdown`].
pub struct Scheduler {
    shared: Arc<Shared>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Scheduler with `worker_threads` workers, one dispatch thread and the system clock.
    pub fn new(worker_threads: usize) -> Result<Self> {
        Self::with_config(SchedulerConfig::with_worker_threads(worker_threads))
    }

    pub fn with_config(config: SchedulerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build and start a scheduler reading time from `clock`.
    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = WorkerPool::new(config.worker_threads)
            .with_thread_name(format!("{}-worker", config.thread_name_prefix))
            .with_worker_cores(config.worker_cores.clone());
        Self::from_parts(config, clock, TaskQueue::new(), pool)
    }

    /// Assemble a scheduler around a caller-built queue and pool.
    ///
    /// Tasks already in `queue` are dispatched once the scheduler starts. `pool` is started if it
    /// is not running yet; its own thread count and naming win over `config.worker_threads`,
    /// `thread_name_prefix` and `worker_cores`, which only apply when the scheduler builds the
    /// pool itself.
    pub fn from_parts(
        mut config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        queue: TaskQueue,
        pool: WorkerPool,
    ) -> Result<Self> {
        if config.dispatch_threads == 0 {
            warn!("scheduler configured with zero dispatch threads, using one");
            config.dispatch_threads = 1;
        }
        pool.start()?;

        let shared = Arc::new(Shared {
            queue,
            pool,
            stats: Arc::new(LatencyStatistics::new()),
            clock,
            accepting: AtomicBool::new(true),
            active: AtomicBool::new(true),
            control: Mutex::new(DispatchControl {
                paused: false,
                stopping: false,
            }),
            resumed: Condvar::new(),
            rearms: Mutex::new(BinaryHeap::new()),
        });

        let scheduler = Self {
            shared,
            dispatchers: Mutex::new(Vec::with_capacity(config.dispatch_threads)),
            config,
        };

        for dispatcher_id in 0..scheduler.config.dispatch_threads {
            let shared = Arc::clone(&scheduler.shared);
            let handle = thread::Builder::new()
                .name(format!(
                    "{}-dispatch-{}",
                    scheduler.config.thread_name_prefix, dispatcher_id
                ))
                .spawn(move || dispatch_loop(dispatcher_id, &shared))?;
            scheduler.dispatchers.lock().push(handle);
        }

        debug!(
            workers = scheduler.shared.pool.thread_count(),
            dispatchers = scheduler.config.dispatch_threads,
            "scheduler started"
        );
        Ok(scheduler)
    }

    /// Queue a one-shot task. Returns immediately.
    pub fn schedule<F>(&self, work: F, priority: i32, deadline: Option<Instant>) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Task::new(work, priority, next_sequence()).with_deadline(deadline))
    }

    /// Queue a one-shot task and observe its outcome.
    ///
    /// The handle reports [`JobError::Discarded`](crate::error::JobError::Discarded) if the
    /// task is still queued when the scheduler shuts down.
    pub fn schedule_with_handle<F>(
        &self,
        work: F,
        priority: i32,
        deadline: Option<Instant>,
    ) -> Result<JobHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let (outcome, handle) = JobHandle::channel();
        self.enqueue(
            Task::new(work, priority, next_sequence())
                .with_deadline(deadline)
                .with_outcome(outcome),
        )?;
        Ok(handle)
    }

    /// Run `work` every `interval` until cancelled or the scheduler shuts down.
    ///
    /// The next run is queued `interval` after the previous one was handed to a worker. If that run
    /// is still waiting or executing at that point, the next one is put off by another interval,
    /// so runs of one recurring task never pile up in the pool.
    pub fn schedule_recurring<F>(
        &self,
        work: F,
        priority: i32,
        interval: Duration,
    ) -> Result<RecurringHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.enqueue_recurring(Arc::new(work), priority, interval, None)
    }

    /// Recurring task whose first run is ordered by `first_deadline`; each later run gets
    /// `deadline = now + interval` when it is re-armed.
    pub fn schedule_recurring_with_deadline<F>(
        &self,
        work: F,
        priority: i32,
        interval: Duration,
        first_deadline: Instant,
    ) -> Result<RecurringHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.enqueue_recurring(Arc::new(work), priority, interval, Some(first_deadline))
    }

    fn enqueue_recurring(
        &self,
        work: Arc<dyn Fn() + Send + Sync + 'static>,
        priority: i32,
        interval: Duration,
        deadline: Option<Instant>,
    ) -> Result<RecurringHandle> {
        if interval.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let first_sequence = next_sequence();
        let task = Task::recurring(work, priority, first_sequence, interval)
            .with_deadline(deadline)
            .with_rearm_deadline(deadline.is_some())
            .with_cancel_flag(Arc::clone(&cancelled))
            .with_in_flight_flag(Arc::new(AtomicBool::new(false)));
        self.enqueue(task)?;
        Ok(RecurringHandle {
            cancelled,
            first_sequence,
        })
    }

    fn enqueue(&self, task: Task) -> Result<()> {
        if !self.shared.accepting.load(AtomicOrdering::Acquire) {
            return Err(SchedulerError::ShuttingDown);
        }
        let task = task.with_enqueue_time(self.shared.clock.now());
        trace!(sequence = task.sequence_number(), priority = task.priority(), "task queued");
        self.shared.queue.push(task);
        Ok(())
    }

    /// `(mean, min, max)` queueing latency in microseconds.
    pub fn latency_statistics(&self) -> (f64, f64, f64) {
        self.shared.stats.read()
    }

    pub fn latency_snapshot(&self) -> LatencySnapshot {
        self.shared.stats.snapshot()
    }

    /// Tasks waiting in the priority queue (not yet dispatched).
    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn worker_threads(&self) -> usize {
        self.shared.pool.thread_count()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.accepting.load(AtomicOrdering::Acquire)
    }

    /// Hold dispatching. Tasks keep queuing; a task already popped still runs.
    pub fn pause(&self) {
        {
            let mut control = self.shared.control.lock();
            if control.stopping {
                return;
            }
            control.paused = true;
            self.shared.active.store(false, AtomicOrdering::Release);
        }
        self.shared.queue.wake_all();
    }

    pub fn resume(&self) {
        let mut control = self.shared.control.lock();
        if control.stopping {
            return;
        }
        control.paused = false;
        self.shared.active.store(true, AtomicOrdering::Release);
        self.shared.resumed.notify_all();
    }

    /// Stop dispatching, drain the worker pool and discard every task still queued.
    ///
    /// Idempotent. Once it returns no task callable runs again.
    pub fn shutdown(&self) {
        if !self.shared.accepting.swap(false, AtomicOrdering::AcqRel) {
            return;
        }

        {
            let mut control = self.shared.control.lock();
            control.stopping = true;
            self.shared.active.store(false, AtomicOrdering::Release);
            self.shared.resumed.notify_all();
        }
        self.shared.queue.wake_all();

        let dispatchers = std::mem::take(&mut *self.dispatchers.lock());
        for handle in dispatchers {
            if handle.join().is_err() {
                warn!("dispatch thread terminated abnormally");
            }
        }

        self.shared.pool.stop();

        let discarded = self.shared.queue.drain().len();
        let rearms = {
            let mut rearms = self.shared.rearms.lock();
            let count = rearms.len();
            rearms.clear();
            count
        };
        debug!(discarded, rearms, "scheduler shut down");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
