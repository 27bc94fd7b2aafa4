//! Task representation and the total order the priority queue is built on.

use crate::worker_pool::OutcomeSender;
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Allocate the next process-wide sequence number.
///
/// Values are strictly increasing and never reused, which makes the FIFO tie-break of the task
/// order deterministic.
pub fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Callable carried by a [`Task`].
///
/// One-shot work is consumed when it runs. Recurring work is shared between a task and all of
/// its successors and is never mutated.
pub enum Work {
    Once(Box<dyn FnOnce() + Send + 'static>),
    Recurring(Arc<dyn Fn() + Send + Sync + 'static>),
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Once(_) => f.write_str("Work::Once"),
            Work::Recurring(_) => f.write_str("Work::Recurring"),
        }
    }
}

/// Copy of the ordering keys of a task.
///
/// Returned by [`TaskQueue::peek`](crate::queue::TaskQueue::peek) instead of a reference, so a
/// peeked head stays valid after the queue is mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskKeys {
    pub priority: i32,
    pub deadline: Option<Instant>,
    pub sequence_number: u64,
    pub interval: Duration,
    pub enqueue_time: Instant,
}

impl TaskKeys {
    /// Compare two key sets with the scheduler's total order.
    ///
    /// `Greater` means `self` is popped first:
    /// 1. a deadline beats no deadline,
    /// 2. the earlier deadline wins,
    /// 3. then the higher priority,
    /// 4. then the smaller sequence number (FIFO).
    pub fn order(&self, other: &Self) -> Ordering {
        match (self.deadline, other.deadline) {
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(mine), Some(theirs)) if mine != theirs => return theirs.cmp(&mine),
            _ => {}
        }
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence_number.cmp(&self.sequence_number))
    }
}

/// One unit of schedulable work plus its ordering keys.
pub struct Task {
    work: Work,
    keys: TaskKeys,
    /// Recurring successors get `deadline = now + interval` when set.
    rearm_deadline: bool,
    cancelled: Option<Arc<AtomicBool>>,
    /// Set while a run of this recurring task sits in the worker pool.
    in_flight: Option<Arc<AtomicBool>>,
    outcome: Option<OutcomeSender>,
}

impl Task {
    /// Build a one-shot task with no deadline, enqueued now.
    pub fn new<F>(work: F, priority: i32, sequence_number: u64) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_work(Work::Once(Box::new(work)), priority, sequence_number)
    }

    /// Build a recurring task. A zero `interval` makes it behave like a one-shot task.
    pub fn recurring(
        work: Arc<dyn Fn() + Send + Sync + 'static>,
        priority: i32,
        sequence_number: u64,
        interval: Duration,
    ) -> Self {
        Self::from_work(Work::Recurring(work), priority, sequence_number).with_interval(interval)
    }

    fn from_work(work: Work, priority: i32, sequence_number: u64) -> Self {
        Self {
            work,
            keys: TaskKeys {
                priority,
                deadline: None,
                sequence_number,
                interval: Duration::ZERO,
                enqueue_time: Instant::now(),
            },
            rearm_deadline: false,
            cancelled: None,
            in_flight: None,
            outcome: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.keys.deadline = deadline;
        self
    }

    /// Re-arm period. Only recurring work is re-armed; a one-shot task just carries the value.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.keys.interval = interval;
        self
    }

    pub fn with_enqueue_time(mut self, enqueue_time: Instant) -> Self {
        self.keys.enqueue_time = enqueue_time;
        self
    }

    pub(crate) fn with_rearm_deadline(mut self, rearm_deadline: bool) -> Self {
        self.rearm_deadline = rearm_deadline;
        self
    }

    pub(crate) fn with_cancel_flag(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = Some(cancelled);
        self
    }

    pub(crate) fn with_in_flight_flag(mut self, in_flight: Arc<AtomicBool>) -> Self {
        self.in_flight = Some(in_flight);
        self
    }

    pub(crate) fn in_flight_flag(&self) -> Option<Arc<AtomicBool>> {
        self.in_flight.clone()
    }

    pub(crate) fn with_outcome(mut self, outcome: OutcomeSender) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn keys(&self) -> TaskKeys {
        self.keys
    }

    pub fn priority(&self) -> i32 {
        self.keys.priority
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.keys.deadline
    }

    pub fn interval(&self) -> Duration {
        self.keys.interval
    }

    pub fn enqueue_time(&self) -> Instant {
        self.keys.enqueue_time
    }

    pub fn sequence_number(&self) -> u64 {
        self.keys.sequence_number
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self.work, Work::Recurring(_)) && !self.keys.interval.is_zero()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .is_some_and(|flag| flag.load(AtomicOrdering::Acquire))
    }

    /// Capture what is needed to build this task's successor after it is handed to a worker.
    pub(crate) fn rearm(&self) -> Option<Rearm> {
        if !self.is_recurring() {
            return None;
        }
        match &self.work {
            Work::Recurring(work) => Some(Rearm {
                work: Arc::clone(work),
                priority: self.keys.priority,
                interval: self.keys.interval,
                rearm_deadline: self.rearm_deadline,
                cancelled: self.cancelled.clone(),
                in_flight: self.in_flight.clone(),
            }),
            Work::Once(_) => None,
        }
    }

    /// Consume the task, returning a runnable closure and the optional outcome channel.
    pub(crate) fn into_job(self) -> (Box<dyn FnOnce() + Send + 'static>, Option<OutcomeSender>) {
        let job: Box<dyn FnOnce() + Send + 'static> = match self.work {
            Work::Once(work) => work,
            Work::Recurring(work) => Box::new(move || work()),
        };
        (job, self.outcome)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("work", &self.work)
            .field("keys", &self.keys)
            .field("rearm_deadline", &self.rearm_deadline)
            .finish_non_exhaustive()
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.keys.order(&other.keys)
    }
}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Task {}

/// Template for the successor of a recurring task.
pub(crate) struct Rearm {
    work: Arc<dyn Fn() + Send + Sync + 'static>,
    priority: i32,
    interval: Duration,
    rearm_deadline: bool,
    cancelled: Option<Arc<AtomicBool>>,
    in_flight: Option<Arc<AtomicBool>>,
}

impl Rearm {
    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .is_some_and(|flag| flag.load(AtomicOrdering::Acquire))
    }

    /// True while the previous run has not finished on a worker.
    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|flag| flag.load(AtomicOrdering::Acquire))
    }

    /// Build the next run: fresh sequence number, enqueued at `now`.
    pub(crate) fn successor(&self, now: Instant) -> Task {
        let deadline = self.rearm_deadline.then(|| now + self.interval);
        let mut task = Task::recurring(
            Arc::clone(&self.work),
            self.priority,
            next_sequence(),
            self.interval,
        )
        .with_deadline(deadline)
        .with_enqueue_time(now)
        .with_rearm_deadline(self.rearm_deadline);
        if let Some(flag) = &self.cancelled {
            task = task.with_cancel_flag(Arc::clone(flag));
        }
        if let Some(flag) = &self.in_flight {
            task = task.with_in_flight_flag(Arc::clone(flag));
        }
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn task(priority: i32, seq: u64, deadline: Option<Instant>) -> Task {
        Task::new(|| {}, priority, seq).with_deadline(deadline)
    }

    #[test]
    fn sequence_numbers_strictly_increase() {
        let a = next_sequence();
        let b = next_sequence();
        let c = next_sequence();
        assert!(a < b && b < c);
    }

    #[test]
    fn deadline_beats_priority() {
        let now = Instant::now();
        let urgent = task(1, 2, Some(now));
        let loud = task(99, 1, None);
        assert!(urgent > loud);
        assert!(loud < urgent);
    }

    #[test]
    fn earlier_deadline_is_greater() {
        let now = Instant::now();
        let early = task(1, 1, Some(now));
        let late = task(50, 2, Some(now + Duration::from_millis(1)));
        assert!(early > late);
    }

    #[test]
    fn priority_then_fifo_break_ties() {
        let now = Instant::now();
        assert!(task(9, 5, Some(now)) > task(3, 1, Some(now)));
        assert!(task(4, 1, None) > task(4, 2, None));
        assert_eq!(task(4, 7, None).cmp(&task(4, 7, None)), Ordering::Equal);
    }

    #[test]
    fn binary_heap_pops_in_total_order() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(task(3, 1, None));
        heap.push(task(91, 2, None));
        heap.push(task(89, 3, Some(now)));
        heap.push(task(90, 4, Some(now + Duration::from_millis(1))));

        let order: Vec<i32> = std::iter::from_fn(|| heap.pop().map(|t| t.priority())).collect();
        assert_eq!(order, vec![89, 90, 91, 3]);
    }

    #[test]
    fn zero_interval_recurring_is_one_shot() {
        let work: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let task = Task::recurring(work, 1, 1, Duration::ZERO);
        assert!(!task.is_recurring());
        assert!(task.rearm().is_none());
    }

    #[test]
    fn interval_builder_sets_keys() {
        let work: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let built = Task::recurring(Arc::clone(&work), 2, 10, Duration::from_millis(3));
        assert_eq!(built.interval(), Duration::from_millis(3));
        assert!(built.is_recurring());

        let one_shot = Task::new(|| {}, 2, 11).with_interval(Duration::from_millis(3));
        assert_eq!(one_shot.keys().interval, Duration::from_millis(3));
        assert!(!one_shot.is_recurring());
        assert!(one_shot.rearm().is_none());
    }

    #[test]
    fn in_flight_flag_is_shared_with_successor() {
        let flag = Arc::new(AtomicBool::new(false));
        let work: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let first = Task::recurring(work, 1, next_sequence(), Duration::from_millis(5))
            .with_in_flight_flag(Arc::clone(&flag));
        let rearm = first.rearm().unwrap();
        assert!(!rearm.is_in_flight());

        flag.store(true, AtomicOrdering::Release);
        assert!(rearm.is_in_flight());
        let next = rearm.successor(Instant::now());
        assert!(next
            .in_flight_flag()
            .is_some_and(|shared| Arc::ptr_eq(&shared, &flag)));
    }

    #[test]
    fn successor_refreshes_sequence_and_deadline() {
        let work: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let start = Instant::now();
        let first = Task::recurring(work, 7, next_sequence(), Duration::from_millis(10))
            .with_deadline(Some(start))
            .with_enqueue_time(start)
            .with_rearm_deadline(true);
        let rearm = first.rearm().expect("recurring task must re-arm");

        let later = start + Duration::from_millis(12);
        let next = rearm.successor(later);
        assert!(next.sequence_number() > first.sequence_number());
        assert_eq!(next.priority(), 7);
        assert_eq!(next.interval(), Duration::from_millis(10));
        assert_eq!(next.enqueue_time(), later);
        assert_eq!(next.deadline(), Some(later + Duration::from_millis(10)));
    }

    #[test]
    fn successor_without_deadlines_stays_without() {
        let work: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let first = Task::recurring(work, 1, next_sequence(), Duration::from_millis(5));
        let next = first.rearm().unwrap().successor(Instant::now());
        assert_eq!(next.deadline(), None);
    }

    #[test]
    fn cancel_flag_propagates_to_successor() {
        let flag = Arc::new(AtomicBool::new(false));
        let work: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let first = Task::recurring(work, 1, next_sequence(), Duration::from_millis(5))
            .with_cancel_flag(Arc::clone(&flag));
        let rearm = first.rearm().unwrap();
        flag.store(true, AtomicOrdering::Release);
        assert!(first.is_cancelled());
        assert!(rearm.is_cancelled());
        assert!(rearm.successor(Instant::now()).is_cancelled());
    }
}
