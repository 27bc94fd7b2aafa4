//! Thread-safe priority task queue.
//!
//! A binary heap ordered by [`Task`]'s total order, guarded by a single `parking_lot` mutex. Every
//! operation takes that lock for its whole duration, so concurrent callers observe one
//! serialization of pushes and pops. A condition variable lets the dispatch loop sleep while the
//! queue is empty instead of spinning.

use crate::task::{Task, TaskKeys};
use parking_lot::{Condvar, Mutex};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub struct TaskQueue {
    heap: Mutex<BinaryHeap<Task>>,
    not_empty: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Insert a task and wake one waiting consumer. O(log n).
    pub fn push(&self, task: Task) {
        let mut heap = self.heap.lock();
        heap.push(task);
        self.not_empty.notify_one();
    }

    /// Remove and return the head of the queue, or `None` when empty. O(log n).
    pub fn pop(&self) -> Option<Task> {
        self.heap.lock().pop()
    }

    /// Keys of the current head without removing it.
    ///
    /// This is an owned copy: it stays readable after later pushes and pops, but it may no longer
    /// describe the head once another caller mutates the queue.
    pub fn peek(&self) -> Option<TaskKeys> {
        self.heap.lock().peek().map(Task::keys)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Block until a task can be popped, `running` turns false, or `timeout` elapses.
    ///
    /// Returns `None` on shutdown and on timeout. A `None` timeout waits indefinitely.
    pub fn pop_wait(&self, running: &AtomicBool, timeout: Option<Duration>) -> Option<Task> {
        let wake_at = timeout.map(|timeout| Instant::now() + timeout);
        let mut heap = self.heap.lock();
        loop {
            if !running.load(Ordering::Acquire) {
                return None;
            }
            if let Some(task) = heap.pop() {
                return Some(task);
            }
            match wake_at {
                Some(wake_at) => {
                    if self.not_empty.wait_until(&mut heap, wake_at).timed_out() {
                        return None;
                    }
                }
                None => self.not_empty.wait(&mut heap),
            }
        }
    }

    /// Wake every `pop_wait` caller so it re-checks its running flag.
    ///
    /// Notifying under the lock guarantees a waiter cannot check the flag and then miss the wakeup.
    pub fn wake_all(&self) {
        let _heap = self.heap.lock();
        self.not_empty.notify_all();
    }

    /// Remove every task, head first.
    pub fn drain(&self) -> Vec<Task> {
        let mut heap = self.heap.lock();
        let mut drained = Vec::with_capacity(heap.len());
        while let Some(task) = heap.pop() {
            drained.push(task);
        }
        drained
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
