use std::time::{Duration, Instant};

use task_scheduler::queue::TaskQueue;
use task_scheduler::task::{next_sequence, Task};

#[test]
fn task_keys_roundtrip_through_queue() {
    let now = Instant::now();
    let queue = TaskQueue::new();
    let seq = next_sequence();
    queue.push(Task::new(|| {}, 4, seq).with_deadline(Some(now + Duration::from_millis(3))));

    let head = queue.peek().unwrap();
    assert_eq!(head.priority, 4);
    assert_eq!(head.sequence_number, seq);
    assert_eq!(head.deadline, Some(now + Duration::from_millis(3)));
    assert_eq!(head.interval, Duration::ZERO);
}

#[test]
fn mixed_submission_pops_deadlines_first() {
    let now = Instant::now();
    let queue = TaskQueue::new();
    queue.push(Task::new(|| {}, 3, next_sequence()));
    queue.push(Task::new(|| {}, 91, next_sequence()));
    queue.push(Task::new(|| {}, 89, next_sequence()).with_deadline(Some(now)));
    queue.push(
        Task::new(|| {}, 90, next_sequence()).with_deadline(Some(now + Duration::from_millis(1))),
    );

    let order: Vec<i32> = std::iter::from_fn(|| queue.pop().map(|t| t.priority())).collect();
    assert_eq!(order, vec![89, 90, 91, 3]);
    assert!(queue.pop().is_none());
    assert_eq!(queue.len(), 0);
}
