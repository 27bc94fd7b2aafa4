//! Lock-free queueing-latency aggregate.
//!
//! Four independent atomics hold the running count, sum, minimum and maximum of the observed
//! latencies. Updates never block: count and sum use `fetch_add`, the extremes use a
//! compare-and-retry loop. A reader may see the four values at slightly different instants
//! (e.g. a count that already includes a sample whose sum has not landed yet); exact snapshots are
//! not provided.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Running aggregate of latency samples (signed integer units; microseconds when fed by the
/// scheduler).
#[derive(Debug)]
pub struct LatencyStatistics {
    count: AtomicU64,
    sum: AtomicI64,
    min: AtomicI64,
    max: AtomicI64,
}

/// Serializable view of [`LatencyStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub mean: f64,
    /// `None` until the first sample arrives.
    pub min: Option<i64>,
    pub max: i64,
}

impl LatencyStatistics {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicI64::new(0),
            min: AtomicI64::new(i64::MAX),
            max: AtomicI64::new(0),
        }
    }

    /// Record one latency sample.
    pub fn update(&self, latency: i64) {
        self.sum.fetch_add(latency, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut current = self.min.load(Ordering::Relaxed);
        while latency < current {
            match self.min.compare_exchange_weak(
                current,
                latency,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let mut current = self.max.load(Ordering::Relaxed);
        while latency > current {
            match self.max.compare_exchange_weak(
                current,
                latency,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// `(mean, min, max)`. With no samples: `(0.0, i64::MAX as f64, 0.0)`.
    pub fn read(&self) -> (f64, f64, f64) {
        let count = self.count.load(Ordering::Relaxed);
        let mean = if count > 0 {
            self.sum.load(Ordering::Relaxed) as f64 / count as f64
        } else {
            0.0
        };
        (
            mean,
            self.min.load(Ordering::Relaxed) as f64,
            self.max.load(Ordering::Relaxed) as f64,
        )
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let (mean, _, _) = self.read();
        let min = self.min.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            mean,
            min: (count > 0 && min != i64::MAX).then_some(min),
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

impl Default for LatencyStatistics {
    fn default() -> Self {
        Self::new()
    }
}
