pub mod clock;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod statistics;
pub mod task;
pub mod threading;
pub mod worker_pool;

// Re-export for easier testing
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JobError, Result, SchedulerError};
pub use scheduler::{RecurringHandle, Scheduler, SchedulerConfig};
pub use statistics::{LatencySnapshot, LatencyStatistics};
pub use worker_pool::{JobHandle, WorkerPool};
