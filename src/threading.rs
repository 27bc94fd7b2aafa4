//! Thread sizing and CPU affinity helpers shared by the worker pool and the scheduler.

use std::num::NonZeroUsize;

/// Number of worker threads used when none is configured.
///
/// Falls back to a single thread when the platform cannot report its parallelism.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Attempt to pin the current thread to a specific core when supported.
///
/// Restricts the calling thread to `core_id`, which keeps a worker's cache warm when the pool is
/// sized to the machine.
///
/// # Platform Support
/// - **Linux**: Uses `pthread_setaffinity_np`
/// - **Other platforms**: No-op
///
/// # Note
/// Returns `false` when pinning is unsupported, `core_id` is past `CPU_SETSIZE`, or the call was
/// refused; the thread keeps running unpinned either way.
pub fn set_thread_core(core_id: usize) -> bool {
    #[cfg(target_os = "linux")]
    {
        // CPU_SET panics past the end of the fixed-size mask
        if core_id >= libc::CPU_SETSIZE as usize {
            return false;
        }
        unsafe {
            use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_ZERO};
            let mut set: cpu_set_t = std::mem::zeroed();
            CPU_ZERO(&mut set);
            CPU_SET(core_id, &mut set);
            pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set) == 0
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
        false
    }
}
