use std::time::Duration;

/// Configuration for an event loop and its ring.
#[derive(Clone)]
pub struct Config {
    /// Number of SQ entries. The kernel rounds up to a power of two.
    pub ring_entries: u32,
    /// Set IOSQE_ASYNC on data operations to force async execution.
    pub sqe_async: bool,
    /// Sleep applied after an unexpected loop error before resuming, so a
    /// persistent failure cannot spin the thread.
    pub error_cooldown: Duration,
    /// Worker/thread configuration.
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ring_entries: 4096,
            sqe_async: false,
            error_cooldown: Duration::from_secs(1),
            worker: WorkerConfig::default(),
        }
    }
}

/// Configuration for the thread-per-loop worker model.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Number of event-loop threads. 0 = number of CPUs.
    pub threads: usize,
    /// Whether to pin each loop thread to a CPU core.
    pub pin_to_core: bool,
    /// Starting CPU core index for pinning.
    pub core_offset: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            pin_to_core: false,
            core_offset: 0,
        }
    }
}
