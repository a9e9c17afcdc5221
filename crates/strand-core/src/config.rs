use std::sync::{OnceLock, RwLock};

// Parallel configuration
//
// The parallel apply path splits the flat element range across worker
// threads only when the work is large enough to amortise the fork/join.
// Every parallel entry point takes a `&ParallelConfig` explicitly; the
// process-wide default below is just a convenient value to pass.

/// Below this many elements a parallel apply runs on the calling thread.
pub const PARALLEL_THRESHOLD: usize = 5000;

/// Runtime knobs for the parallel apply path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Master switch; when false every parallel entry point runs sequentially.
    pub enabled: bool,
    /// Minimum element count before work is partitioned (default: 5000).
    pub threshold: usize,
    /// Number of partitions. `None` uses rayon's current pool size.
    pub num_threads: Option<usize>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: PARALLEL_THRESHOLD,
            num_threads: None,
        }
    }
}

impl ParallelConfig {
    /// A config that never parallelises.
    pub fn sequential() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set the element threshold.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set a fixed partition count.
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads.max(1));
        self
    }

    /// Enable or disable parallel execution.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Partition count used for a traversal.
    pub fn threads(&self) -> usize {
        self.num_threads
            .unwrap_or_else(rayon::current_num_threads)
            .max(1)
    }

    /// Whether a traversal of `n` elements should be partitioned.
    pub fn should_parallelize(&self, n: usize) -> bool {
        self.enabled && n >= self.threshold && self.threads() > 1
    }

    /// Snapshot of the process-wide default.
    pub fn global() -> ParallelConfig {
        let lock = global_slot();
        match lock.read() {
            Ok(cfg) => cfg.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the process-wide default.
    pub fn set_global(cfg: ParallelConfig) {
        let lock = global_slot();
        match lock.write() {
            Ok(mut slot) => *slot = cfg,
            Err(poisoned) => *poisoned.into_inner() = cfg,
        }
    }
}

fn global_slot() -> &'static RwLock<ParallelConfig> {
    static GLOBAL: OnceLock<RwLock<ParallelConfig>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(ParallelConfig::default()))
}
