//! Runtime configuration for the processing engine
//!
//! Every tunable lives in one of three small structs, bundled into
//! [`EngineConfig`]:
//!
//! - [`PoolConfig`]: worker count and queue capacity
//! - [`BatchConfig`]: composite job size and flush interval
//! - [`RetryPolicy`]: how often a job re-runs after a version conflict
//!
//! Constructors never fail. A zero value is replaced by the default and a
//! warning is logged, so a bad flag degrades instead of aborting a run.

use std::time::Duration;

use tracing::warn;

/// Worker pool sizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of concurrent workers
    pub worker_count: usize,

    /// Capacity of the bounded job queue
    pub queue_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            queue_size: 1000,
        }
    }
}

impl PoolConfig {
    /// Create a new PoolConfig, replacing zero values with defaults
    pub fn new(worker_count: usize, queue_size: usize) -> Self {
        let default = Self::default();

        let worker_count = if worker_count == 0 {
            warn!(
                requested = worker_count,
                default = default.worker_count,
                "Invalid worker_count, using default"
            );
            default.worker_count
        } else {
            worker_count
        };

        let queue_size = if queue_size == 0 {
            warn!(
                requested = queue_size,
                default = default.queue_size,
                "Invalid queue_size, using default"
            );
            default.queue_size
        } else {
            queue_size
        };

        Self {
            worker_count,
            queue_size,
        }
    }
}

/// Batch processor tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Jobs per composite job; reaching it triggers a flush
    pub batch_size: usize,

    /// Upper bound on how long a job waits in the buffer
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_millis(100),
        }
    }
}

impl BatchConfig {
    /// Create a new BatchConfig, replacing zero values with defaults
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        let default = Self::default();

        let batch_size = if batch_size == 0 {
            warn!(
                requested = batch_size,
                default = default.batch_size,
                "Invalid batch_size, using default"
            );
            default.batch_size
        } else {
            batch_size
        };

        // tokio::time::interval panics on a zero period
        let flush_interval = if flush_interval.is_zero() {
            warn!(
                default_ms = default.flush_interval.as_millis() as u64,
                "Invalid flush_interval, using default"
            );
            default.flush_interval
        } else {
            flush_interval
        };

        Self {
            batch_size,
            flush_interval,
        }
    }
}

/// Bounded retry for jobs that lose a version race
///
/// Attempt `n` (1-based) that fails with a retryable error sleeps
/// `base_delay * n` before the next attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Create a new RetryPolicy; zero attempts falls back to the default
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        let max_attempts = if max_attempts == 0 {
            let default = Self::default().max_attempts;
            warn!(default, "Invalid max_attempts, using default");
            default
        } else {
            max_attempts
        };

        Self {
            max_attempts,
            base_delay,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the given failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Complete engine configuration
///
/// `batch` is optional: without it the service submits one job per
/// transaction straight to the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub batch: Option<BatchConfig>,
    pub retry: RetryPolicy,
}
