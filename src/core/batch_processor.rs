//! Size- and time-triggered grouping of transaction jobs
//!
//! The `BatchProcessor` buffers [`TransactionJob`]s and hands them to the
//! worker pool as a single [`CompositeJob`] when either:
//!
//! - the buffer reaches `batch_size`, or
//! - the flush ticker fires (every `flush_interval`)
//!
//! # Design
//!
//! Flushing happens under the buffer lock, so a job is part of exactly one
//! composite. If the pool rejects a composite (queue full), its jobs go back
//! into the buffer and the ticker tries again; a buffered job is never
//! dropped silently.
//!
//! The buffer holds at most `batch_size` plus the pool's queue size. Past
//! that, `add_job` fails with `QueueFull` like a direct submission would.
//! While the pool's queue is full, adding a job never attempts a flush.
//!
//! # Thread Safety
//!
//! `new` returns an `Arc<BatchProcessor>`. The ticker task only holds a weak
//! reference, so dropping the last handle also ends the ticker.

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BatchConfig;
use crate::core::job::{CompositeJob, Job, TransactionJob};
use crate::core::worker_pool::WorkerPool;
use crate::types::ProcessingError;

pub struct BatchProcessor {
    pool: Arc<WorkerPool>,
    config: BatchConfig,
    capacity: usize,
    buffer: Mutex<Vec<TransactionJob>>,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.config)
            .field("capacity", &self.capacity)
            .field("buffered", &self.pending_len())
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BatchProcessor {
    /// Create a processor and spawn its flush ticker
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `pool` - pool that receives the composite jobs
    /// * `config` - batch size and flush interval
    pub fn new(pool: Arc<WorkerPool>, config: BatchConfig) -> Arc<Self> {
        let capacity = config.batch_size + pool.config().queue_size;
        let processor = Arc::new(Self {
            pool,
            capacity,
            buffer: Mutex::new(Vec::with_capacity(config.batch_size)),
            config,
            cancel: CancellationToken::new(),
            ticker: Mutex::new(None),
        });

        let ticker = tokio::spawn(flush_periodically(
            Arc::downgrade(&processor),
            processor.config.flush_interval,
            processor.cancel.clone(),
        ));
        *lock(&processor.ticker) = Some(ticker);

        processor
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Buffer a job, flushing if the batch is full
    ///
    /// # Errors
    ///
    /// * `PoolShuttingDown` once `stop` has been called; the job is not buffered
    /// * `QueueFull` if the buffer is at capacity; the job is not buffered
    pub fn add_job(&self, job: TransactionJob) -> Result<(), ProcessingError> {
        if self.cancel.is_cancelled() {
            return Err(ProcessingError::PoolShuttingDown);
        }

        let mut buffer = lock(&self.buffer);
        if buffer.len() >= self.capacity {
            debug!(buffered = buffer.len(), "Batch buffer full");
            return Err(ProcessingError::QueueFull);
        }
        buffer.push(job);

        if buffer.len() >= self.config.batch_size && !self.pool.is_full() {
            if let Err(e) = self.flush_locked(&mut buffer) {
                warn!(
                    buffered = buffer.len(),
                    error = %e,
                    "Batch flush rejected, keeping jobs for the next flush"
                );
            }
        }
        Ok(())
    }

    /// Submit everything buffered as one composite job
    pub fn flush(&self) -> Result<(), ProcessingError> {
        let mut buffer = lock(&self.buffer);
        self.flush_locked(&mut buffer)
    }

    fn flush_locked(&self, buffer: &mut Vec<TransactionJob>) -> Result<(), ProcessingError> {
        if buffer.is_empty() {
            return Ok(());
        }

        let composite = CompositeJob::new(mem::take(buffer));
        let size = composite.len();
        let batch_id = composite.id().to_string();

        match self.pool.try_submit(composite.into()) {
            Ok(()) => {
                debug!(batch_id = %batch_id, size, "Batch flushed");
                Ok(())
            }
            Err((e, rejected)) => {
                if let Job::Composite(composite) = rejected {
                    *buffer = composite.into_jobs();
                }
                Err(e)
            }
        }
    }

    /// Jobs waiting for the next flush
    pub fn pending_len(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Stop the ticker and flush whatever is buffered
    ///
    /// # Errors
    ///
    /// Returns the pool's error if the final flush is rejected. The affected
    /// transactions stay pending.
    pub async fn stop(&self) -> Result<(), ProcessingError> {
        self.cancel.cancel();

        let ticker = lock(&self.ticker).take();
        if let Some(ticker) = ticker {
            if let Err(e) = ticker.await {
                warn!(error = %e, "Batch ticker ended abnormally");
            }
        }

        let result = self.flush();
        if let Err(e) = &result {
            warn!(
                dropped = self.pending_len(),
                error = %e,
                "Final batch flush failed"
            );
            lock(&self.buffer).clear();
        }
        result
    }
}

impl Drop for BatchProcessor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn flush_periodically(
    processor: Weak<BatchProcessor>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(processor) = processor.upgrade() else {
                    break;
                };
                if let Err(e) = processor.flush() {
                    warn!(error = %e, "Periodic batch flush failed");
                }
            }
        }
    }

    debug!("Batch ticker stopped");
}
