//! Fixed-size worker pool with a bounded job queue
//!
//! # Architecture
//!
//! ```text
//!                 submit (try_send)
//!                        │
//!                        ▼
//!              bounded mpsc<Job> (queue_size)
//!                        │  shared receiver
//!        ┌───────────────┼───────────────┐
//!        ▼               ▼               ▼
//!    worker 0        worker 1   ...  worker N-1
//!        │               │               │
//!        └───────► mpsc<JobResult> ◄─────┘
//!                        │
//!                        ▼
//!                   aggregator ──► WorkerMetrics
//! ```
//!
//! # Lifecycle
//!
//! `new` only allocates the queue, so jobs may be submitted before `start`.
//! `stop` drops the only queue sender: submissions fail with
//! `PoolShuttingDown`, workers drain whatever is already queued and exit once
//! the queue reports closed. `stop` then waits for every worker and for the
//! aggregator, so metrics are final when it returns.
//!
//! # Thread Safety
//!
//! `WorkerPool` is meant to be shared behind an `Arc`. All methods take
//! `&self`; metrics are plain atomics.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::core::job::{Job, JobKind};
use crate::types::ProcessingError;

/// Outcome of one executed job, sent from a worker to the aggregator
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub kind: JobKind,
    pub outcome: Result<(), ProcessingError>,
    pub elapsed: Duration,
}

/// Live pool counters
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    total_process_nanos: AtomicU64,
}

impl WorkerMetrics {
    fn record(&self, result: &JobResult) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if result.outcome.is_ok() {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = u64::try_from(result.elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_process_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            total_process_time: Duration::from_nanos(
                self.total_process_nanos.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Point-in-time copy of [`WorkerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub total_process_time: Duration,
}

impl MetricsSnapshot {
    /// Mean execution time of processed jobs
    pub fn average_process_time(&self) -> Duration {
        match u32::try_from(self.processed) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total_process_time / n,
            Err(_) => Duration::from_nanos(
                (self.total_process_time.as_nanos() / u128::from(self.processed)) as u64,
            ),
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} succeeded={} failed={} in_flight={} avg={:?}",
            self.processed,
            self.succeeded,
            self.failed,
            self.in_flight,
            self.average_process_time()
        )
    }
}

#[derive(Default)]
struct PoolTasks {
    workers: Vec<JoinHandle<()>>,
    aggregator: Option<JoinHandle<()>>,
}

/// Bounded queue consumed by a fixed number of workers
pub struct WorkerPool {
    config: PoolConfig,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    metrics: Arc<WorkerMetrics>,
    tasks: Mutex<PoolTasks>,
    started: AtomicBool,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

/// Recover the guard from a poisoned mutex
///
/// The protected values are plain handles that stay consistent even if a
/// holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    /// Create a stopped pool with an empty queue
    ///
    /// # Arguments
    ///
    /// * `config` - worker count and queue capacity
    pub fn new(config: PoolConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_size);

        Self {
            config,
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            metrics: Arc::new(WorkerMetrics::default()),
            tasks: Mutex::new(PoolTasks::default()),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Spawn the workers and the result aggregator
    ///
    /// Must be called from within a tokio runtime. Calling it twice is a no-op.
    ///
    /// # Errors
    ///
    /// * `PoolShuttingDown` if the pool was already stopped
    pub fn start(&self) -> Result<(), ProcessingError> {
        if lock(&self.sender).is_none() {
            return Err(ProcessingError::PoolShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Worker pool already started");
            return Ok(());
        }

        info!(
            worker_count = self.config.worker_count,
            queue_size = self.config.queue_size,
            "Starting worker pool"
        );

        let (result_tx, result_rx) = mpsc::channel(self.config.queue_size);
        let mut tasks = lock(&self.tasks);

        for worker_id in 0..self.config.worker_count {
            tasks.workers.push(tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&self.receiver),
                result_tx.clone(),
                Arc::clone(&self.metrics),
            )));
        }
        // Only worker clones remain, so the aggregator ends once every worker exits
        drop(result_tx);

        tasks.aggregator = Some(tokio::spawn(aggregate_results(
            result_rx,
            Arc::clone(&self.metrics),
        )));
        Ok(())
    }

    /// Enqueue a job without waiting
    ///
    /// # Errors
    ///
    /// * `QueueFull` if the queue is at capacity
    /// * `PoolShuttingDown` once `stop` has begun
    pub fn submit(&self, job: Job) -> Result<(), ProcessingError> {
        self.try_submit(job).map_err(|(e, _)| e)
    }

    /// Like [`WorkerPool::submit`], but hands a rejected job back
    pub fn try_submit(&self, job: Job) -> Result<(), (ProcessingError, Job)> {
        let guard = lock(&self.sender);
        let Some(sender) = guard.as_ref() else {
            return Err((ProcessingError::PoolShuttingDown, job));
        };

        let job_id = job.id().to_string();
        let kind = job.kind();

        match sender.try_send(job) {
            Ok(()) => {
                debug!(job_id = %job_id, job_type = %kind, "Job submitted");
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                debug!(job_id = %job_id, "Job queue full");
                Err((ProcessingError::QueueFull, job))
            }
            Err(TrySendError::Closed(job)) => Err((ProcessingError::PoolShuttingDown, job)),
        }
    }

    /// Close intake, drain queued jobs, and wait for every task to exit
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn stop(&self) {
        let sender = lock(&self.sender).take();
        if sender.is_none() {
            return;
        }
        info!("Stopping worker pool");
        drop(sender);

        let tasks = std::mem::take(&mut *lock(&self.tasks));

        for handle in tasks.workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        if let Some(aggregator) = tasks.aggregator {
            if let Err(e) = aggregator.await {
                error!(error = %e, "Result aggregator ended abnormally");
            }
        }

        info!(metrics = %self.metrics(), "Worker pool stopped");
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Jobs waiting in the queue
    pub fn queue_len(&self) -> usize {
        lock(&self.sender)
            .as_ref()
            .map(|sender| sender.max_capacity() - sender.capacity())
            .unwrap_or(0)
    }

    /// No queue slot is free right now
    pub fn is_full(&self) -> bool {
        self.queue_len() >= self.config.queue_size
    }

    /// Started and not yet stopping
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && lock(&self.sender).is_some()
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    results: mpsc::Sender<JobResult>,
    metrics: Arc<WorkerMetrics>,
) {
    debug!(worker_id, "Worker started");

    loop {
        // Lock released before the job runs
        let next = receiver.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };

        metrics.in_flight.fetch_add(1, Ordering::Relaxed);
        debug!(worker_id, job_id = %job.id(), job_type = %job.kind(), "Processing job");

        let started = Instant::now();
        let outcome = AssertUnwindSafe(job.execute())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ProcessingError::store(format!("job {} panicked", job.id()))));
        let elapsed = started.elapsed();

        metrics.in_flight.fetch_sub(1, Ordering::Relaxed);

        let result = JobResult {
            job_id: job.id().to_string(),
            kind: job.kind(),
            outcome,
            elapsed,
        };
        if results.send(result).await.is_err() {
            warn!(worker_id, job_id = %job.id(), "Could not send job result");
        }
    }

    debug!(worker_id, "Worker stopped - job queue closed");
}

async fn aggregate_results(mut results: mpsc::Receiver<JobResult>, metrics: Arc<WorkerMetrics>) {
    while let Some(result) = results.recv().await {
        match &result.outcome {
            Ok(()) => debug!(
                job_id = %result.job_id,
                job_type = %result.kind,
                elapsed_us = result.elapsed.as_micros() as u64,
                "Job completed successfully"
            ),
            Err(e) => error!(
                job_id = %result.job_id,
                job_type = %result.kind,
                error = %e,
                "Job failed"
            ),
        }
        metrics.record(&result);
    }
}
