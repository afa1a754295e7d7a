//! CSV-in, CSV-out processing run
//!
//! Reads operation requests from a file, drives them through a fresh
//! [`ProcessingContext`] and writes the final balances.
//!
//! # Ordering
//!
//! The file is consumed in chunks of `chunk_size` records. Every transaction
//! of a chunk is created and enqueued before the pipeline waits for all of
//! them to settle, so records of one chunk run concurrently and only the
//! chunk boundary orders them. A chunk size of 1 gives strict file order.
//!
//! # Errors
//!
//! Rejected records (bad amount, insufficient funds, ...) are logged and
//! counted, never fatal. Failing to open the input, to start the engine or
//! to write the output aborts the run with a `String` error.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use futures::io::AsyncRead;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::core::{MetricsSnapshot, ProcessingContext, WorkerPool};
use crate::io::{write_balances_csv, AsyncReader};
use crate::types::TransactionStatus;

/// Settings for one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub engine: EngineConfig,

    /// Records read and submitted before waiting for them to settle
    pub chunk_size: usize,

    /// How often pending transactions and queue room are polled
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            chunk_size: 1000,
            poll_interval: Duration::from_millis(5),
        }
    }
}

impl PipelineConfig {
    /// Create a new PipelineConfig; a zero chunk size falls back to the default
    pub fn new(engine: EngineConfig, chunk_size: usize) -> Self {
        let default = Self::default();

        let chunk_size = if chunk_size == 0 {
            warn!(
                requested = chunk_size,
                default = default.chunk_size,
                "Invalid chunk_size, using default"
            );
            default.chunk_size
        } else {
            chunk_size
        };

        Self {
            engine,
            chunk_size,
            ..default
        }
    }
}

/// Counters describing a finished run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// Records that parsed into an operation
    pub read: usize,

    /// Records the service refused to create
    pub rejected: usize,

    pub completed: usize,
    pub failed: usize,
    pub metrics: MetricsSnapshot,
}

/// Process every record in `input_path` and write balances to `output`
///
/// # Arguments
///
/// * `input_path` - CSV with columns `type,from,to,amount,reference,description`
/// * `config` - engine and chunking settings
/// * `output` - receives `user,amount,version` rows sorted by user
///
/// # Returns
///
/// * `Ok(RunSummary)` once every accepted transaction has settled
/// * `Err(String)` if a fatal error occurred
pub async fn run(
    input_path: &Path,
    config: &PipelineConfig,
    output: &mut dyn Write,
) -> Result<RunSummary, String> {
    let file = tokio::fs::File::open(input_path)
        .await
        .map_err(|e| format!("Failed to open file '{}': {}", input_path.display(), e))?;
    let reader = AsyncReader::new(file.compat());

    let ctx = ProcessingContext::start(config.engine.clone())
        .map_err(|e| format!("Failed to start processing engine: {}", e))?;

    let driven = drive(&ctx, reader, config).await;
    let metrics = ctx.shutdown().await;
    let (read, rejected) = driven?;

    let balances = ctx
        .balances()
        .all_balances()
        .map_err(|e| format!("Failed to collect balances: {}", e))?;
    write_balances_csv(&balances, output)?;

    let summary = RunSummary {
        read,
        rejected,
        completed: ctx
            .transactions()
            .count_by_status(TransactionStatus::Completed),
        failed: ctx.transactions().count_by_status(TransactionStatus::Failed),
        metrics,
    };

    info!(
        read = summary.read,
        rejected = summary.rejected,
        completed = summary.completed,
        failed = summary.failed,
        users = balances.len(),
        "Pipeline finished"
    );
    Ok(summary)
}

/// Feed every chunk through the service and wait for it to settle
///
/// Returns `(read, rejected)`.
async fn drive<R>(
    ctx: &ProcessingContext,
    mut reader: AsyncReader<R>,
    config: &PipelineConfig,
) -> Result<(usize, usize), String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut read = 0;
    let mut rejected = 0;

    loop {
        let chunk = reader.read_chunk(config.chunk_size).await;
        if chunk.is_empty() {
            break;
        }
        read += chunk.len();

        let mut ids = Vec::with_capacity(chunk.len());
        for operation in chunk {
            wait_for_queue_room(ctx.pool(), config.poll_interval).await;

            match ctx
                .service()
                .create(operation.tx_type, operation.request, None)
                .await
            {
                Ok(transaction) => ids.push(transaction.id),
                Err(e) => {
                    rejected += 1;
                    warn!(tx_type = %operation.tx_type, error = %e, "Operation rejected");
                }
            }
        }

        ctx.service()
            .await_settled(&ids, config.poll_interval)
            .await
            .map_err(|e| format!("Failed waiting for transactions to settle: {}", e))?;
    }

    Ok((read, rejected))
}

/// Block until the pool's queue has a free slot
///
/// The pipeline is the only producer, so a free slot observed here is still
/// free when the job is submitted.
async fn wait_for_queue_room(pool: &WorkerPool, poll: Duration) {
    while pool.is_running() && pool.queue_len() >= pool.config().queue_size {
        tokio::time::sleep(poll).await;
    }
}
