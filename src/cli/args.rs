use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{BatchConfig, EngineConfig, PoolConfig, RetryPolicy};
use crate::pipeline::PipelineConfig;

/// Apply credit, debit and transfer operations to user balances
#[derive(Parser, Debug)]
#[command(name = "balance-processor")]
#[command(about = "Apply credit, debit and transfer operations to user balances", long_about = None)]
pub struct CliArgs {
    /// Input CSV file path containing operation records
    #[arg(value_name = "INPUT", help = "Path to the input CSV file")]
    pub input_file: PathBuf,

    #[arg(
        long = "workers",
        value_name = "COUNT",
        help = "Number of concurrent workers (default: CPU cores)"
    )]
    pub workers: Option<usize>,

    #[arg(
        long = "queue-size",
        value_name = "SIZE",
        help = "Capacity of the job queue (default: 1000)"
    )]
    pub queue_size: Option<usize>,

    /// Enables batching; without it every transaction is its own job
    #[arg(
        long = "batch-size",
        value_name = "SIZE",
        help = "Group jobs into composite batches of this size"
    )]
    pub batch_size: Option<usize>,

    #[arg(
        long = "flush-interval-ms",
        value_name = "MS",
        requires = "batch_size",
        help = "Maximum time a job waits for its batch (default: 100)"
    )]
    pub flush_interval_ms: Option<u64>,

    #[arg(
        long = "max-attempts",
        value_name = "COUNT",
        help = "Attempts per job when balances change concurrently (default: 3)"
    )]
    pub max_attempts: Option<u32>,

    #[arg(
        long = "retry-delay-ms",
        value_name = "MS",
        help = "Base delay between attempts, grows linearly (default: 10)"
    )]
    pub retry_delay_ms: Option<u64>,

    #[arg(
        long = "chunk-size",
        value_name = "SIZE",
        default_value_t = 1000,
        help = "Records submitted before waiting for them to settle"
    )]
    pub chunk_size: usize,

    #[arg(
        long = "log-level",
        value_name = "LEVEL",
        default_value = "info",
        help = "Log filter, overridden by RUST_LOG"
    )]
    pub log_level: String,

    #[arg(long = "log-json", help = "Emit logs as JSON lines on stderr")]
    pub log_json: bool,
}

impl CliArgs {
    /// Build the engine configuration from CLI arguments
    ///
    /// Missing values use the defaults. Zero values are replaced by the
    /// config constructors, which log a warning.
    pub fn to_engine_config(&self) -> EngineConfig {
        let pool_default = PoolConfig::default();
        let pool = PoolConfig::new(
            self.workers.unwrap_or(pool_default.worker_count),
            self.queue_size.unwrap_or(pool_default.queue_size),
        );

        let batch = self.batch_size.map(|batch_size| {
            let flush_interval = self
                .flush_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(BatchConfig::default().flush_interval);
            BatchConfig::new(batch_size, flush_interval)
        });

        let retry_default = RetryPolicy::default();
        let retry = RetryPolicy::new(
            self.max_attempts.unwrap_or(retry_default.max_attempts),
            self.retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(retry_default.base_delay),
        );

        EngineConfig { pool, batch, retry }
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::new(self.to_engine_config(), self.chunk_size)
    }
}
