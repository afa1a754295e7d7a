//! Explicitly owned lifecycle of the processing stack
//!
//! `ProcessingContext` wires the in-memory stores, the worker pool, the
//! optional batch processor and the transaction service together. Nothing in
//! the crate is global: tests and the CLI each build their own context.
//!
//! # Architecture
//!
//! ```text
//! ProcessingContext
//!     ├── Arc<MemoryBalanceStore>
//!     ├── Arc<MemoryTransactionStore>
//!     ├── Arc<MemoryCache>
//!     ├── Arc<MemoryAuditLog>
//!     ├── Arc<WorkerPool>               (started)
//!     ├── Option<Arc<BatchProcessor>>   (when EngineConfig::batch is set)
//!     └── TransactionService
//! ```

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::core::batch_processor::BatchProcessor;
use crate::core::service::TransactionService;
use crate::core::store::{MemoryAuditLog, MemoryBalanceStore, MemoryCache, MemoryTransactionStore};
use crate::core::worker_pool::{MetricsSnapshot, WorkerPool};
use crate::types::ProcessingError;

#[derive(Debug)]
pub struct ProcessingContext {
    balances: Arc<MemoryBalanceStore>,
    transactions: Arc<MemoryTransactionStore>,
    cache: Arc<MemoryCache>,
    audit: Arc<MemoryAuditLog>,
    pool: Arc<WorkerPool>,
    batcher: Option<Arc<BatchProcessor>>,
    service: TransactionService,
}

impl ProcessingContext {
    /// Build every component and start the pool
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: EngineConfig) -> Result<Self, ProcessingError> {
        Self::with_balances(config, Arc::new(MemoryBalanceStore::new()))
    }

    /// Like [`ProcessingContext::start`], over an existing balance store
    pub fn with_balances(
        config: EngineConfig,
        balances: Arc<MemoryBalanceStore>,
    ) -> Result<Self, ProcessingError> {
        let transactions = Arc::new(MemoryTransactionStore::new());
        let cache = Arc::new(MemoryCache::new());
        let audit = Arc::new(MemoryAuditLog::new());

        let pool = Arc::new(WorkerPool::new(config.pool.clone()));
        pool.start()?;

        let batcher = config
            .batch
            .clone()
            .map(|batch| BatchProcessor::new(Arc::clone(&pool), batch));

        let mut service = TransactionService::new(
            balances.clone(),
            transactions.clone(),
            cache.clone(),
            audit.clone(),
            Arc::clone(&pool),
            config.retry.clone(),
        );
        if let Some(batcher) = &batcher {
            service = service.with_batch_processor(Arc::clone(batcher));
        }

        info!(
            workers = config.pool.worker_count,
            queue_size = config.pool.queue_size,
            batched = batcher.is_some(),
            max_attempts = config.retry.max_attempts,
            "Processing context started"
        );

        Ok(Self {
            balances,
            transactions,
            cache,
            audit,
            pool,
            batcher,
            service,
        })
    }

    pub fn service(&self) -> &TransactionService {
        &self.service
    }

    pub fn balances(&self) -> &Arc<MemoryBalanceStore> {
        &self.balances
    }

    pub fn transactions(&self) -> &Arc<MemoryTransactionStore> {
        &self.transactions
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    pub fn audit(&self) -> &Arc<MemoryAuditLog> {
        &self.audit
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Flush the batch processor, then drain and stop the pool
    ///
    /// # Returns
    ///
    /// Final pool metrics. They no longer change after this returns.
    pub async fn shutdown(&self) -> MetricsSnapshot {
        if let Some(batcher) = &self.batcher {
            if let Err(e) = batcher.stop().await {
                warn!(error = %e, "Batch processor did not flush cleanly");
            }
        }

        self.pool.stop().await;

        let metrics = self.pool.metrics();
        info!(%metrics, "Processing context shut down");
        metrics
    }
}
