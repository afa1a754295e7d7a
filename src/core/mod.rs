//! Core processing module
//!
//! This module contains the transaction processing components:
//! - `traits` - Collaborator traits (balance/transaction stores, cache, audit)
//! - `store` - DashMap-backed implementations of those traits
//! - `job` - Transaction and composite jobs
//! - `worker_pool` - Bounded queue, fixed workers, result aggregation
//! - `batch_processor` - Size/time triggered composite jobs
//! - `service` - Request validation and job submission
//! - `context` - Lifecycle owner wiring everything together

pub mod batch_processor;
pub mod context;
pub mod job;
pub mod service;
pub mod store;
pub mod traits;
pub mod worker_pool;

pub use batch_processor::BatchProcessor;
pub use context::ProcessingContext;
pub use job::{CompositeJob, Job, JobContext, JobKind, TransactionJob};
pub use service::TransactionService;
pub use store::{MemoryAuditLog, MemoryBalanceStore, MemoryCache, MemoryTransactionStore};
pub use traits::{AuditSink, BalanceStore, Cache, TransactionStore};
pub use worker_pool::{JobResult, MetricsSnapshot, WorkerMetrics, WorkerPool};
