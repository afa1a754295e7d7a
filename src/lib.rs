//! Balance Processor Library
//! # Overview
//!
//! Concurrent processing of credit, debit and transfer transactions against
//! per-user balances, with optimistic versioning, a bounded worker pool and
//! optional batching.
//!
//! # Architecture
//!
//! The system is organized into several key components:
//!
//! - [`types`] - Core data types (Balance, Transaction, history and audit entries)
//! - [`config`] - Pool, batch and retry configuration
//! - [`core`] - Business logic components:
//!   - [`core::traits`] - Store, cache and audit seams
//!   - [`core::store`] - In-memory implementations of those seams
//!   - [`core::job`] - Transaction and composite jobs
//!   - [`core::worker_pool`] - Bounded queue, workers and metrics
//!   - [`core::batch_processor`] - Size and time triggered batching
//!   - [`core::service`] - Validation, persistence and submission
//!   - [`core::context`] - Lifecycle owner for one processing stack
//! - [`io`] - CSV input and balance output
//! - [`pipeline`] - File to balances run used by the binary
//! - [`cli`] / [`logging`] - Binary plumbing
//!
//! # Transaction Lifecycle
//!
//! ```text
//! create ──► Pending ──► Completed
//!               │
//!               ├──────► Failed
//!               └──────► Cancelled
//! ```
//!
//! Only `Pending` transactions are ever applied. A job that loses a version
//! race against another job retries under its [`config::RetryPolicy`].

pub mod cli;
pub mod config;
pub mod core;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod types;

pub use config::{BatchConfig, EngineConfig, PoolConfig, RetryPolicy};
pub use crate::core::{ProcessingContext, TransactionService, WorkerPool};
pub use io::write_balances_csv;
pub use pipeline::{PipelineConfig, RunSummary};
pub use types::{
    Balance, ProcessingError, Transaction, TransactionId, TransactionRequest, TransactionStatus,
    TransactionType, UserId,
};
