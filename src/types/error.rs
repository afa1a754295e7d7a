//! Error types for the balance processor
//!
//! This module defines all error types that can occur while validating,
//! queueing and executing balance transactions.
//!
//! # Error Categories
//!
//! - **Validation Errors**: invalid amounts, malformed transactions, insufficient funds
//! - **Concurrency Errors**: version conflicts detected at the store write
//! - **Lifecycle Errors**: transactions that are no longer pending
//! - **Pool Errors**: queue full, pool shutting down
//! - **Collaborator Errors**: store, cache and I/O failures

use rust_decimal::Decimal;
use thiserror::Error;

use super::transaction::{TransactionId, TransactionStatus, UserId};

/// Main error type for the balance processor
///
/// Every fallible operation in the library returns this type. Variants carry
/// enough context to be logged without further lookups.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessingError {
    /// Amount is zero or negative
    #[error("Invalid amount {amount}: amount must be greater than zero")]
    InvalidAmount {
        /// The rejected amount
        amount: Decimal,
    },

    /// Debit or transfer exceeds the available balance
    #[error("Insufficient funds for user {user}: available {available}, requested {requested}")]
    InsufficientFunds {
        /// User whose balance was checked
        user: UserId,
        /// Balance at the time of the check
        available: Decimal,
        /// Requested amount
        requested: Decimal,
    },

    /// Lost update detected at the store write
    ///
    /// The stored row no longer has the version the writer started from.
    /// This is the only retryable error.
    #[error("Version conflict for user {user}: expected stored version {expected}, found {found}")]
    VersionConflict {
        /// User whose row was written
        user: UserId,
        /// Version the writer expected to replace
        expected: i64,
        /// Version actually stored
        found: i64,
    },

    /// Transaction is not in the pending state
    #[error("Transaction {tx} cannot be processed, status: {status}")]
    NotProcessable {
        /// Transaction ID
        tx: TransactionId,
        /// Current status
        status: TransactionStatus,
    },

    /// A job currently holds the transaction
    ///
    /// Its status can no longer be changed from outside that job.
    #[error("Transaction {tx} is being processed")]
    TransactionInProgress {
        /// Transaction ID
        tx: TransactionId,
    },

    /// The worker pool queue has no free capacity
    #[error("Job queue is full")]
    QueueFull,

    /// The worker pool no longer accepts jobs
    #[error("Worker pool is shutting down")]
    PoolShuttingDown,

    /// Underlying persistence failure
    #[error("Store error: {message}")]
    StoreError {
        /// Description of the failure
        message: String,
    },

    /// Transaction does not exist
    #[error("Transaction {tx} not found")]
    TransactionNotFound {
        /// Transaction ID that was not found
        tx: TransactionId,
    },

    /// Transaction violates a structural rule (parties by type)
    #[error("Invalid transaction: {reason}")]
    InvalidTransaction {
        /// Which rule was violated
        reason: String,
    },

    /// One or more jobs of a composite job failed
    #[error("Batch {batch} failed with {} of {total} jobs failing", failures.len())]
    BatchFailed {
        /// Composite job ID
        batch: String,
        /// Number of jobs in the batch
        total: usize,
        /// Failing job IDs and their errors
        failures: Vec<(String, ProcessingError)>,
    },

    /// Cache read/write failure
    #[error("Cache error: {message}")]
    CacheError {
        /// Description of the failure
        message: String,
    },

    /// I/O error occurred while reading or writing files
    #[error("I/O error: {message}")]
    IoError {
        /// Description of the I/O error
        message: String,
    },

    /// Malformed input record
    #[error("Parse error{}: {message}", line.map(|l| format!(" at line {}", l)).unwrap_or_default())]
    ParseError {
        /// Line number where the error occurred (if available)
        line: Option<u64>,
        /// Description of the parsing error
        message: String,
    },
}

impl From<std::io::Error> for ProcessingError {
    fn from(error: std::io::Error) -> Self {
        ProcessingError::IoError {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(error: serde_json::Error) -> Self {
        ProcessingError::CacheError {
            message: error.to_string(),
        }
    }
}

// Helper functions for creating common errors

impl ProcessingError {
    /// Create an InvalidAmount error
    pub fn invalid_amount(amount: Decimal) -> Self {
        ProcessingError::InvalidAmount { amount }
    }

    /// Create an InsufficientFunds error
    pub fn insufficient_funds(user: UserId, available: Decimal, requested: Decimal) -> Self {
        ProcessingError::InsufficientFunds {
            user,
            available,
            requested,
        }
    }

    /// Create a VersionConflict error
    pub fn version_conflict(user: UserId, expected: i64, found: i64) -> Self {
        ProcessingError::VersionConflict {
            user,
            expected,
            found,
        }
    }

    /// Create a NotProcessable error
    pub fn not_processable(tx: TransactionId, status: TransactionStatus) -> Self {
        ProcessingError::NotProcessable { tx, status }
    }

    /// Create a TransactionInProgress error
    pub fn in_progress(tx: TransactionId) -> Self {
        ProcessingError::TransactionInProgress { tx }
    }

    /// Create a StoreError
    pub fn store(message: impl Into<String>) -> Self {
        ProcessingError::StoreError {
            message: message.into(),
        }
    }

    /// Create a TransactionNotFound error
    pub fn transaction_not_found(tx: TransactionId) -> Self {
        ProcessingError::TransactionNotFound { tx }
    }

    /// Create an InvalidTransaction error
    pub fn invalid_transaction(reason: impl Into<String>) -> Self {
        ProcessingError::InvalidTransaction {
            reason: reason.into(),
        }
    }

    /// Whether re-running the whole job may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessingError::VersionConflict { .. })
    }
}
