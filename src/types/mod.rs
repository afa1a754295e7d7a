//! Types module
//!
//! Contains core data structures used throughout the application.
//! This module organizes types into logical submodules:
//! - `balance`: per-user balance entity and snapshots
//! - `transaction`: transaction entity, state machine and identifiers
//! - `history`: append-only balance history entries
//! - `audit`: audit log entries
//! - `error`: error types for the balance processor

pub mod audit;
pub mod balance;
pub mod error;
pub mod history;
pub mod transaction;

pub use audit::{
    AuditAction, AuditLog, BalanceAuditDetails, EntityId, EntityType, TransactionAuditDetails,
};
pub use balance::{Balance, BalanceSnapshot};
pub use error::ProcessingError;
pub use history::BalanceHistory;
pub use transaction::{
    Transaction, TransactionId, TransactionRequest, TransactionStatus, TransactionType, UserId,
};
