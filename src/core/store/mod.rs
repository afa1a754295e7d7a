//! In-memory collaborator implementations
//!
//! DashMap-backed stores that satisfy the traits in [`crate::core::traits`].
//! They are what the CLI and the tests run against.

pub mod audit_log;
pub mod balance_store;
pub mod cache;
pub mod transaction_store;

pub use audit_log::MemoryAuditLog;
pub use balance_store::MemoryBalanceStore;
pub use cache::MemoryCache;
pub use transaction_store::MemoryTransactionStore;
