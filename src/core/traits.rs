//! Collaborator traits for balances, transactions, caching and auditing
//!
//! The processing core only talks to persistence through these traits. The
//! crate ships DashMap-backed implementations in [`crate::core::store`];
//! a SQL-backed implementation would slot in behind the same seams.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::{
    AuditLog, Balance, BalanceHistory, EntityId, ProcessingError, Transaction, TransactionId,
    TransactionStatus, UserId,
};

/// Durable per-user balances and their history
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Get the balance for a user, creating a zero balance if none exists
    ///
    /// Concurrent first access for the same user must produce a single row.
    async fn get_by_user(&self, user: UserId) -> Result<Balance, ProcessingError>;

    /// Insert an initial balance; fails if the user already has one
    async fn create(&self, balance: &Balance) -> Result<(), ProcessingError>;

    /// Write `balance` if the stored version is exactly `balance.version - 1`
    ///
    /// The row stays locked between the version read and the write. On
    /// mismatch nothing is written and `VersionConflict` is returned.
    async fn update_with_version_check(&self, balance: &Balance) -> Result<(), ProcessingError>;

    /// Write several balances as one atomic unit
    ///
    /// Every row is version-checked like [`update_with_version_check`]; one
    /// stale row aborts the whole batch.
    ///
    /// [`update_with_version_check`]: BalanceStore::update_with_version_check
    async fn batch_update(&self, balances: &[Balance]) -> Result<(), ProcessingError>;

    /// Append a history entry
    async fn create_history(&self, entry: &BalanceHistory) -> Result<(), ProcessingError>;

    /// History for a user, newest first
    async fn get_history(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BalanceHistory>, ProcessingError>;

    /// Amount recorded by the newest history entry at or before `at`
    ///
    /// Zero when the user has no history up to that point.
    async fn balance_at(&self, user: UserId, at: DateTime<Utc>)
        -> Result<Decimal, ProcessingError>;
}

/// Durable transaction records
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn create(&self, transaction: &Transaction) -> Result<(), ProcessingError>;

    async fn get(&self, id: TransactionId) -> Result<Transaction, ProcessingError>;

    /// Reserve a pending transaction for the calling job
    ///
    /// Until [`release`](TransactionStore::release), a transition to any
    /// status other than completed or failed is refused with
    /// `TransactionInProgress`, so nothing can cancel a transaction whose
    /// balances are being written.
    ///
    /// # Errors
    ///
    /// * `NotProcessable` if the transaction is not pending
    /// * `TransactionInProgress` if another job holds it
    async fn claim(&self, id: TransactionId) -> Result<Transaction, ProcessingError>;

    /// Drop the reservation taken by [`claim`](TransactionStore::claim)
    async fn release(&self, id: TransactionId) -> Result<(), ProcessingError>;

    /// Set the status only if it currently equals `from`
    ///
    /// Returns `NotProcessable` with the actual status otherwise, and
    /// `TransactionInProgress` for a cancellation of a claimed transaction.
    async fn transition_status(
        &self,
        id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<(), ProcessingError>;

    /// Oldest pending transactions first
    async fn list_pending(&self, limit: usize) -> Result<Vec<Transaction>, ProcessingError>;

    async fn get_by_reference(&self, reference_id: &str) -> Result<Transaction, ProcessingError>;

    /// Transactions where the user is source or destination, newest first
    async fn list_by_user(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>, ProcessingError>;
}

/// Key-value side cache with expiry
///
/// Never authoritative: callers fall back to the store on any miss or error.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ProcessingError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), ProcessingError>;

    async fn delete(&self, key: &str) -> Result<(), ProcessingError>;
}

/// Append-only audit trail
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditLog) -> Result<(), ProcessingError>;

    /// Entries for one entity, newest first
    async fn list_by_entity(
        &self,
        entity_id: EntityId,
        limit: usize,
    ) -> Result<Vec<AuditLog>, ProcessingError>;

    /// Retention sweep; returns the number of removed entries
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, ProcessingError>;
}
