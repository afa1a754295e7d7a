//! Units of work executed by the worker pool
//!
//! Two kinds of job exist and the set is closed:
//!
//! - [`TransactionJob`]: settles one pending transaction
//! - [`CompositeJob`]: runs a group of transaction jobs concurrently and
//!   reports their failures as one error
//!
//! [`Job`] is the enum the pool queues. It exposes `id`, `kind` and `execute`.
//!
//! # Transaction Job Flow
//!
//! ```text
//! claim pending transaction ──► validate ◄──────────────┐
//!                                  │                    │
//!                     credit / debit / transfer         │
//!                                  │                    │
//!                             store write ── VersionConflict, retry
//!                                  │ ok
//!          history (best-effort) ──► mark completed
//!                                  │
//!            audit (best-effort) ──► info log ──► release claim
//! ```
//!
//! While the claim is held the store refuses cancellation, so a transaction
//! never ends up cancelled with its balances already moved.
//!
//! A job that fails for a non-retryable reason, or runs out of attempts,
//! marks its transaction failed before returning the error.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::core::traits::{AuditSink, BalanceStore, TransactionStore};
use crate::types::{
    AuditAction, AuditLog, Balance, BalanceAuditDetails, BalanceHistory, EntityId, EntityType,
    ProcessingError, Transaction, TransactionId, TransactionStatus, TransactionType, UserId,
};

/// Category of a job, reported with its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Transaction,
    Batch,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Transaction => "transaction",
            JobKind::Batch => "batch",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborators a transaction job needs
///
/// Cheap to clone: every field is an `Arc` or a small value.
#[derive(Clone)]
pub struct JobContext {
    pub balances: Arc<dyn BalanceStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub audit: Arc<dyn AuditSink>,
    pub retry: RetryPolicy,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Balance mutation computed by one attempt, persisted but not yet finalized
#[derive(Debug, Clone)]
struct BalanceChange {
    user: UserId,
    previous: Decimal,
    current: Decimal,
    operation: &'static str,
}

impl BalanceChange {
    fn new(previous: Decimal, balance: &Balance, operation: &'static str) -> Self {
        Self {
            user: balance.user_id,
            previous,
            current: balance.amount,
            operation,
        }
    }
}

/// Job bound to a single transaction ID
///
/// The job never carries the transaction itself; it claims it from the store
/// when it runs, so a cancellation or a completed duplicate is always observed.
#[derive(Clone)]
pub struct TransactionJob {
    id: String,
    transaction_id: TransactionId,
    ctx: JobContext,
}

impl fmt::Debug for TransactionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionJob")
            .field("id", &self.id)
            .field("transaction_id", &self.transaction_id)
            .finish_non_exhaustive()
    }
}

impl TransactionJob {
    /// Create a job for `transaction_id`
    ///
    /// The job ID is `transaction-<transaction id>`.
    pub fn new(transaction_id: TransactionId, ctx: JobContext) -> Self {
        Self {
            id: format!("transaction-{}", transaction_id),
            transaction_id,
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Settle the transaction
    ///
    /// The transaction is claimed in the store before any balance is read, so
    /// a cancellation arriving while the job runs is refused instead of
    /// overtaking a mutation that is already written.
    ///
    /// # Returns
    ///
    /// * `Ok(())` once balances are written and the transaction is completed
    /// * `Err(NotProcessable)` if the transaction is no longer pending; nothing
    ///   is mutated and the status is left alone
    /// * `Err(TransactionInProgress)` if another job holds the transaction
    /// * `Err(TransactionNotFound)` if the transaction does not exist
    /// * Any other error after the transaction was marked failed, except a
    ///   failure to write the completed status, which is returned as is
    pub async fn execute(&self) -> Result<(), ProcessingError> {
        let transaction = self.ctx.transactions.claim(self.transaction_id).await?;
        debug!(
            job_id = %self.id,
            transaction_id = %self.transaction_id,
            users = ?transaction.affected_users(),
            "Processing transaction"
        );

        let result = self.settle(transaction).await;

        if let Err(e) = self.ctx.transactions.release(self.transaction_id).await {
            warn!(
                transaction_id = %self.transaction_id,
                error = %e,
                "Failed to release transaction claim"
            );
        }
        result
    }

    async fn settle(&self, transaction: Transaction) -> Result<(), ProcessingError> {
        let mut attempt = 1;
        loop {
            match self.apply(&transaction).await {
                Ok(changes) => return self.finalize(&transaction, &changes).await,
                Err(e) if e.is_retryable() && attempt < self.ctx.retry.max_attempts => {
                    warn!(
                        job_id = %self.id,
                        transaction_id = %transaction.id,
                        attempt,
                        error = %e,
                        "Balance changed underneath job, retrying"
                    );
                    tokio::time::sleep(self.ctx.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.mark_failed(&transaction, &e).await;
                    return Err(e);
                }
            }
        }
    }

    /// Compute and persist the balance mutation for one attempt
    async fn apply(&self, tx: &Transaction) -> Result<Vec<BalanceChange>, ProcessingError> {
        tx.validate()?;

        match tx.tx_type {
            TransactionType::Credit => {
                let user = required(tx.to_user, "credit transaction has no destination user")?;
                let mut balance = self.ctx.balances.get_by_user(user).await?;
                let previous = balance.amount;

                balance.credit(tx.amount)?;
                self.ctx.balances.update_with_version_check(&balance).await?;

                Ok(vec![BalanceChange::new(previous, &balance, "credit")])
            }
            TransactionType::Debit => {
                let user = required(tx.from_user, "debit transaction has no source user")?;
                let mut balance = self.ctx.balances.get_by_user(user).await?;
                let previous = balance.amount;

                ensure_sufficient(&balance, tx.amount)?;
                balance.debit(tx.amount)?;
                self.ctx.balances.update_with_version_check(&balance).await?;

                Ok(vec![BalanceChange::new(previous, &balance, "debit")])
            }
            TransactionType::Transfer => {
                let from_user = required(tx.from_user, "transfer has no source user")?;
                let to_user = required(tx.to_user, "transfer has no destination user")?;

                let mut from = self.ctx.balances.get_by_user(from_user).await?;
                let mut to = self.ctx.balances.get_by_user(to_user).await?;
                let (from_previous, to_previous) = (from.amount, to.amount);

                ensure_sufficient(&from, tx.amount)?;
                from.debit(tx.amount)?;
                to.credit(tx.amount)?;
                self.ctx
                    .balances
                    .batch_update(&[from.clone(), to.clone()])
                    .await?;

                Ok(vec![
                    BalanceChange::new(from_previous, &from, "transfer_out"),
                    BalanceChange::new(to_previous, &to, "transfer_in"),
                ])
            }
        }
    }

    async fn finalize(
        &self,
        tx: &Transaction,
        changes: &[BalanceChange],
    ) -> Result<(), ProcessingError> {
        for change in changes {
            let entry = BalanceHistory::new(change.user, tx.id, change.current, change.previous);
            if let Err(e) = self.ctx.balances.create_history(&entry).await {
                warn!(
                    transaction_id = %tx.id,
                    user_id = change.user,
                    error = %e,
                    "Failed to create balance history"
                );
            }
        }

        // Balances are already written; an error here leaves a completed
        // mutation behind a pending transaction
        if let Err(e) = self
            .ctx
            .transactions
            .transition_status(tx.id, TransactionStatus::Pending, TransactionStatus::Completed)
            .await
        {
            error!(
                transaction_id = %tx.id,
                error = %e,
                "Failed to update transaction status"
            );
            return Err(e);
        }

        let action = audit_action(tx.tx_type);
        for change in changes {
            self.record_audit(tx, change, action).await;
        }

        info!(
            job_id = %self.id,
            transaction_id = %tx.id,
            tx_type = %tx.tx_type,
            amount = %tx.amount,
            "Transaction completed"
        );
        Ok(())
    }

    async fn record_audit(&self, tx: &Transaction, change: &BalanceChange, action: AuditAction) {
        let details = BalanceAuditDetails {
            user_id: change.user,
            amount: change.current,
            previous_amount: change.previous,
            transaction_id: Some(tx.id),
            operation: change.operation.to_string(),
        };

        let recorded = match AuditLog::new(
            EntityType::Balance,
            action,
            EntityId::User(change.user),
            &details,
            None,
        ) {
            Ok(entry) => self.ctx.audit.record(entry).await,
            Err(e) => Err(e),
        };

        if let Err(e) = recorded {
            warn!(transaction_id = %tx.id, error = %e, "Failed to create audit log");
        }
    }

    async fn mark_failed(&self, tx: &Transaction, cause: &ProcessingError) {
        error!(
            job_id = %self.id,
            transaction_id = %tx.id,
            error = %cause,
            "Transaction failed"
        );

        if let Err(e) = self
            .ctx
            .transactions
            .transition_status(tx.id, TransactionStatus::Pending, TransactionStatus::Failed)
            .await
        {
            warn!(
                transaction_id = %tx.id,
                error = %e,
                "Failed to mark transaction as failed"
            );
        }
    }
}

fn required(user: Option<UserId>, reason: &str) -> Result<UserId, ProcessingError> {
    user.ok_or_else(|| ProcessingError::invalid_transaction(reason))
}

fn ensure_sufficient(balance: &Balance, amount: Decimal) -> Result<(), ProcessingError> {
    if !balance.has_sufficient_balance(amount) {
        return Err(ProcessingError::insufficient_funds(
            balance.user_id,
            balance.amount,
            amount,
        ));
    }
    Ok(())
}

fn audit_action(tx_type: TransactionType) -> AuditAction {
    match tx_type {
        TransactionType::Credit => AuditAction::Credit,
        TransactionType::Debit => AuditAction::Debit,
        TransactionType::Transfer => AuditAction::Transfer,
    }
}

/// A group of transaction jobs executed as one unit of work
///
/// Sub-jobs run concurrently. Successful sub-jobs are never rolled back when
/// a sibling fails.
#[derive(Debug, Clone)]
pub struct CompositeJob {
    id: String,
    jobs: Vec<TransactionJob>,
}

impl CompositeJob {
    /// Create a composite job with a fresh `batch-<uuid>` ID
    pub fn new(jobs: Vec<TransactionJob>) -> Self {
        Self {
            id: format!("batch-{}", Uuid::new_v4()),
            jobs,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn into_jobs(self) -> Vec<TransactionJob> {
        self.jobs
    }

    /// Run every sub-job and collect failures into `BatchFailed`
    pub async fn execute(&self) -> Result<(), ProcessingError> {
        let outcomes = join_all(self.jobs.iter().map(|job| job.execute())).await;

        let failures: Vec<(String, ProcessingError)> = self
            .jobs
            .iter()
            .zip(outcomes)
            .filter_map(|(job, outcome)| outcome.err().map(|e| (job.id().to_string(), e)))
            .collect();

        if failures.is_empty() {
            debug!(batch_id = %self.id, jobs = self.jobs.len(), "Batch completed");
            return Ok(());
        }

        warn!(
            batch_id = %self.id,
            total = self.jobs.len(),
            failed = failures.len(),
            "Batch completed with failures"
        );
        Err(ProcessingError::BatchFailed {
            batch: self.id.clone(),
            total: self.jobs.len(),
            failures,
        })
    }
}

/// Anything the worker pool can run
#[derive(Debug, Clone)]
pub enum Job {
    Transaction(TransactionJob),
    Composite(CompositeJob),
}

impl Job {
    pub fn id(&self) -> &str {
        match self {
            Job::Transaction(job) => job.id(),
            Job::Composite(job) => job.id(),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::Transaction(_) => JobKind::Transaction,
            Job::Composite(_) => JobKind::Batch,
        }
    }

    pub async fn execute(&self) -> Result<(), ProcessingError> {
        match self {
            Job::Transaction(job) => job.execute().await,
            Job::Composite(job) => job.execute().await,
        }
    }
}

impl From<TransactionJob> for Job {
    fn from(job: TransactionJob) -> Self {
        Job::Transaction(job)
    }
}

impl From<CompositeJob> for Job {
    fn from(job: CompositeJob) -> Self {
        Job::Composite(job)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rstest::rstest;

    use crate::core::store::{MemoryAuditLog, MemoryBalanceStore, MemoryTransactionStore};

    pub(crate) struct Fixture {
        pub balances: Arc<MemoryBalanceStore>,
        pub transactions: Arc<MemoryTransactionStore>,
        pub audit: Arc<MemoryAuditLog>,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            Self {
                balances: Arc::new(MemoryBalanceStore::new()),
                transactions: Arc::new(MemoryTransactionStore::new()),
                audit: Arc::new(MemoryAuditLog::new()),
            }
        }

        pub(crate) fn ctx(&self) -> JobContext {
            JobContext {
                balances: self.balances.clone(),
                transactions: self.transactions.clone(),
                audit: self.audit.clone(),
                retry: RetryPolicy::new(3, Duration::from_millis(1)),
            }
        }

        pub(crate) fn fund(&self, user: UserId, amount: i64) {
            let mut balance = Balance::new(user);
            balance.amount = Decimal::new(amount, 0);
            self.balances.seed(balance);
        }

        pub(crate) async fn insert(&self, tx: &Transaction) {
            self.transactions.create(tx).await.unwrap();
        }

        pub(crate) async fn amount(&self, user: UserId) -> Decimal {
            self.balances.get_by_user(user).await.unwrap().amount
        }

        pub(crate) async fn status(&self, id: TransactionId) -> TransactionStatus {
            self.transactions.get(id).await.unwrap().status
        }
    }

    fn dec(value: i64) -> Decimal {
        Decimal::new(value, 0)
    }

    fn credit(to: UserId, amount: i64) -> Transaction {
        Transaction::new(None, Some(to), dec(amount), TransactionType::Credit, "", None).unwrap()
    }

    fn debit(from: UserId, amount: i64) -> Transaction {
        Transaction::new(Some(from), None, dec(amount), TransactionType::Debit, "", None).unwrap()
    }

    fn transfer(from: UserId, to: UserId, amount: i64) -> Transaction {
        Transaction::new(
            Some(from),
            Some(to),
            dec(amount),
            TransactionType::Transfer,
            "",
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_credit_completes_and_records_history() {
        let fx = Fixture::new();
        let tx = credit(1, 100);
        fx.insert(&tx).await;

        TransactionJob::new(tx.id, fx.ctx()).execute().await.unwrap();

        assert_eq!(fx.amount(1).await, dec(100));
        assert_eq!(fx.status(tx.id).await, TransactionStatus::Completed);

        let history = fx.balances.get_history(1, 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].previous_amount, Decimal::ZERO);
        assert_eq!(history[0].amount, dec(100));
        assert_eq!(history[0].transaction_id, tx.id);

        let audit = fx.audit.entries().unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Credit);
    }

    #[tokio::test]
    async fn test_debit_completes() {
        let fx = Fixture::new();
        fx.fund(1, 100);
        let tx = debit(1, 25);
        fx.insert(&tx).await;

        TransactionJob::new(tx.id, fx.ctx()).execute().await.unwrap();

        assert_eq!(fx.amount(1).await, dec(75));
        assert_eq!(fx.status(tx.id).await, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_debit_insufficient_marks_failed_without_mutation() {
        let fx = Fixture::new();
        fx.fund(1, 40);
        let tx = debit(1, 60);
        fx.insert(&tx).await;

        let result = TransactionJob::new(tx.id, fx.ctx()).execute().await;

        assert_eq!(
            result,
            Err(ProcessingError::insufficient_funds(1, dec(40), dec(60)))
        );
        assert_eq!(fx.amount(1).await, dec(40));
        assert_eq!(fx.status(tx.id).await, TransactionStatus::Failed);
        assert_eq!(fx.balances.history_len(), 0);
    }

    #[tokio::test]
    async fn test_transfer_moves_funds_and_records_both_sides() {
        let fx = Fixture::new();
        fx.fund(1, 100);
        fx.fund(2, 10);
        let tx = transfer(1, 2, 25);
        fx.insert(&tx).await;

        TransactionJob::new(tx.id, fx.ctx()).execute().await.unwrap();

        assert_eq!(fx.amount(1).await, dec(75));
        assert_eq!(fx.amount(2).await, dec(35));
        assert_eq!(fx.status(tx.id).await, TransactionStatus::Completed);
        assert_eq!(fx.balances.history_len(), 2);

        let operations: Vec<String> = fx
            .audit
            .entries()
            .unwrap()
            .iter()
            .map(|entry| entry.details_as::<BalanceAuditDetails>().unwrap().operation)
            .collect();
        assert_eq!(operations, vec!["transfer_out", "transfer_in"]);
    }

    #[tokio::test]
    async fn test_transfer_insufficient_leaves_both_balances() {
        let fx = Fixture::new();
        fx.fund(1, 10);
        fx.fund(2, 10);
        let tx = transfer(1, 2, 25);
        fx.insert(&tx).await;

        let result = TransactionJob::new(tx.id, fx.ctx()).execute().await;

        assert!(matches!(
            result,
            Err(ProcessingError::InsufficientFunds { user: 1, .. })
        ));
        assert_eq!(fx.amount(1).await, dec(10));
        assert_eq!(fx.amount(2).await, dec(10));
        assert_eq!(fx.status(tx.id).await, TransactionStatus::Failed);
    }

    #[rstest]
    #[case::completed(TransactionStatus::Completed)]
    #[case::failed(TransactionStatus::Failed)]
    #[case::cancelled(TransactionStatus::Cancelled)]
    #[tokio::test]
    async fn test_non_pending_transaction_is_not_processed(#[case] status: TransactionStatus) {
        let fx = Fixture::new();
        let mut tx = credit(1, 100);
        tx.status = status;
        fx.insert(&tx).await;

        let result = TransactionJob::new(tx.id, fx.ctx()).execute().await;

        assert_eq!(result, Err(ProcessingError::not_processable(tx.id, status)));
        assert_eq!(fx.amount(1).await, Decimal::ZERO);
        assert_eq!(fx.status(tx.id).await, status);
        assert_eq!(fx.balances.history_len(), 0);
    }

    #[tokio::test]
    async fn test_negative_amount_fails_in_job() {
        let fx = Fixture::new();
        let mut tx = credit(1, 100);
        tx.amount = dec(-5);
        fx.insert(&tx).await;

        let result = TransactionJob::new(tx.id, fx.ctx()).execute().await;

        assert_eq!(result, Err(ProcessingError::invalid_amount(dec(-5))));
        assert_eq!(fx.status(tx.id).await, TransactionStatus::Failed);
        assert_eq!(fx.amount(1).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_missing_party_marks_failed() {
        let fx = Fixture::new();
        let mut tx = credit(1, 100);
        tx.to_user = None;
        fx.insert(&tx).await;

        let result = TransactionJob::new(tx.id, fx.ctx()).execute().await;

        assert!(matches!(
            result,
            Err(ProcessingError::InvalidTransaction { .. })
        ));
        assert_eq!(fx.status(tx.id).await, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_transaction_is_not_found() {
        let fx = Fixture::new();
        let id = Uuid::new_v4();

        let result = TransactionJob::new(id, fx.ctx()).execute().await;

        assert_eq!(result, Err(ProcessingError::transaction_not_found(id)));
    }

    /// Balance store that fails history writes and injects version conflicts
    struct FlakyBalanceStore {
        inner: MemoryBalanceStore,
        conflicts_left: AtomicU32,
        fail_history: bool,
    }

    impl FlakyBalanceStore {
        fn new(conflicts: u32, fail_history: bool) -> Self {
            Self {
                inner: MemoryBalanceStore::new(),
                conflicts_left: AtomicU32::new(conflicts),
                fail_history,
            }
        }

        fn take_conflict(&self) -> bool {
            self.conflicts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl BalanceStore for FlakyBalanceStore {
        async fn get_by_user(&self, user: UserId) -> Result<Balance, ProcessingError> {
            self.inner.get_by_user(user).await
        }

        async fn create(&self, balance: &Balance) -> Result<(), ProcessingError> {
            self.inner.create(balance).await
        }

        async fn update_with_version_check(
            &self,
            balance: &Balance,
        ) -> Result<(), ProcessingError> {
            if self.take_conflict() {
                return Err(ProcessingError::version_conflict(
                    balance.user_id,
                    balance.version - 1,
                    balance.version,
                ));
            }
            self.inner.update_with_version_check(balance).await
        }

        async fn batch_update(&self, balances: &[Balance]) -> Result<(), ProcessingError> {
            self.inner.batch_update(balances).await
        }

        async fn create_history(&self, entry: &BalanceHistory) -> Result<(), ProcessingError> {
            if self.fail_history {
                return Err(ProcessingError::store("history table unavailable"));
            }
            self.inner.create_history(entry).await
        }

        async fn get_history(
            &self,
            user: UserId,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<BalanceHistory>, ProcessingError> {
            self.inner.get_history(user, limit, offset).await
        }

        async fn balance_at(
            &self,
            user: UserId,
            at: DateTime<Utc>,
        ) -> Result<Decimal, ProcessingError> {
            self.inner.balance_at(user, at).await
        }
    }

    fn ctx_with_balances(fx: &Fixture, balances: Arc<dyn BalanceStore>, retry: RetryPolicy) -> JobContext {
        JobContext {
            balances,
            retry,
            ..fx.ctx()
        }
    }

    #[tokio::test]
    async fn test_history_failure_does_not_fail_job() {
        let fx = Fixture::new();
        let store = Arc::new(FlakyBalanceStore::new(0, true));
        let tx = credit(1, 50);
        fx.insert(&tx).await;

        let ctx = ctx_with_balances(&fx, store.clone(), RetryPolicy::default());
        TransactionJob::new(tx.id, ctx).execute().await.unwrap();

        assert_eq!(store.get_by_user(1).await.unwrap().amount, dec(50));
        assert_eq!(store.inner.history_len(), 0);
        assert_eq!(fx.status(tx.id).await, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_version_conflict_is_retried() {
        let fx = Fixture::new();
        let store = Arc::new(FlakyBalanceStore::new(2, false));
        let tx = credit(1, 50);
        fx.insert(&tx).await;

        let ctx = ctx_with_balances(&fx, store.clone(), RetryPolicy::new(3, Duration::from_millis(1)));
        TransactionJob::new(tx.id, ctx).execute().await.unwrap();

        let balance = store.get_by_user(1).await.unwrap();
        assert_eq!(balance.amount, dec(50));
        assert_eq!(balance.version, 2);
        assert_eq!(fx.status(tx.id).await, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_version_conflict_without_retry_marks_failed() {
        let fx = Fixture::new();
        let store = Arc::new(FlakyBalanceStore::new(1, false));
        let tx = credit(1, 50);
        fx.insert(&tx).await;

        let ctx = ctx_with_balances(&fx, store.clone(), RetryPolicy::no_retry());
        let result = TransactionJob::new(tx.id, ctx).execute().await;

        assert!(matches!(
            result,
            Err(ProcessingError::VersionConflict { user: 1, .. })
        ));
        assert_eq!(store.get_by_user(1).await.unwrap().amount, Decimal::ZERO);
        assert_eq!(fx.status(tx.id).await, TransactionStatus::Failed);
    }

    /// Transaction store whose completion write always fails
    struct BrokenCompletionStore {
        inner: MemoryTransactionStore,
    }

    #[async_trait]
    impl TransactionStore for BrokenCompletionStore {
        async fn create(&self, transaction: &Transaction) -> Result<(), ProcessingError> {
            self.inner.create(transaction).await
        }

        async fn get(&self, id: TransactionId) -> Result<Transaction, ProcessingError> {
            self.inner.get(id).await
        }

        async fn claim(&self, id: TransactionId) -> Result<Transaction, ProcessingError> {
            self.inner.claim(id).await
        }

        async fn release(&self, id: TransactionId) -> Result<(), ProcessingError> {
            self.inner.release(id).await
        }

        async fn transition_status(
            &self,
            id: TransactionId,
            from: TransactionStatus,
            to: TransactionStatus,
        ) -> Result<(), ProcessingError> {
            if to == TransactionStatus::Completed {
                return Err(ProcessingError::store("status write timed out"));
            }
            self.inner.transition_status(id, from, to).await
        }

        async fn list_pending(&self, limit: usize) -> Result<Vec<Transaction>, ProcessingError> {
            self.inner.list_pending(limit).await
        }

        async fn get_by_reference(
            &self,
            reference_id: &str,
        ) -> Result<Transaction, ProcessingError> {
            self.inner.get_by_reference(reference_id).await
        }

        async fn list_by_user(
            &self,
            user: UserId,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<Transaction>, ProcessingError> {
            self.inner.list_by_user(user, limit, offset).await
        }
    }

    #[tokio::test]
    async fn test_completion_write_failure_propagates_after_mutation() {
        let fx = Fixture::new();
        let transactions = Arc::new(BrokenCompletionStore {
            inner: MemoryTransactionStore::new(),
        });
        let tx = credit(1, 30);
        transactions.create(&tx).await.unwrap();

        let ctx = JobContext {
            transactions: transactions.clone(),
            ..fx.ctx()
        };
        let result = TransactionJob::new(tx.id, ctx).execute().await;

        assert_eq!(result, Err(ProcessingError::store("status write timed out")));
        // Balance was written; the transaction is left pending for reconciliation
        assert_eq!(fx.amount(1).await, dec(30));
        assert_eq!(
            transactions.get(tx.id).await.unwrap().status,
            TransactionStatus::Pending
        );
        assert_eq!(fx.audit.len(), 0);
    }

    /// Balance store that tries to cancel a transaction while its balances
    /// are being written
    struct CancellingBalanceStore {
        inner: MemoryBalanceStore,
        transactions: Arc<MemoryTransactionStore>,
        target: TransactionId,
        attempts: std::sync::Mutex<Vec<Result<(), ProcessingError>>>,
    }

    impl CancellingBalanceStore {
        fn new(transactions: Arc<MemoryTransactionStore>, target: TransactionId) -> Self {
            Self {
                inner: MemoryBalanceStore::new(),
                transactions,
                target,
                attempts: std::sync::Mutex::new(Vec::new()),
            }
        }

        async fn cancel_target(&self) {
            let result = self
                .transactions
                .transition_status(
                    self.target,
                    TransactionStatus::Pending,
                    TransactionStatus::Cancelled,
                )
                .await;
            self.attempts.lock().unwrap().push(result);
        }

        fn attempts(&self) -> Vec<Result<(), ProcessingError>> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BalanceStore for CancellingBalanceStore {
        async fn get_by_user(&self, user: UserId) -> Result<Balance, ProcessingError> {
            self.inner.get_by_user(user).await
        }

        async fn create(&self, balance: &Balance) -> Result<(), ProcessingError> {
            self.inner.create(balance).await
        }

        async fn update_with_version_check(
            &self,
            balance: &Balance,
        ) -> Result<(), ProcessingError> {
            self.cancel_target().await;
            self.inner.update_with_version_check(balance).await
        }

        async fn batch_update(&self, balances: &[Balance]) -> Result<(), ProcessingError> {
            self.cancel_target().await;
            self.inner.batch_update(balances).await
        }

        async fn create_history(&self, entry: &BalanceHistory) -> Result<(), ProcessingError> {
            self.cancel_target().await;
            self.inner.create_history(entry).await
        }

        async fn get_history(
            &self,
            user: UserId,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<BalanceHistory>, ProcessingError> {
            self.inner.get_history(user, limit, offset).await
        }

        async fn balance_at(
            &self,
            user: UserId,
            at: DateTime<Utc>,
        ) -> Result<Decimal, ProcessingError> {
            self.inner.balance_at(user, at).await
        }
    }

    #[rstest]
    #[case::credit(credit(1, 50))]
    #[case::transfer(transfer(2, 1, 50))]
    #[tokio::test]
    async fn test_cancel_during_job_is_refused(#[case] tx: Transaction) {
        let fx = Fixture::new();
        fx.insert(&tx).await;
        let store = Arc::new(CancellingBalanceStore::new(fx.transactions.clone(), tx.id));
        if let Some(from) = tx.from_user {
            let mut funded = Balance::new(from);
            funded.amount = dec(50);
            store.inner.seed(funded);
        }

        let ctx = ctx_with_balances(&fx, store.clone(), RetryPolicy::default());
        TransactionJob::new(tx.id, ctx).execute().await.unwrap();

        let attempts = store.attempts();
        assert!(!attempts.is_empty());
        assert!(attempts
            .iter()
            .all(|attempt| *attempt == Err(ProcessingError::in_progress(tx.id))));
        assert_eq!(fx.status(tx.id).await, TransactionStatus::Completed);
        assert_eq!(store.get_by_user(1).await.unwrap().amount, dec(50));
        assert_eq!(store.inner.history_len(), tx.affected_users().len());
        assert!(!fx.transactions.is_claimed(tx.id));
    }

    #[tokio::test]
    async fn test_cancel_after_failed_job_sees_terminal_status() {
        let fx = Fixture::new();
        let tx = debit(1, 10);
        fx.insert(&tx).await;

        let result = TransactionJob::new(tx.id, fx.ctx()).execute().await;
        assert!(matches!(
            result,
            Err(ProcessingError::InsufficientFunds { .. })
        ));
        assert!(!fx.transactions.is_claimed(tx.id));

        let cancel = fx
            .transactions
            .transition_status(tx.id, TransactionStatus::Pending, TransactionStatus::Cancelled)
            .await;
        assert_eq!(
            cancel,
            Err(ProcessingError::not_processable(
                tx.id,
                TransactionStatus::Failed
            ))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_jobs_apply_once() {
        let fx = Fixture::new();
        let tx = credit(1, 50);
        fx.insert(&tx).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let job = TransactionJob::new(tx.id, fx.ctx());
                tokio::spawn(async move { job.execute().await })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(ProcessingError::TransactionInProgress { .. })
                | Err(ProcessingError::NotProcessable { .. }) => {}
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }

        assert_eq!(succeeded, 1);
        assert_eq!(fx.amount(1).await, dec(50));
        assert_eq!(fx.balances.history_len(), 1);
        assert_eq!(fx.status(tx.id).await, TransactionStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_never_overdraw() {
        let fx = Fixture::new();
        fx.fund(1, 100);
        let first = debit(1, 60);
        let second = debit(1, 60);
        fx.insert(&first).await;
        fx.insert(&second).await;

        let jobs = [
            TransactionJob::new(first.id, fx.ctx()),
            TransactionJob::new(second.id, fx.ctx()),
        ];
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| tokio::spawn(async move { job.execute().await }))
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 1);
        assert_eq!(fx.amount(1).await, dec(40));
        assert_eq!(fx.balances.history_len(), 1);

        let mut statuses = vec![fx.status(first.id).await, fx.status(second.id).await];
        statuses.sort_by_key(|s| s.as_str());
        assert_eq!(
            statuses,
            vec![TransactionStatus::Completed, TransactionStatus::Failed]
        );
    }

    #[tokio::test]
    async fn test_composite_reports_partial_failure_without_rollback() {
        let fx = Fixture::new();
        fx.fund(1, 10);
        let ok_credit = credit(2, 5);
        let bad_debit = debit(1, 50);
        let ok_debit = debit(1, 5);
        for tx in [&ok_credit, &bad_debit, &ok_debit] {
            fx.insert(tx).await;
        }

        let bad_job = TransactionJob::new(bad_debit.id, fx.ctx());
        let bad_job_id = bad_job.id().to_string();
        let composite = CompositeJob::new(vec![
            TransactionJob::new(ok_credit.id, fx.ctx()),
            bad_job,
            TransactionJob::new(ok_debit.id, fx.ctx()),
        ]);

        let result = composite.execute().await;

        match result {
            Err(ProcessingError::BatchFailed {
                batch,
                total,
                failures,
            }) => {
                assert_eq!(batch, composite.id());
                assert_eq!(total, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, bad_job_id);
            }
            other => panic!("expected BatchFailed, got {:?}", other),
        }
        assert_eq!(fx.amount(2).await, dec(5));
        assert_eq!(fx.amount(1).await, dec(5));
        assert_eq!(fx.status(ok_credit.id).await, TransactionStatus::Completed);
        assert_eq!(fx.status(bad_debit.id).await, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_composite_succeeds() {
        let composite = CompositeJob::new(vec![]);
        assert!(composite.is_empty());
        assert!(composite.execute().await.is_ok());
    }

    #[test]
    fn test_job_ids_and_kinds() {
        let fx = Fixture::new();
        let id = Uuid::new_v4();
        let job: Job = TransactionJob::new(id, fx.ctx()).into();
        assert_eq!(job.id(), format!("transaction-{}", id));
        assert_eq!(job.kind(), JobKind::Transaction);

        let batch: Job = CompositeJob::new(vec![]).into();
        assert!(batch.id().starts_with("batch-"));
        assert_eq!(batch.kind(), JobKind::Batch);
        assert_eq!(batch.kind().to_string(), "batch");
    }
}
