//! Transaction service: the entry point for callers
//!
//! The service validates requests, persists them as pending transactions and
//! enqueues a job for each one. It returns as soon as the job is queued;
//! settlement happens on the worker pool.
//!
//! # Design
//!
//! - Validation and the source sufficiency pre-check run synchronously, so
//!   obviously bad requests are rejected before anything is persisted
//! - Jobs go through the [`BatchProcessor`] when one is configured, otherwise
//!   straight to the [`WorkerPool`]
//! - If a job cannot be enqueued the transaction is marked failed and the
//!   enqueue error is returned
//! - Reads are cache-first. The cache is never authoritative: any miss,
//!   decode error or cache failure falls back to the store
//!
//! The sufficiency pre-check is advisory. The job re-checks under the store's
//! version protocol, which is what actually prevents overdrafts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::core::batch_processor::BatchProcessor;
use crate::core::job::{JobContext, TransactionJob};
use crate::core::traits::{AuditSink, BalanceStore, Cache, TransactionStore};
use crate::core::worker_pool::WorkerPool;
use crate::types::{
    AuditAction, AuditLog, Balance, BalanceHistory, BalanceSnapshot, EntityId, EntityType,
    ProcessingError, Transaction, TransactionAuditDetails, TransactionId, TransactionRequest,
    TransactionStatus, TransactionType, UserId,
};

/// Completed transactions never change, so they can be cached for long
const TRANSACTION_CACHE_TTL: Duration = Duration::from_secs(3600);

const BALANCE_CACHE_TTL: Duration = Duration::from_secs(60);

fn transaction_key(id: TransactionId) -> String {
    format!("transaction:{}", id)
}

fn balance_key(user: UserId) -> String {
    format!("balance:{}", user)
}

pub struct TransactionService {
    balances: Arc<dyn BalanceStore>,
    transactions: Arc<dyn TransactionStore>,
    cache: Arc<dyn Cache>,
    audit: Arc<dyn AuditSink>,
    pool: Arc<WorkerPool>,
    batcher: Option<Arc<BatchProcessor>>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for TransactionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionService")
            .field("pool", &self.pool)
            .field("batched", &self.batcher.is_some())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl TransactionService {
    /// Create a service submitting one job per transaction to `pool`
    pub fn new(
        balances: Arc<dyn BalanceStore>,
        transactions: Arc<dyn TransactionStore>,
        cache: Arc<dyn Cache>,
        audit: Arc<dyn AuditSink>,
        pool: Arc<WorkerPool>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            balances,
            transactions,
            cache,
            audit,
            pool,
            batcher: None,
            retry,
        }
    }

    /// Route jobs through a batch processor instead of the pool
    pub fn with_batch_processor(mut self, batcher: Arc<BatchProcessor>) -> Self {
        self.batcher = Some(batcher);
        self
    }

    fn job_context(&self) -> JobContext {
        JobContext {
            balances: Arc::clone(&self.balances),
            transactions: Arc::clone(&self.transactions),
            audit: Arc::clone(&self.audit),
            retry: self.retry.clone(),
        }
    }

    fn enqueue(&self, id: TransactionId) -> Result<(), ProcessingError> {
        let job = TransactionJob::new(id, self.job_context());
        match &self.batcher {
            Some(batcher) => batcher.add_job(job),
            None => self.pool.submit(job.into()),
        }
    }

    pub async fn create_credit(
        &self,
        request: TransactionRequest,
        actor: Option<UserId>,
    ) -> Result<Transaction, ProcessingError> {
        self.create(TransactionType::Credit, request, actor).await
    }

    pub async fn create_debit(
        &self,
        request: TransactionRequest,
        actor: Option<UserId>,
    ) -> Result<Transaction, ProcessingError> {
        self.create(TransactionType::Debit, request, actor).await
    }

    pub async fn create_transfer(
        &self,
        request: TransactionRequest,
        actor: Option<UserId>,
    ) -> Result<Transaction, ProcessingError> {
        self.create(TransactionType::Transfer, request, actor).await
    }

    /// Validate, persist as pending, and enqueue
    ///
    /// # Returns
    ///
    /// The pending transaction. Its final status is only known once the job
    /// has run; see [`TransactionService::await_settled`].
    ///
    /// # Errors
    ///
    /// * `InvalidAmount` / `InvalidTransaction` for malformed requests
    /// * `InsufficientFunds` if the source balance is already too low
    /// * `QueueFull` / `PoolShuttingDown` if the job could not be enqueued;
    ///   the transaction is persisted as failed in that case
    pub async fn create(
        &self,
        tx_type: TransactionType,
        request: TransactionRequest,
        actor: Option<UserId>,
    ) -> Result<Transaction, ProcessingError> {
        info!(
            tx_type = %tx_type,
            from_user = ?request.from_user,
            to_user = ?request.to_user,
            amount = %request.amount,
            "Creating transaction"
        );

        let transaction = Transaction::new(
            request.from_user,
            request.to_user,
            request.amount,
            tx_type,
            request.description,
            request.reference_id,
        )?;

        if let Some(from) = transaction.from_user {
            let balance = self.balances.get_by_user(from).await?;
            if !balance.has_sufficient_balance(transaction.amount) {
                return Err(ProcessingError::insufficient_funds(
                    from,
                    balance.amount,
                    transaction.amount,
                ));
            }
        }

        self.transactions.create(&transaction).await?;

        if let Err(e) = self.enqueue(transaction.id) {
            error!(
                transaction_id = %transaction.id,
                error = %e,
                "Failed to submit transaction job"
            );
            if let Err(update_err) = self
                .transactions
                .transition_status(
                    transaction.id,
                    TransactionStatus::Pending,
                    TransactionStatus::Failed,
                )
                .await
            {
                warn!(
                    transaction_id = %transaction.id,
                    error = %update_err,
                    "Failed to mark unsubmitted transaction as failed"
                );
            }
            return Err(e);
        }

        self.record_transaction_audit(&transaction, AuditAction::Create, None, actor)
            .await;

        info!(
            transaction_id = %transaction.id,
            tx_type = %tx_type,
            amount = %transaction.amount,
            "Transaction created"
        );
        Ok(transaction)
    }

    /// Get a transaction, cache-first
    pub async fn get_transaction(&self, id: TransactionId) -> Result<Transaction, ProcessingError> {
        let key = transaction_key(id);
        if let Some(cached) = self.cache_get::<Transaction>(&key).await {
            return Ok(cached);
        }

        let transaction = self.transactions.get(id).await?;
        if transaction.is_completed() {
            self.cache_set(&key, &transaction, TRANSACTION_CACHE_TTL)
                .await;
        }
        Ok(transaction)
    }

    pub async fn get_transaction_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Transaction, ProcessingError> {
        self.transactions.get_by_reference(reference_id).await
    }

    pub async fn get_user_transactions(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>, ProcessingError> {
        self.transactions.list_by_user(user, limit, offset).await
    }

    /// Cancel a pending transaction
    ///
    /// # Errors
    ///
    /// * `NotProcessable` if the transaction is no longer pending, including
    ///   when a job completes it concurrently
    /// * `TransactionInProgress` if a job is settling it right now
    pub async fn cancel_transaction(
        &self,
        id: TransactionId,
        actor: Option<UserId>,
    ) -> Result<Transaction, ProcessingError> {
        let mut transaction = self.transactions.get(id).await?;
        if !transaction.is_pending() {
            return Err(ProcessingError::not_processable(id, transaction.status));
        }

        self.transactions
            .transition_status(id, TransactionStatus::Pending, TransactionStatus::Cancelled)
            .await?;
        transaction.mark_cancelled()?;

        self.record_transaction_audit(
            &transaction,
            AuditAction::Update,
            Some(TransactionStatus::Pending),
            actor,
        )
        .await;

        info!(transaction_id = %id, "Transaction cancelled");
        Ok(transaction)
    }

    /// Re-enqueue up to `limit` pending transactions, oldest first
    ///
    /// Returns how many were enqueued. Enqueue failures are logged and skipped.
    pub async fn process_pending(&self, limit: usize) -> Result<usize, ProcessingError> {
        let pending = self.transactions.list_pending(limit).await?;

        let mut submitted = 0;
        for transaction in &pending {
            match self.enqueue(transaction.id) {
                Ok(()) => submitted += 1,
                Err(e) => error!(
                    transaction_id = %transaction.id,
                    error = %e,
                    "Failed to submit transaction job"
                ),
            }
        }

        info!(
            count = submitted,
            found = pending.len(),
            "Submitted pending transactions for processing"
        );
        Ok(submitted)
    }

    /// Wait until none of `ids` is pending
    ///
    /// Reads go to the store, never the cache.
    ///
    /// # Errors
    ///
    /// * `PoolShuttingDown` if a transaction is still pending but the pool is
    ///   not running, since nothing could settle it
    pub async fn await_settled(
        &self,
        ids: &[TransactionId],
        poll: Duration,
    ) -> Result<(), ProcessingError> {
        for &id in ids {
            while self.transactions.get(id).await?.is_pending() {
                if !self.pool.is_running() {
                    return Err(ProcessingError::PoolShuttingDown);
                }
                tokio::time::sleep(poll).await;
            }
        }
        Ok(())
    }

    /// Current balance, cache-first with a short TTL
    ///
    /// May lag behind the store by up to the TTL; use
    /// [`TransactionService::refresh_balance`] for a fresh read.
    pub async fn get_balance(&self, user: UserId) -> Result<Balance, ProcessingError> {
        let key = balance_key(user);
        if let Some(cached) = self.cache_get::<Balance>(&key).await {
            return Ok(cached);
        }

        let balance = self.balances.get_by_user(user).await?;
        self.cache_set(&key, &balance, BALANCE_CACHE_TTL).await;
        Ok(balance)
    }

    pub async fn invalidate_balance_cache(&self, user: UserId) {
        if let Err(e) = self.cache.delete(&balance_key(user)).await {
            warn!(user_id = user, error = %e, "Failed to invalidate balance cache");
        }
    }

    /// Drop the cached balance and read it again from the store
    pub async fn refresh_balance(&self, user: UserId) -> Result<Balance, ProcessingError> {
        self.invalidate_balance_cache(user).await;
        self.get_balance(user).await
    }

    pub async fn get_balance_history(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BalanceHistory>, ProcessingError> {
        self.balances.get_history(user, limit, offset).await
    }

    pub async fn get_balance_at(
        &self,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<Decimal, ProcessingError> {
        self.balances.balance_at(user, at).await
    }

    pub async fn get_balance_snapshot(
        &self,
        user: UserId,
    ) -> Result<BalanceSnapshot, ProcessingError> {
        Ok(self.get_balance(user).await?.snapshot())
    }

    /// Create a zero balance for a new user
    ///
    /// # Errors
    ///
    /// * `StoreError` if the user already has a balance
    pub async fn create_initial_balance(&self, user: UserId) -> Result<Balance, ProcessingError> {
        let balance = Balance::new(user);
        self.balances.create(&balance).await?;
        info!(user_id = user, "Initial balance created");
        Ok(balance)
    }

    async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    debug!(key, "Cache hit");
                    Some(value)
                }
                Err(e) => {
                    warn!(key, error = %e, "Discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed");
                None
            }
        }
    }

    async fn cache_set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let stored = match serde_json::to_string(value) {
            Ok(raw) => self.cache.set(key, raw, ttl).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = stored {
            warn!(key, error = %e, "Cache write failed");
        }
    }

    async fn record_transaction_audit(
        &self,
        transaction: &Transaction,
        action: AuditAction,
        old_status: Option<TransactionStatus>,
        actor: Option<UserId>,
    ) {
        let details = TransactionAuditDetails {
            from_user: transaction.from_user,
            to_user: transaction.to_user,
            amount: transaction.amount,
            tx_type: transaction.tx_type,
            status: transaction.status,
            old_status,
            description: transaction.description.clone(),
            reference_id: transaction.reference_id.clone(),
        };

        let recorded = match AuditLog::new(
            EntityType::Transaction,
            action,
            EntityId::Transaction(transaction.id),
            &details,
            actor,
        ) {
            Ok(entry) => self.audit.record(entry).await,
            Err(e) => Err(e),
        };

        if let Err(e) = recorded {
            warn!(transaction_id = %transaction.id, error = %e, "Failed to create audit log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    use crate::config::{BatchConfig, PoolConfig};
    use crate::core::store::{
        MemoryAuditLog, MemoryBalanceStore, MemoryCache, MemoryTransactionStore,
    };

    const POLL: Duration = Duration::from_millis(2);

    struct Harness {
        service: TransactionService,
        balances: Arc<MemoryBalanceStore>,
        transactions: Arc<MemoryTransactionStore>,
        cache: Arc<MemoryCache>,
        audit: Arc<MemoryAuditLog>,
        pool: Arc<WorkerPool>,
    }

    impl Harness {
        fn new(queue_size: usize) -> Self {
            let balances = Arc::new(MemoryBalanceStore::new());
            let transactions = Arc::new(MemoryTransactionStore::new());
            let cache = Arc::new(MemoryCache::new());
            let audit = Arc::new(MemoryAuditLog::new());
            let pool = Arc::new(WorkerPool::new(PoolConfig::new(2, queue_size)));

            let service = TransactionService::new(
                balances.clone(),
                transactions.clone(),
                cache.clone(),
                audit.clone(),
                Arc::clone(&pool),
                RetryPolicy::new(3, Duration::from_millis(1)),
            );

            Self {
                service,
                balances,
                transactions,
                cache,
                audit,
                pool,
            }
        }

        fn started(queue_size: usize) -> Self {
            let harness = Self::new(queue_size);
            harness.pool.start().unwrap();
            harness
        }

        fn fund(&self, user: UserId, amount: i64) {
            let mut balance = Balance::new(user);
            balance.amount = dec(amount);
            self.balances.seed(balance);
        }

        async fn amount(&self, user: UserId) -> Decimal {
            self.balances.get_by_user(user).await.unwrap().amount
        }

        async fn status(&self, id: TransactionId) -> TransactionStatus {
            self.transactions.get(id).await.unwrap().status
        }
    }

    fn dec(value: i64) -> Decimal {
        Decimal::new(value, 0)
    }

    #[tokio::test]
    async fn test_credit_is_accepted_then_settled() {
        let h = Harness::started(16);

        let tx = h
            .service
            .create_credit(TransactionRequest::credit(1, dec(100)), None)
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);

        h.service.await_settled(&[tx.id], POLL).await.unwrap();

        assert_eq!(h.status(tx.id).await, TransactionStatus::Completed);
        assert_eq!(h.amount(1).await, dec(100));
    }

    #[rstest]
    #[case::zero_amount(TransactionType::Credit, TransactionRequest::credit(1, dec(0)))]
    #[case::negative_amount(TransactionType::Credit, TransactionRequest::credit(1, dec(-5)))]
    #[case::credit_missing_destination(TransactionType::Credit, TransactionRequest::debit(1, dec(5)))]
    #[case::transfer_to_self(TransactionType::Transfer, TransactionRequest::transfer(1, 1, dec(5)))]
    #[tokio::test]
    async fn test_invalid_requests_are_rejected_without_persisting(
        #[case] tx_type: TransactionType,
        #[case] request: TransactionRequest,
    ) {
        let h = Harness::started(16);
        h.fund(1, 100);

        let result = h.service.create(tx_type, request, None).await;

        assert!(matches!(
            result,
            Err(ProcessingError::InvalidAmount { .. })
                | Err(ProcessingError::InvalidTransaction { .. })
        ));
        assert!(h.transactions.is_empty());
        assert_eq!(h.pool.queue_len(), 0);
    }

    #[rstest]
    #[case::debit(TransactionType::Debit, TransactionRequest::debit(1, dec(60)))]
    #[case::transfer(TransactionType::Transfer, TransactionRequest::transfer(1, 2, dec(60)))]
    #[tokio::test]
    async fn test_insufficient_source_is_rejected_synchronously(
        #[case] tx_type: TransactionType,
        #[case] request: TransactionRequest,
    ) {
        let h = Harness::started(16);
        h.fund(1, 40);

        let result = h.service.create(tx_type, request, None).await;

        assert_eq!(
            result,
            Err(ProcessingError::insufficient_funds(1, dec(40), dec(60)))
        );
        assert!(h.transactions.is_empty());
    }

    #[tokio::test]
    async fn test_queue_full_marks_transaction_failed() {
        // Not started, so the single slot stays occupied
        let h = Harness::new(1);

        h.service
            .create_credit(TransactionRequest::credit(1, dec(10)), None)
            .await
            .unwrap();
        let result = h
            .service
            .create_credit(TransactionRequest::credit(2, dec(10)), None)
            .await;

        assert_eq!(result, Err(ProcessingError::QueueFull));
        assert_eq!(h.transactions.len(), 2);
        assert_eq!(h.transactions.count_by_status(TransactionStatus::Failed), 1);
        assert_eq!(h.transactions.count_by_status(TransactionStatus::Pending), 1);
    }

    #[tokio::test]
    async fn test_submission_after_stop_is_rejected() {
        let h = Harness::started(16);
        h.pool.stop().await;

        let result = h
            .service
            .create_credit(TransactionRequest::credit(1, dec(10)), None)
            .await;

        assert_eq!(result, Err(ProcessingError::PoolShuttingDown));
        assert_eq!(h.transactions.count_by_status(TransactionStatus::Failed), 1);
    }

    #[tokio::test]
    async fn test_cancelled_transaction_is_never_applied() {
        let h = Harness::new(16);

        let tx = h
            .service
            .create_credit(TransactionRequest::credit(1, dec(10)), Some(99))
            .await
            .unwrap();
        let cancelled = h.service.cancel_transaction(tx.id, Some(99)).await.unwrap();
        assert_eq!(cancelled.status, TransactionStatus::Cancelled);

        h.pool.start().unwrap();
        h.pool.stop().await;

        assert_eq!(h.status(tx.id).await, TransactionStatus::Cancelled);
        assert_eq!(h.amount(1).await, Decimal::ZERO);
        assert_eq!(h.pool.metrics().failed, 1);

        let entries = h
            .audit
            .list_by_entity(EntityId::Transaction(tx.id), 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, AuditAction::Update);
        assert_eq!(entries[0].actor, Some(99));
        assert_eq!(entries[0].details["old_status"], "pending");
        assert_eq!(entries[1].action, AuditAction::Create);
    }

    #[tokio::test]
    async fn test_cancel_of_settled_transaction_is_rejected() {
        let h = Harness::started(16);
        let tx = h
            .service
            .create_credit(TransactionRequest::credit(1, dec(10)), None)
            .await
            .unwrap();
        h.service.await_settled(&[tx.id], POLL).await.unwrap();

        let result = h.service.cancel_transaction(tx.id, None).await;

        assert_eq!(
            result,
            Err(ProcessingError::not_processable(
                tx.id,
                TransactionStatus::Completed
            ))
        );
    }

    #[tokio::test]
    async fn test_cancel_of_claimed_transaction_is_refused() {
        let h = Harness::new(16);
        let tx = h
            .service
            .create_credit(TransactionRequest::credit(1, dec(10)), None)
            .await
            .unwrap();
        h.transactions.claim(tx.id).await.unwrap();

        let result = h.service.cancel_transaction(tx.id, None).await;

        assert_eq!(result, Err(ProcessingError::in_progress(tx.id)));
        assert_eq!(h.status(tx.id).await, TransactionStatus::Pending);
        let entries = h
            .audit
            .list_by_entity(EntityId::Transaction(tx.id), 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);

        h.transactions.release(tx.id).await.unwrap();
        let cancelled = h.service.cancel_transaction(tx.id, None).await.unwrap();
        assert_eq!(cancelled.status, TransactionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_completed_transaction_is_cached() {
        let h = Harness::started(16);
        let tx = h
            .service
            .create_credit(TransactionRequest::credit(1, dec(10)), None)
            .await
            .unwrap();

        h.service.await_settled(&[tx.id], POLL).await.unwrap();
        assert!(h.cache.is_empty());

        let loaded = h.service.get_transaction(tx.id).await.unwrap();
        assert_eq!(loaded.status, TransactionStatus::Completed);
        assert!(h
            .cache
            .get(&transaction_key(tx.id))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_balance_cache_and_refresh() {
        let h = Harness::new(16);
        h.fund(1, 10);

        assert_eq!(h.service.get_balance(1).await.unwrap().amount, dec(10));

        // Change the store behind the cache
        h.fund(1, 25);
        assert_eq!(h.service.get_balance(1).await.unwrap().amount, dec(10));
        assert_eq!(h.service.refresh_balance(1).await.unwrap().amount, dec(25));

        let snapshot = h.service.get_balance_snapshot(1).await.unwrap();
        assert_eq!(snapshot.amount, dec(25));
    }

    #[tokio::test]
    async fn test_process_pending_resubmits_stranded_transactions() {
        let h = Harness::new(16);
        let stranded =
            Transaction::new(None, Some(3), dec(7), TransactionType::Credit, "", None).unwrap();
        h.transactions.create(&stranded).await.unwrap();

        let submitted = h.service.process_pending(10).await.unwrap();
        assert_eq!(submitted, 1);

        h.pool.start().unwrap();
        h.service.await_settled(&[stranded.id], POLL).await.unwrap();

        assert_eq!(h.status(stranded.id).await, TransactionStatus::Completed);
        assert_eq!(h.amount(3).await, dec(7));
    }

    #[tokio::test]
    async fn test_await_settled_fails_when_pool_is_not_running() {
        let h = Harness::new(16);
        let tx = h
            .service
            .create_credit(TransactionRequest::credit(1, dec(1)), None)
            .await
            .unwrap();

        let result = h.service.await_settled(&[tx.id], POLL).await;

        assert_eq!(result, Err(ProcessingError::PoolShuttingDown));
    }

    #[tokio::test]
    async fn test_history_and_point_in_time_balance() {
        let h = Harness::started(16);
        h.fund(1, 100);
        let tx = h
            .service
            .create_transfer(
                TransactionRequest::transfer(1, 2, dec(30)).with_reference("order-17"),
                None,
            )
            .await
            .unwrap();
        h.service.await_settled(&[tx.id], POLL).await.unwrap();

        let history = h.service.get_balance_history(1, 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].delta(), dec(-30));

        let now = h.service.get_balance_at(2, Utc::now()).await.unwrap();
        assert_eq!(now, dec(30));

        let by_reference = h
            .service
            .get_transaction_by_reference("order-17")
            .await
            .unwrap();
        assert_eq!(by_reference.id, tx.id);

        let for_user = h.service.get_user_transactions(2, 10, 0).await.unwrap();
        assert_eq!(for_user.len(), 1);
    }

    #[tokio::test]
    async fn test_create_initial_balance_only_once() {
        let h = Harness::new(16);

        let balance = h.service.create_initial_balance(5).await.unwrap();
        assert_eq!(balance.amount, Decimal::ZERO);
        assert_eq!(balance.version, 1);

        let again = h.service.create_initial_balance(5).await;
        assert!(matches!(again, Err(ProcessingError::StoreError { .. })));
    }

    #[tokio::test]
    async fn test_batched_service_settles_transactions() {
        let h = Harness::started(16);
        let batcher = BatchProcessor::new(
            Arc::clone(&h.pool),
            BatchConfig::new(3, Duration::from_millis(5)),
        );
        let service = TransactionService::new(
            h.balances.clone(),
            h.transactions.clone(),
            h.cache.clone(),
            h.audit.clone(),
            Arc::clone(&h.pool),
            RetryPolicy::default(),
        )
        .with_batch_processor(Arc::clone(&batcher));

        let mut ids = vec![];
        for user in 1..=5u64 {
            let tx = service
                .create_credit(TransactionRequest::credit(user, dec(2)), None)
                .await
                .unwrap();
            ids.push(tx.id);
        }

        service.await_settled(&ids, POLL).await.unwrap();
        batcher.stop().await.unwrap();

        for user in 1..=5u64 {
            assert_eq!(h.amount(user).await, dec(2));
        }
    }
}
