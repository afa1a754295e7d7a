//! Thread-safe transaction storage
//!
//! `MemoryTransactionStore` keeps transactions in a DashMap keyed by ID, plus a
//! secondary index from reference ID to transaction ID.
//!
//! # Thread Safety
//!
//! Status transitions and claims use `get_mut`, which holds the shard write
//! lock for the duration of the check. The claim set is only touched under
//! that lock (release aside), so a cancel either lands before a job claims the
//! transaction or is refused until the job has finished.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use crate::core::traits::TransactionStore;
use crate::types::{ProcessingError, Transaction, TransactionId, TransactionStatus, UserId};

#[derive(Debug, Default)]
pub struct MemoryTransactionStore {
    transactions: DashMap<TransactionId, Transaction>,
    by_reference: DashMap<String, TransactionId>,
    claimed: DashSet<TransactionId>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn is_claimed(&self, id: TransactionId) -> bool {
        self.claimed.contains(&id)
    }

    /// Count transactions per status
    pub fn count_by_status(&self, status: TransactionStatus) -> usize {
        self.transactions
            .iter()
            .filter(|entry| entry.status == status)
            .count()
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn create(&self, transaction: &Transaction) -> Result<(), ProcessingError> {
        // Claim the reference first so a duplicate never leaves a stray row
        if let Some(reference) = &transaction.reference_id {
            match self.by_reference.entry(reference.clone()) {
                Entry::Occupied(_) => {
                    return Err(ProcessingError::store(format!(
                        "duplicate reference id {}",
                        reference
                    )))
                }
                Entry::Vacant(entry) => {
                    entry.insert(transaction.id);
                }
            }
        }

        match self.transactions.entry(transaction.id) {
            Entry::Occupied(_) => {
                if let Some(reference) = &transaction.reference_id {
                    self.by_reference.remove(reference);
                }
                Err(ProcessingError::store(format!(
                    "transaction {} already exists",
                    transaction.id
                )))
            }
            Entry::Vacant(entry) => {
                entry.insert(transaction.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: TransactionId) -> Result<Transaction, ProcessingError> {
        self.transactions
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or_else(|| ProcessingError::transaction_not_found(id))
    }

    async fn claim(&self, id: TransactionId) -> Result<Transaction, ProcessingError> {
        let stored = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| ProcessingError::transaction_not_found(id))?;

        if !stored.is_pending() {
            return Err(ProcessingError::not_processable(id, stored.status));
        }
        if !self.claimed.insert(id) {
            return Err(ProcessingError::in_progress(id));
        }
        Ok(stored.clone())
    }

    async fn release(&self, id: TransactionId) -> Result<(), ProcessingError> {
        self.claimed.remove(&id);
        Ok(())
    }

    async fn transition_status(
        &self,
        id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<(), ProcessingError> {
        let mut stored = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| ProcessingError::transaction_not_found(id))?;

        if stored.status != from {
            return Err(ProcessingError::not_processable(id, stored.status));
        }
        let settles = matches!(to, TransactionStatus::Completed | TransactionStatus::Failed);
        if !settles && self.claimed.contains(&id) {
            return Err(ProcessingError::in_progress(id));
        }
        stored.status = to;
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Transaction>, ProcessingError> {
        let mut pending: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|entry| entry.is_pending())
            .map(|entry| entry.clone())
            .collect();

        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn get_by_reference(&self, reference_id: &str) -> Result<Transaction, ProcessingError> {
        let id = self
            .by_reference
            .get(reference_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| {
                ProcessingError::store(format!("no transaction with reference {}", reference_id))
            })?;

        self.get(id).await
    }

    async fn list_by_user(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>, ProcessingError> {
        let mut matching: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|entry| entry.from_user == Some(user) || entry.to_user == Some(user))
            .map(|entry| entry.clone())
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }
}
