//! Thread-safe balance storage with optimistic concurrency
//!
//! This module provides `MemoryBalanceStore`, a DashMap-backed implementation of
//! [`BalanceStore`] that behaves like a row-locked SQL table.
//!
//! # Design
//!
//! Each user's row lives behind its own mutex, shared through `Arc` so the
//! DashMap shard lock is only held long enough to find the row. Holding the row
//! mutex plays the role of `SELECT ... FOR UPDATE`:
//!
//! - `update_with_version_check` locks one row, compares versions, writes
//! - `batch_update` locks every row of the batch in ascending user order,
//!   verifies all versions, then writes all of them before releasing any lock
//!
//! Because rows are always locked in the same order, concurrent batches cannot
//! deadlock each other.
//!
//! # Thread Safety
//!
//! All operations are safe to call concurrently. Lazy creation in `get_by_user`
//! goes through the DashMap entry API, so racing first accesses for the same
//! user observe a single row.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::debug;

use crate::core::traits::BalanceStore;
use crate::types::{Balance, BalanceHistory, ProcessingError, UserId};

type Row = Arc<Mutex<Balance>>;

/// In-memory balance table plus append-only history
#[derive(Debug, Default)]
pub struct MemoryBalanceStore {
    rows: DashMap<UserId, Row>,
    history: RwLock<Vec<BalanceHistory>>,
}

impl MemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a balance directly, bypassing the version protocol
    ///
    /// Intended for loading existing state at startup and for tests.
    pub fn seed(&self, balance: Balance) {
        self.rows
            .insert(balance.user_id, Arc::new(Mutex::new(balance)));
    }

    /// Snapshot of every stored balance, in arbitrary order
    pub fn all_balances(&self) -> Result<Vec<Balance>, ProcessingError> {
        let rows: Vec<Row> = self
            .rows
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        rows.iter()
            .map(|row| lock_row(row).map(|guard| guard.clone()))
            .collect()
    }

    /// Number of history entries across all users
    pub fn history_len(&self) -> usize {
        self.history.read().map(|h| h.len()).unwrap_or_default()
    }

    fn row_or_create(&self, user: UserId) -> Row {
        let entry = self
            .rows
            .entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(Balance::new(user))));
        Arc::clone(entry.value())
    }

    fn existing_row(&self, user: UserId) -> Result<Row, ProcessingError> {
        self.rows
            .get(&user)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ProcessingError::store(format!("balance not found for user {}", user)))
    }
}

fn lock_row(row: &Row) -> Result<MutexGuard<'_, Balance>, ProcessingError> {
    row.lock()
        .map_err(|_| ProcessingError::store("balance row lock poisoned"))
}

fn check_version(stored: &Balance, incoming: &Balance) -> Result<(), ProcessingError> {
    let expected = incoming.version - 1;
    if stored.version != expected {
        return Err(ProcessingError::version_conflict(
            incoming.user_id,
            expected,
            stored.version,
        ));
    }
    Ok(())
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn get_by_user(&self, user: UserId) -> Result<Balance, ProcessingError> {
        let row = self.row_or_create(user);
        let balance = lock_row(&row)?.clone();
        Ok(balance)
    }

    async fn create(&self, balance: &Balance) -> Result<(), ProcessingError> {
        match self.rows.entry(balance.user_id) {
            Entry::Occupied(_) => Err(ProcessingError::store(format!(
                "balance already exists for user {}",
                balance.user_id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(balance.clone())));
                Ok(())
            }
        }
    }

    async fn update_with_version_check(&self, balance: &Balance) -> Result<(), ProcessingError> {
        let row = self.existing_row(balance.user_id)?;
        let mut stored = lock_row(&row)?;

        check_version(&stored, balance)?;
        *stored = balance.clone();

        debug!(
            user_id = balance.user_id,
            version = balance.version,
            "Balance updated"
        );
        Ok(())
    }

    async fn batch_update(&self, balances: &[Balance]) -> Result<(), ProcessingError> {
        let mut ordered: Vec<&Balance> = balances.iter().collect();
        ordered.sort_by_key(|balance| balance.user_id);

        if ordered
            .windows(2)
            .any(|pair| pair[0].user_id == pair[1].user_id)
        {
            return Err(ProcessingError::store(
                "batch update contains the same user twice",
            ));
        }

        let rows = ordered
            .iter()
            .map(|balance| self.existing_row(balance.user_id))
            .collect::<Result<Vec<_>, _>>()?;

        // Lock in ascending user order and keep every lock until all writes are done
        let mut guards = Vec::with_capacity(rows.len());
        for row in &rows {
            guards.push(lock_row(row)?);
        }

        for (stored, incoming) in guards.iter().zip(&ordered) {
            check_version(stored, incoming)?;
        }

        for (stored, incoming) in guards.iter_mut().zip(&ordered) {
            **stored = (*incoming).clone();
        }

        debug!(rows = ordered.len(), "Batch balance update committed");
        Ok(())
    }

    async fn create_history(&self, entry: &BalanceHistory) -> Result<(), ProcessingError> {
        self.history
            .write()
            .map_err(|_| ProcessingError::store("history lock poisoned"))?
            .push(entry.clone());
        Ok(())
    }

    async fn get_history(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BalanceHistory>, ProcessingError> {
        let history = self
            .history
            .read()
            .map_err(|_| ProcessingError::store("history lock poisoned"))?;

        let mut entries: Vec<BalanceHistory> = history
            .iter()
            .filter(|entry| entry.user_id == user)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn balance_at(
        &self,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<Decimal, ProcessingError> {
        let history = self
            .history
            .read()
            .map_err(|_| ProcessingError::store("history lock poisoned"))?;

        Ok(history
            .iter()
            .filter(|entry| entry.user_id == user && entry.created_at <= at)
            .max_by_key(|entry| entry.created_at)
            .map(|entry| entry.amount)
            .unwrap_or(Decimal::ZERO))
    }
}
