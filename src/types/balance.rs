//! Balance-related types for the balance processor
//!
//! This module defines the per-user `Balance` entity with its mutation rules,
//! and the read-only `BalanceSnapshot` view.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::ProcessingError;
use super::transaction::UserId;

/// Per-user monetary balance
///
/// The store owns the authoritative row. A `Balance` held by a job is a working
/// copy: every successful `credit`/`debit` bumps `version` by one, and the store
/// only accepts the write if its stored version is exactly `version - 1`.
///
/// Mutation takes `&mut self`, so two callers can never race on the same
/// instance. Two independent copies of one user's row are not coordinated here;
/// the store's version check is what serializes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: UserId,

    /// Never negative
    pub amount: Decimal,

    pub last_updated_at: DateTime<Utc>,

    /// Starts at 1, strictly increases on every successful mutation
    pub version: i64,
}

impl Balance {
    /// Create a new zero balance at version 1
    pub fn new(user_id: UserId) -> Self {
        Balance {
            user_id,
            amount: Decimal::ZERO,
            last_updated_at: Utc::now(),
            version: 1,
        }
    }

    /// Add `amount` to the balance
    ///
    /// # Errors
    ///
    /// * `InvalidAmount` if `amount <= 0`
    pub fn credit(&mut self, amount: Decimal) -> Result<(), ProcessingError> {
        if amount <= Decimal::ZERO {
            return Err(ProcessingError::invalid_amount(amount));
        }

        self.amount = self.amount.checked_add(amount).ok_or_else(|| {
            ProcessingError::invalid_transaction(format!(
                "credit of {} overflows balance of user {}",
                amount, self.user_id
            ))
        })?;
        self.touch();
        Ok(())
    }

    /// Subtract `amount` from the balance
    ///
    /// # Errors
    ///
    /// * `InvalidAmount` if `amount <= 0`
    /// * `InsufficientFunds` if `amount` exceeds the current amount
    pub fn debit(&mut self, amount: Decimal) -> Result<(), ProcessingError> {
        if amount <= Decimal::ZERO {
            return Err(ProcessingError::invalid_amount(amount));
        }

        if !self.has_sufficient_balance(amount) {
            return Err(ProcessingError::insufficient_funds(
                self.user_id,
                self.amount,
                amount,
            ));
        }

        self.amount -= amount;
        self.touch();
        Ok(())
    }

    pub fn has_sufficient_balance(&self, amount: Decimal) -> bool {
        self.amount >= amount
    }

    pub fn is_empty(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn validate(&self) -> Result<(), ProcessingError> {
        if self.amount < Decimal::ZERO {
            return Err(ProcessingError::invalid_amount(self.amount));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            user_id: self.user_id,
            amount: self.amount,
            timestamp: self.last_updated_at,
        }
    }

    fn touch(&mut self) {
        self.last_updated_at = Utc::now();
        self.version += 1;
    }
}

/// Point-in-time view of a balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub user_id: UserId,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}
