//! Transaction-related types for the balance processor
//!
//! This module defines transaction types, statuses, the transaction entity with
//! its state machine, and the request used by the service layer to create one.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ProcessingError;

/// User identifier
pub type UserId = u64;

/// Transaction identifier
pub type TransactionId = Uuid;

/// Kinds of money movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Add funds to the destination user
    Credit,

    /// Remove funds from the source user
    Debit,

    /// Move funds from the source user to the destination user
    Transfer,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Credit => "credit",
            TransactionType::Debit => "debit",
            TransactionType::Transfer => "transfer",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a transaction
///
/// `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested money movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,

    /// Debited user (debit, transfer)
    pub from_user: Option<UserId>,

    /// Credited user (credit, transfer)
    pub to_user: Option<UserId>,

    /// Always greater than zero for a valid transaction
    pub amount: Decimal,

    pub tx_type: TransactionType,

    pub status: TransactionStatus,

    pub description: String,

    /// Caller supplied idempotency/reference key
    pub reference_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Create a new pending transaction, validating its structure
    ///
    /// # Errors
    ///
    /// * `InvalidAmount` if `amount <= 0`
    /// * `InvalidTransaction` if the parties do not match the transaction type
    pub fn new(
        from_user: Option<UserId>,
        to_user: Option<UserId>,
        amount: Decimal,
        tx_type: TransactionType,
        description: impl Into<String>,
        reference_id: Option<String>,
    ) -> Result<Self, ProcessingError> {
        let transaction = Transaction {
            id: Uuid::new_v4(),
            from_user,
            to_user,
            amount,
            tx_type,
            status: TransactionStatus::Pending,
            description: description.into(),
            reference_id,
            created_at: Utc::now(),
        };

        transaction.validate()?;
        Ok(transaction)
    }

    /// Check the amount and the type-specific party rules
    pub fn validate(&self) -> Result<(), ProcessingError> {
        if self.amount <= Decimal::ZERO {
            return Err(ProcessingError::invalid_amount(self.amount));
        }

        match self.tx_type {
            TransactionType::Credit => {
                if self.to_user.is_none() {
                    return Err(ProcessingError::invalid_transaction(
                        "to_user is required for credit transactions",
                    ));
                }
                if self.from_user.is_some() {
                    return Err(ProcessingError::invalid_transaction(
                        "from_user must be empty for credit transactions",
                    ));
                }
            }
            TransactionType::Debit => {
                if self.from_user.is_none() {
                    return Err(ProcessingError::invalid_transaction(
                        "from_user is required for debit transactions",
                    ));
                }
                if self.to_user.is_some() {
                    return Err(ProcessingError::invalid_transaction(
                        "to_user must be empty for debit transactions",
                    ));
                }
            }
            TransactionType::Transfer => match (self.from_user, self.to_user) {
                (Some(from), Some(to)) if from == to => {
                    return Err(ProcessingError::invalid_transaction(
                        "from_user and to_user cannot be the same",
                    ));
                }
                (Some(_), Some(_)) => {}
                _ => {
                    return Err(ProcessingError::invalid_transaction(
                        "both from_user and to_user are required for transfer transactions",
                    ));
                }
            },
        }

        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }

    pub fn is_completed(&self) -> bool {
        self.status == TransactionStatus::Completed
    }

    /// Only pending transactions may be picked up by a job
    pub fn can_be_processed(&self) -> bool {
        self.is_pending()
    }

    pub fn mark_completed(&mut self) -> Result<(), ProcessingError> {
        self.transition_to(TransactionStatus::Completed)
    }

    pub fn mark_failed(&mut self) -> Result<(), ProcessingError> {
        self.transition_to(TransactionStatus::Failed)
    }

    pub fn mark_cancelled(&mut self) -> Result<(), ProcessingError> {
        self.transition_to(TransactionStatus::Cancelled)
    }

    /// Move out of `Pending`; terminal states are final
    fn transition_to(&mut self, status: TransactionStatus) -> Result<(), ProcessingError> {
        if self.status.is_terminal() {
            return Err(ProcessingError::not_processable(self.id, self.status));
        }
        self.status = status;
        Ok(())
    }

    /// Users whose balances this transaction touches (source first)
    pub fn affected_users(&self) -> Vec<UserId> {
        self.from_user.into_iter().chain(self.to_user).collect()
    }
}

/// Service-level request to create a transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub from_user: Option<UserId>,
    pub to_user: Option<UserId>,
    pub amount: Decimal,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reference_id: Option<String>,
}

impl TransactionRequest {
    pub fn credit(to_user: UserId, amount: Decimal) -> Self {
        Self {
            to_user: Some(to_user),
            amount,
            ..Default::default()
        }
    }

    pub fn debit(from_user: UserId, amount: Decimal) -> Self {
        Self {
            from_user: Some(from_user),
            amount,
            ..Default::default()
        }
    }

    pub fn transfer(from_user: UserId, to_user: UserId, amount: Decimal) -> Self {
        Self {
            from_user: Some(from_user),
            to_user: Some(to_user),
            amount,
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }
}
