//! Balance history entries
//!
//! One entry is appended per affected user for every transaction that
//! successfully mutated a balance. Entries are never updated.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::transaction::{TransactionId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceHistory {
    pub id: Uuid,
    pub user_id: UserId,

    /// Amount after the mutation
    pub amount: Decimal,

    /// Amount before the mutation
    pub previous_amount: Decimal,

    pub transaction_id: TransactionId,
    pub created_at: DateTime<Utc>,
}

impl BalanceHistory {
    pub fn new(
        user_id: UserId,
        transaction_id: TransactionId,
        amount: Decimal,
        previous_amount: Decimal,
    ) -> Self {
        BalanceHistory {
            id: Uuid::new_v4(),
            user_id,
            amount,
            previous_amount,
            transaction_id,
            created_at: Utc::now(),
        }
    }

    /// Signed change applied by the transaction
    pub fn delta(&self) -> Decimal {
        self.amount - self.previous_amount
    }
}
