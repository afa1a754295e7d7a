//! Audit log entries
//!
//! Audit entries are written best-effort after balance mutations and
//! transaction lifecycle changes. Details are free-form JSON so each action can
//! record what is relevant to it.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ProcessingError;
use super::transaction::{TransactionId, TransactionStatus, TransactionType, UserId};

/// Kind of entity an audit entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    User,
    Transaction,
    Balance,
}

/// Recorded action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Credit,
    Debit,
    Transfer,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Credit => "credit",
            AuditAction::Debit => "debit",
            AuditAction::Transfer => "transfer",
        };
        f.write_str(name)
    }
}

/// Identifier of the audited entity
///
/// Balances are keyed by user, transactions by their UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    User(UserId),
    Transaction(TransactionId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub action: AuditAction,
    pub details: serde_json::Value,

    /// User that triggered the action, when known
    pub actor: Option<UserId>,

    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    pub fn new<D: Serialize>(
        entity_type: EntityType,
        action: AuditAction,
        entity_id: EntityId,
        details: &D,
        actor: Option<UserId>,
    ) -> Result<Self, ProcessingError> {
        let details = serde_json::to_value(details).map_err(|e| {
            ProcessingError::store(format!("failed to encode audit details: {}", e))
        })?;

        Ok(AuditLog {
            id: Uuid::new_v4(),
            entity_type,
            entity_id,
            action,
            details,
            actor,
            created_at: Utc::now(),
        })
    }

    /// Decode the details into a typed structure
    pub fn details_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProcessingError> {
        serde_json::from_value(self.details.clone()).map_err(|e| {
            ProcessingError::store(format!("failed to decode audit details: {}", e))
        })
    }
}

/// Details recorded for a balance mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceAuditDetails {
    pub user_id: UserId,
    pub amount: Decimal,
    pub previous_amount: Decimal,
    pub transaction_id: Option<TransactionId>,

    /// `credit`, `debit`, `transfer_out` or `transfer_in`
    pub operation: String,
}

/// Details recorded for a transaction lifecycle change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionAuditDetails {
    pub from_user: Option<UserId>,
    pub to_user: Option<UserId>,
    pub amount: Decimal,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_status: Option<TransactionStatus>,
    pub description: String,
    pub reference_id: Option<String>,
}
