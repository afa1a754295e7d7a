//! Append-only in-memory audit trail

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::traits::AuditSink;
use crate::types::{AuditLog, EntityId, ProcessingError};

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: RwLock<Vec<AuditLog>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry in insertion order
    pub fn entries(&self) -> Result<Vec<AuditLog>, ProcessingError> {
        self.entries
            .read()
            .map(|e| e.clone())
            .map_err(|_| ProcessingError::store("audit log lock poisoned"))
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, entry: AuditLog) -> Result<(), ProcessingError> {
        self.entries
            .write()
            .map_err(|_| ProcessingError::store("audit log lock poisoned"))?
            .push(entry);
        Ok(())
    }

    async fn list_by_entity(
        &self,
        entity_id: EntityId,
        limit: usize,
    ) -> Result<Vec<AuditLog>, ProcessingError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| ProcessingError::store("audit log lock poisoned"))?;

        Ok(entries
            .iter()
            .rev()
            .filter(|entry| entry.entity_id == entity_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, ProcessingError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ProcessingError::store("audit log lock poisoned"))?;

        let before = entries.len();
        entries.retain(|entry| entry.created_at >= cutoff);
        Ok(before - entries.len())
    }
}
