//! In-memory expiring cache
//!
//! Values are stored as serialized strings with an absolute expiry instant.
//! Expired entries are dropped lazily on read.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::core::traits::Cache;
use crate::types::ProcessingError;

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, ProcessingError> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .map(|entry| (entry.0.clone(), entry.1 > now));

        match hit {
            Some((value, true)) => Ok(Some(value)),
            Some((_, false)) => {
                self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), ProcessingError> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ProcessingError> {
        self.entries.remove(key);
        Ok(())
    }
}
