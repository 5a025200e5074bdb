//! Correlation token storage.

use crate::error::StoreError;
use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What is kept per correlation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSignals {
    pub signals: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl StoredSignals {
    pub fn new(signals: impl Into<String>) -> Self {
        Self {
            signals: signals.into(),
            request_id: None,
        }
    }
}

/// Durable keyed storage. Each operation is atomic per key.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn store(&self, token: &str, entry: StoredSignals) -> Result<(), StoreError>;

    async fn get(&self, token: &str) -> Result<Option<StoredSignals>, StoreError>;

    async fn list_all(&self) -> Result<Vec<(String, StoredSignals)>, StoreError>;

    async fn delete(&self, token: &str) -> Result<(), StoreError>;
}

/// In-process store; entries expire with the token.
pub struct MemoryTokenStore {
    inner: Cache<String, StoredSignals>,
}

impl MemoryTokenStore {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn store(&self, token: &str, entry: StoredSignals) -> Result<(), StoreError> {
        self.inner.insert(token.to_string(), entry).await;
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<StoredSignals>, StoreError> {
        Ok(self.inner.get(token).await)
    }

    async fn list_all(&self) -> Result<Vec<(String, StoredSignals)>, StoreError> {
        Ok(self
            .inner
            .iter()
            .map(|(token, entry)| (token.as_ref().clone(), entry))
            .collect())
    }

    async fn delete(&self, token: &str) -> Result<(), StoreError> {
        self.inner.invalidate(token).await;
        Ok(())
    }
}
