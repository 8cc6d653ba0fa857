use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
    #[error("stored item {key} is corrupt: {message}")]
    Corrupt { key: String, message: String },
}

/// Durable items addressed by `(category, key)` with an optional epoch-seconds expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, category: &str, key: &str) -> Result<Option<Value>, StoreError>;

    async fn put_item(
        &self,
        category: &str,
        key: &str,
        value: Value,
        ttl: Option<i64>,
    ) -> Result<(), StoreError>;
}

pub fn memory() -> Arc<dyn KeyValueStore> {
    Arc::new(MemoryKeyValueStore::default())
}

#[derive(Default)]
pub struct MemoryKeyValueStore {
    inner: Mutex<HashMap<(String, String), (Value, Option<i64>)>>,
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get_item(&self, category: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let mut inner = self.inner.lock().await;
        let slot = (category.to_string(), key.to_string());
        let expired = inner
            .get(&slot)
            .and_then(|(_, ttl)| *ttl)
            .is_some_and(|ttl| ttl <= Utc::now().timestamp());
        if expired {
            inner.remove(&slot);
            return Ok(None);
        }
        Ok(inner.get(&slot).map(|(value, _)| value.clone()))
    }

    async fn put_item(
        &self,
        category: &str,
        key: &str,
        value: Value,
        ttl: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.insert((category.to_string(), key.to_string()), (value, ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::memory;

    #[tokio::test]
    async fn items_are_scoped_by_category() -> anyhow::Result<()> {
        let store = memory();
        store
            .put_item("task", "a/b", json!({"status": "pending"}), None)
            .await?;
        assert_eq!(
            store.get_item("task", "a/b").await?,
            Some(json!({"status": "pending"}))
        );
        assert_eq!(store.get_item("other", "a/b").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn expired_items_are_not_returned() -> anyhow::Result<()> {
        let store = memory();
        let past = Utc::now().timestamp() - 1;
        let future = Utc::now().timestamp() + 60;
        store.put_item("task", "old", json!(1), Some(past)).await?;
        store.put_item("task", "new", json!(2), Some(future)).await?;
        assert_eq!(store.get_item("task", "old").await?, None);
        assert_eq!(store.get_item("task", "new").await?, Some(json!(2)));
        Ok(())
    }
}
