//! Connection-scoped key-value binding
//!
//! A stateless façade over the external shared cache. Every logical key is
//! namespaced as `store:{connectionId}:{key}`; connection ids are opaque
//! tokens minted upstream and never contain `:`, so no logical key can
//! collide across connections. Values are JSON on the wire.

use crate::error::{Result, RotorError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

const KEY_PREFIX: &str = "store";

/// External shared cache with a flat string keyspace.
#[async_trait]
pub trait SharedKvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Per-connection view over the shared store, passed by value into every
/// UDF invocation. Holds no local state.
#[derive(Clone)]
pub struct KvBinding {
    connection_id: String,
    store: Arc<dyn SharedKvStore>,
}

impl KvBinding {
    pub fn new(connection_id: impl Into<String>, store: Arc<dyn SharedKvStore>) -> Self {
        Self {
            connection_id: connection_id.into(),
            store,
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{KEY_PREFIX}:{}:{key}", self.connection_id)
    }

    /// Read a value; `Ok(None)` when the key is absent.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.store.get(&self.scoped(key)).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .map_err(|e| RotorError::Kv(format!("corrupt value under '{key}': {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set(&self.scoped(key), raw).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(&self.scoped(key)).await
    }
}

/// DashMap-backed store for tests and ad-hoc UDF runs.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, String>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw view for assertions.
    pub fn raw_get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.value().clone())
    }
}

#[async_trait]
impl SharedKvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_roundtrip() {
        let store = Arc::new(InMemoryKvStore::new());
        let kv = KvBinding::new("c1", store.clone());

        kv.set("cart", &json!({"items": 3})).await.unwrap();
        assert_eq!(kv.get("cart").await.unwrap(), Some(json!({"items": 3})));

        kv.delete("cart").await.unwrap();
        assert_eq!(kv.get("cart").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let kv = KvBinding::new("c1", Arc::new(InMemoryKvStore::new()));
        assert_eq!(kv.get("nothing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_are_namespaced_per_connection() {
        let store = Arc::new(InMemoryKvStore::new());
        let kv1 = KvBinding::new("c1", store.clone());
        let kv2 = KvBinding::new("c2", store.clone());

        kv1.set("counter", &json!(1)).await.unwrap();
        assert_eq!(kv2.get("counter").await.unwrap(), None);
        assert!(store.raw_get("store:c1:counter").is_some());
    }

    #[tokio::test]
    async fn test_corrupt_value_is_an_error() {
        let store = Arc::new(InMemoryKvStore::new());
        store
            .set("store:c1:bad", "{not json".to_string())
            .await
            .unwrap();
        let kv = KvBinding::new("c1", store);
        assert!(matches!(
            kv.get("bad").await.unwrap_err(),
            RotorError::Kv(_)
        ));
    }
}
