//! State store trait and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_core::Result;
use tokio::sync::RwLock;

/// A stored value together with its write metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    /// The key for this entry (a resource FQN or scope data key).
    pub key: String,

    /// The stored document.
    pub value: serde_json::Value,

    /// Version number (monotonically increasing for the key).
    pub version: u64,

    /// Timestamp of the write that produced this entry.
    pub updated_at: DateTime<Utc>,
}

/// Trait for state stores.
///
/// `set` must be atomic per key: a concurrent reader sees either the old
/// document or the new one, never a partial write. A failing operation
/// must leave every other key untouched.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get the current entry for a key.
    async fn get(&self, key: &str) -> Result<Option<StateEntry>>;

    /// Replace the value for a key.
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<StateEntry>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Number of keys starting with `prefix`.
    async fn count(&self, prefix: &str) -> Result<usize> {
        Ok(self.list(prefix).await?.len())
    }
}

/// In-memory implementation of StateStore.
///
/// State lives for as long as the store does; share one instance (behind
/// an `Arc`) between runs to simulate persistence.
pub struct InMemoryStateStore {
    /// Main state storage: key -> current entry.
    state: Arc<RwLock<BTreeMap<String, StateEntry>>>,

    /// Global version counter.
    version: Arc<RwLock<u64>>,
}

impl InMemoryStateStore {
    /// Create a new in-memory state store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BTreeMap::new())),
            version: Arc::new(RwLock::new(0)),
        }
    }

    /// Get the next version number.
    async fn next_version(&self) -> u64 {
        let mut version = self.version.write().await;
        *version += 1;
        *version
    }

    /// Number of keys in the store.
    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.is_empty()
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<StateEntry>> {
        let state = self.state.read().await;
        Ok(state.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<StateEntry> {
        let mut state = self.state.write().await;
        let version = self.next_version().await;

        let entry = StateEntry {
            key: key.to_string(),
            value,
            version,
            updated_at: Utc::now(),
        };

        state.insert(key.to_string(), entry.clone());

        Ok(entry)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;

        let keys = state
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();

        Ok(keys)
    }

    async fn count(&self, prefix: &str) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = InMemoryStateStore::new();

        store
            .set("app/dev/bucket", serde_json::json!({"value": 42}))
            .await
            .unwrap();

        let entry = store.get("app/dev/bucket").await.unwrap();
        assert!(entry.is_some());
        assert_eq!(entry.unwrap().value["value"], 42);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryStateStore::new();

        store.set("key1", serde_json::json!("value")).await.unwrap();
        store.delete("key1").await.unwrap();
        store.delete("never-existed").await.unwrap();

        let entry = store.get("key1").await.unwrap();
        assert!(entry.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_versioning() {
        let store = InMemoryStateStore::new();

        let e1 = store.set("key1", serde_json::json!("v1")).await.unwrap();
        let e2 = store.set("key1", serde_json::json!("v2")).await.unwrap();

        assert!(e2.version > e1.version);

        let current = store.get("key1").await.unwrap().unwrap();
        assert_eq!(current.value, "v2");
    }

    #[tokio::test]
    async fn test_list_and_count_prefix() {
        let store = InMemoryStateStore::new();

        for key in ["app/dev/a", "app/dev/b", "app/dev/b/child", "app/devx/c", "app/prod/a"] {
            store.set(key, serde_json::json!(null)).await.unwrap();
        }

        let keys = store.list("app/dev/").await.unwrap();
        assert_eq!(keys, vec!["app/dev/a", "app/dev/b", "app/dev/b/child"]);
        assert_eq!(store.count("app/dev/").await.unwrap(), 3);
        assert_eq!(store.count("app/").await.unwrap(), 5);
        assert_eq!(store.count("nothing/").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shared_through_arc() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let other = store.clone();

        store.set("k", serde_json::json!(1)).await.unwrap();
        assert_eq!(other.get("k").await.unwrap().unwrap().value, 1);
    }
}
