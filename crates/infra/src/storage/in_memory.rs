use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::{KeyValueStore, StorageError};

/// In-memory key/value store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    inner: RwLock<BTreeMap<String, JsonValue>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StorageError {
    StorageError::Unavailable("lock poisoned".to_string())
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn write(&self, key: &str, value: JsonValue) -> Result<(), StorageError> {
        let mut map = self.inner.write().map_err(|_| poisoned())?;
        map.insert(key.to_string(), value);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<JsonValue>, StorageError> {
        let map = self.inner.read().map_err(|_| poisoned())?;
        Ok(map.get(key).cloned())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let map = self.inner.read().map_err(|_| poisoned())?;
        Ok(map
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut map = self.inner.write().map_err(|_| poisoned())?;
        Ok(map.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn lists_only_matching_prefix_in_order() {
        let store = InMemoryKeyValueStore::new();
        store.write("events/b/2", json!(2)).await.unwrap();
        store.write("events/a/1", json!(1)).await.unwrap();
        store.write("snapshots/a", json!(0)).await.unwrap();
        store.write("events/b/1", json!(3)).await.unwrap();

        let keys = store.list_keys("events/").await.unwrap();
        assert_eq!(keys, vec!["events/a/1", "events/b/1", "events/b/2"]);
        assert_eq!(store.list_keys("events/b/").await.unwrap().len(), 2);
        assert!(store.list_keys("nothing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_write_delete() {
        let store = InMemoryKeyValueStore::new();
        assert_eq!(store.read("k").await.unwrap(), None);
        store.write("k", json!({"v": 1})).await.unwrap();
        store.write("k", json!({"v": 2})).await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), Some(json!({"v": 2})));
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(store.is_empty());
    }
}
