//! Durable key/value boundary used by the event log, the snapshot store and the bus.
//!
//! The core does not prescribe a storage engine. Anything that can write, read, list
//! by prefix and delete JSON documents can back it; `InMemoryKeyValueStore` is the
//! implementation for tests/dev.

pub mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use in_memory::InMemoryKeyValueStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("storage I/O failed: {0}")]
    Io(String),

    /// A document could not be encoded for, or decoded from, the store.
    #[error("storage document encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Injected persistence collaborator.
///
/// `list_keys` returns keys in ascending lexicographic order; callers rely on this to
/// read zero-padded sequences in order.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn write(&self, key: &str, value: JsonValue) -> Result<(), StorageError>;

    async fn read(&self, key: &str) -> Result<Option<JsonValue>, StorageError>;

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
}

#[async_trait]
impl<S> KeyValueStore for Arc<S>
where
    S: KeyValueStore + ?Sized,
{
    async fn write(&self, key: &str, value: JsonValue) -> Result<(), StorageError> {
        (**self).write(key, value).await
    }

    async fn read(&self, key: &str) -> Result<Option<JsonValue>, StorageError> {
        (**self).read(key).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        (**self).list_keys(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        (**self).delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(raw: &str) -> Result<JsonValue, StorageError> {
        Ok(serde_json::from_str(raw)?)
    }

    #[test]
    fn encoding_failures_are_reported_as_serialization() {
        let err = decode("{\"truncated\": ").unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
        assert!(err.to_string().starts_with("storage document encoding failed"));
    }
}
