//! Key-value storage interface for Tunegate
//!
//! The engine persists every durable object through [`KvStore`]:
//! - `put(key, value)` / `get(key)` for single records
//! - `list(prefix)` to rediscover records after a restart
//! - `compare_and_put` for optimistic-concurrency writes (versioned commits)
//!
//! All methods are async and backend-agnostic. Reads are idempotent: reading
//! the same key twice without an intervening write yields the same bytes.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Durable key-value store.
///
/// Guarantees:
/// - `put` replaces the value atomically; a reader never observes a torn value.
/// - `get` returns `None` for absent keys rather than an error.
/// - `list(prefix)` returns matching keys sorted ascending.
/// - `compare_and_put` writes only if the current value equals `expected`
///   (`None` meaning "absent") and reports whether the write happened.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Remove `key`. No-op if absent.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List all keys starting with `prefix`, sorted ascending.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Atomically replace the value under `key` if it currently equals `expected`.
    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> StorageResult<bool>;
}

/// Typed JSON helpers over any [`KvStore`].
#[async_trait]
pub trait KvStoreExt: KvStore {
    /// Serialize `value` as JSON and store it under `key`.
    async fn put_json<V>(&self, key: &str, value: &V) -> StorageResult<()>
    where
        V: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, bytes).await
    }

    /// Fetch and deserialize the JSON value under `key`.
    async fn get_json<V>(&self, key: &str) -> StorageResult<Option<V>>
    where
        V: DeserializeOwned,
    {
        match self.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                StorageError::Deserialization {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
            }),
            None => Ok(None),
        }
    }
}

impl<T: KvStore + ?Sized> KvStoreExt for T {}
