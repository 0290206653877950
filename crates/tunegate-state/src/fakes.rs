//! In-memory stores (testing and demos)
//!
//! Provides `MemoryKvStore`, which satisfies the [`KvStore`] contract without
//! any external dependencies, and `FaultyKvStore`, a wrapper that rejects
//! writes on demand so persistence-failure paths can be exercised.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::kv::{KvStore, StorageResult};

// ---------------------------------------------------------------------------
// MemoryKvStore
// ---------------------------------------------------------------------------

/// In-memory store backed by a `BTreeMap<key, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let entries = self.lock();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> StorageResult<bool> {
        let mut entries = self.lock();
        if entries.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// FaultyKvStore
// ---------------------------------------------------------------------------

/// Wrapper that fails writes whose key starts with an armed prefix.
///
/// Reads always pass through, so a test can break durability of one namespace
/// (e.g. agent configurations) while lifecycle records keep working.
pub struct FaultyKvStore {
    inner: Arc<dyn KvStore>,
    failing_prefixes: Mutex<Vec<String>>,
}

impl FaultyKvStore {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self {
            inner,
            failing_prefixes: Mutex::new(Vec::new()),
        }
    }

    /// Fail every subsequent write to keys starting with `prefix`.
    pub fn fail_writes_matching(&self, prefix: impl Into<String>) {
        self.prefixes().push(prefix.into());
    }

    /// Fail every subsequent write.
    pub fn fail_all_writes(&self) {
        self.fail_writes_matching("");
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        self.prefixes().clear();
    }

    fn prefixes(&self) -> MutexGuard<'_, Vec<String>> {
        self.failing_prefixes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, key: &str) -> StorageResult<()> {
        if self.prefixes().iter().any(|p| key.starts_with(p.as_str())) {
            return Err(StorageError::Injected {
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FaultyKvStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.check(key)?;
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.check(key)?;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> StorageResult<bool> {
        self.check(key)?;
        self.inner.compare_and_put(key, expected, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_is_prefix_scoped_and_sorted() {
        let store = MemoryKvStore::new();
        store.put("b/2", vec![2]).await.unwrap();
        store.put("a/1", vec![1]).await.unwrap();
        store.put("b/1", vec![1]).await.unwrap();
        store.put("c", vec![3]).await.unwrap();

        let keys = store.list("b/").await.unwrap();
        assert_eq!(keys, vec!["b/1".to_string(), "b/2".to_string()]);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_compare_and_put_absent_then_present() {
        let store = MemoryKvStore::new();
        assert!(store.compare_and_put("k", None, vec![1]).await.unwrap());
        assert!(!store.compare_and_put("k", None, vec![2]).await.unwrap());
        assert!(store
            .compare_and_put("k", Some(&[1u8][..]), vec![3])
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(vec![3]));
    }

    #[tokio::test]
    async fn test_faulty_store_only_fails_armed_prefix() {
        let inner: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = FaultyKvStore::new(inner);
        store.fail_writes_matching("agents/");

        let err = store.put("agents/a/config", vec![1]).await.unwrap_err();
        assert!(matches!(err, StorageError::Injected { .. }));
        store.put("proposals/p", vec![1]).await.unwrap();

        store.heal();
        store.put("agents/a/config", vec![1]).await.unwrap();
        assert_eq!(store.get("agents/a/config").await.unwrap(), Some(vec![1]));
    }
}
