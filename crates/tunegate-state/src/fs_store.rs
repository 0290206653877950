use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StorageError;
use crate::kv::{KvStore, StorageResult};

const VALUE_EXT: &str = "val";

/// Filesystem-backed key-value store.
///
/// Layout: `<root>/<key segments...>.val`, so `proposals/p-1` lives at
/// `<root>/proposals/p-1.val`. Every write goes to a temp file in the target
/// directory and is renamed into place, so a crash never leaves a torn value.
///
/// File I/O and the write lock run on tokio's blocking pool; async callers
/// only await the result.
#[derive(Clone)]
pub struct FsKvStore {
    inner: Arc<FsInner>,
}

struct FsInner {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsKvStore {
    /// Create a new `FsKvStore` rooted at `root`. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            inner: Arc::new(FsInner {
                root,
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Run `op` against the store on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> StorageResult<T>
    where
        F: FnOnce(&FsInner) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

impl FsInner {
    fn value_path(&self, key: &str) -> StorageResult<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('/')
            && key
                .split('/')
                .all(|seg| !seg.is_empty() && seg != "." && seg != ".." && !seg.contains('\\'));
        if !valid {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(format!("{key}.{VALUE_EXT}")))
    }

    fn write_atomic(&self, path: &Path, value: &[u8]) -> StorageResult<()> {
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(value)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn read(&self, path: &Path) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn writer(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> StorageResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::Io(e)),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.collect_keys(&path, out)?;
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXT) {
                continue;
            }
            let Ok(rel) = path.with_extension("").strip_prefix(&self.root).map(Path::to_path_buf)
            else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push(key);
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FsKvStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        let owned = key.to_string();
        let bytes = value.len();
        self.blocking(move |store| {
            let path = store.value_path(&owned)?;
            let _guard = store.writer();
            store.write_atomic(&path, &value)
        })
        .await?;
        debug!(key = %key, bytes, "fs store put");
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.blocking(move |store| store.read(&store.value_path(&key)?)).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let key = key.to_string();
        self.blocking(move |store| {
            let path = store.value_path(&key)?;
            let _guard = store.writer();
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::Io(e)),
            }
        })
        .await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let prefix = prefix.to_string();
        self.blocking(move |store| {
            let mut keys = Vec::new();
            store.collect_keys(&store.root, &mut keys)?;
            keys.retain(|k| k.starts_with(&prefix));
            keys.sort();
            Ok(keys)
        })
        .await
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> StorageResult<bool> {
        let key = key.to_string();
        let expected = expected.map(<[u8]>::to_vec);
        self.blocking(move |store| {
            let path = store.value_path(&key)?;
            let _guard = store.writer();
            if store.read(&path)? != expected {
                return Ok(false);
            }
            store.write_atomic(&path, &value)?;
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsKvStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsKvStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn value_survives_reopen() {
        let (dir, store) = make_store();
        store.put("proposals/p-1", b"{}".to_vec()).await.unwrap();
        drop(store);

        let reopened = FsKvStore::new(dir.path()).unwrap();
        assert_eq!(
            reopened.get("proposals/p-1").await.unwrap(),
            Some(b"{}".to_vec())
        );
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let (_dir, store) = make_store();
        assert_eq!(store.get("agents/none/config").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let (_dir, store) = make_store();
        for key in ["../escape", "/abs", "a//b", "a/./b", ""] {
            let err = store.put(key, vec![1]).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey { .. }), "{key}");
        }
    }

    #[tokio::test]
    async fn list_returns_nested_keys_sorted() {
        let (_dir, store) = make_store();
        store.put("agents/a/versions/2", vec![2]).await.unwrap();
        store.put("agents/a/versions/1", vec![1]).await.unwrap();
        store.put("agents/a/config", vec![0]).await.unwrap();
        store.put("proposals/p", vec![9]).await.unwrap();

        let keys = store.list("agents/a/versions/").await.unwrap();
        assert_eq!(keys, vec!["agents/a/versions/1", "agents/a/versions/2"]);
    }

    #[tokio::test]
    async fn compare_and_put_detects_conflict() {
        let (_dir, store) = make_store();
        assert!(store.compare_and_put("k", None, vec![1]).await.unwrap());
        assert!(!store
            .compare_and_put("k", Some(&[9u8][..]), vec![2])
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(vec![1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_compare_and_put_has_one_winner() {
        let (_dir, store) = make_store();
        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.compare_and_put("agents/a/config", None, vec![i]).await
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.list("agents/").await.unwrap(), vec!["agents/a/config"]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = make_store();
        store.put("k", vec![1]).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
