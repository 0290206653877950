//! SurrealDB-backed key-value store.
//!
//! Values are kept in a single `kv` table as hex strings. Writes are
//! serialized through an in-process lock so `compare_and_put` is atomic for
//! every engine sharing this handle.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::kv::{KvStore, StorageResult};

/// Connection settings for [`SurrealKvStore`].
#[derive(Debug, Clone)]
pub struct SurrealConfig {
    /// Endpoint URL (`mem://`, `surrealkv://path`, `ws://host:port`)
    pub url: String,
    /// Namespace (default: "tunegate")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
}

impl Default for SurrealConfig {
    fn default() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "tunegate".to_string(),
            database: "main".to_string(),
        }
    }
}

impl SurrealConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvRow {
    key: String,
    value: String,
    updated_at: SurrealDatetime,
}

#[derive(Debug, Deserialize)]
struct KeyRow {
    key: String,
}

#[derive(Debug, Deserialize)]
struct ValueRow {
    value: String,
}

/// Key-value store over a SurrealDB `kv` table.
pub struct SurrealKvStore {
    db: Surreal<Any>,
    write_lock: Mutex<()>,
}

impl SurrealKvStore {
    /// Connect to an in-memory database.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect(SurrealConfig::default()).await
    }

    /// Connect using `config` and make sure the `kv` table exists.
    #[instrument(skip(config), fields(url = %config.url, namespace = %config.namespace))]
    pub async fn connect(config: SurrealConfig) -> StorageResult<Self> {
        info!("Connecting to SurrealDB key-value store");

        let db = surrealdb::engine::any::connect(config.url.as_str())
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to connect to {}: {}", config.url, e))
            })?;

        db.use_ns(config.namespace.as_str())
            .use_db(config.database.as_str())
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to select namespace/database: {}", e))
            })?;

        let store = Self {
            db,
            write_lock: Mutex::new(()),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StorageResult<()> {
        debug!("Initializing kv schema");
        let schema = r#"
            DEFINE TABLE IF NOT EXISTS kv SCHEMAFULL;
            DEFINE FIELD IF NOT EXISTS key ON kv TYPE string;
            DEFINE FIELD IF NOT EXISTS value ON kv TYPE string;
            DEFINE FIELD IF NOT EXISTS updated_at ON kv TYPE datetime;
            DEFINE INDEX IF NOT EXISTS idx_kv_key ON kv FIELDS key UNIQUE;
        "#;
        self.db.query(schema).await?.check()?;
        Ok(())
    }

    async fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let key_owned = key.to_string();
        let mut result = self
            .db
            .query("SELECT value FROM kv WHERE key = $key")
            .bind(("key", key_owned))
            .await?;
        let rows: Vec<ValueRow> = result.take(0)?;
        match rows.into_iter().next() {
            Some(row) => hex::decode(&row.value)
                .map(Some)
                .map_err(|e| StorageError::Deserialization {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let key_owned = key.to_string();
        self.db
            .query("DELETE FROM kv WHERE key = $key")
            .bind(("key", key_owned.clone()))
            .await?
            .check()?;

        let row = KvRow {
            key: key_owned,
            value: hex::encode(value),
            updated_at: SurrealDatetime::from(Utc::now()),
        };
        let _created: Option<KvRow> = self.db.create("kv").content(row).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SurrealKvStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write(key, &value).await?;
        debug!(key = %key, bytes = value.len(), "surreal store put");
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.read(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let key_owned = key.to_string();
        self.db
            .query("DELETE FROM kv WHERE key = $key")
            .bind(("key", key_owned))
            .await?
            .check()?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let prefix_owned = prefix.to_string();
        let mut result = self
            .db
            .query("SELECT key FROM kv WHERE string::starts_with(key, $prefix)")
            .bind(("prefix", prefix_owned))
            .await?;
        let rows: Vec<KeyRow> = result.take(0)?;
        let mut keys: Vec<String> = rows.into_iter().map(|r| r.key).collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> StorageResult<bool> {
        let _guard = self.write_lock.lock().await;
        let current = self.read(key).await?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        self.write(key, &value).await?;
        Ok(true)
    }
}
