//! Error types for tunegate-state

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend connection error
    #[error("storage connection failed: {0}")]
    Connection(String),

    /// Backend query or write error
    #[error("storage query failed: {0}")]
    Query(String),

    /// Filesystem error
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization failed for key {key}: {reason}")]
    Deserialization { key: String, reason: String },

    /// Key is not representable by the backend
    #[error("invalid storage key: {key}")]
    InvalidKey { key: String },

    /// Blocking I/O task panicked or was cancelled
    #[error("storage task failed: {0}")]
    Task(String),

    /// Write rejected by a fault-injecting test store
    #[error("injected write failure for key {key}")]
    Injected { key: String },
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
