//! Tunegate-State: persistence layer for the enhancement validation engine.
//!
//! Everything the engine needs to survive a restart goes through the
//! [`KvStore`] interface: committed agent configurations, lifecycle records,
//! learned-pattern history and pending approval requests.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: durable, idempotent reads and atomic single-key writes.
//!
//! ## Backends
//!
//! - [`fakes::MemoryKvStore`]: in-process map, used by tests and demos
//! - [`fakes::FaultyKvStore`]: wrapper that injects write failures
//! - [`FsKvStore`]: one JSON file per key, written atomically
//! - [`SurrealKvStore`]: SurrealDB table (`mem://` or a remote endpoint)

mod error;
pub mod fakes;
mod fs_store;
pub mod keys;
pub mod kv;
mod surreal_store;

pub use error::StorageError;
pub use fs_store::FsKvStore;
pub use kv::{KvStore, KvStoreExt, StorageResult};
pub use surreal_store::{SurrealConfig, SurrealKvStore};
