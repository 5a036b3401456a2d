//! Durable key/value storage adapters for the drift sync engine
//!
//! The sync engine treats its persistence layer as an opaque durable map.
//! This crate defines that boundary ([`StorageAdapter`]) and ships three
//! backends:
//! - [`MemoryStore`] - in-process map, used as the fast path and in tests
//! - [`FileStore`] - one JSON document per key, atomic writes
//! - [`FallbackStore`] - primary/secondary composite with best-effort
//!   replication to the secondary

pub mod errors;
pub mod fallback;
pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

pub use errors::{Result, StoreError};
pub use fallback::FallbackStore;
pub use file::FileStore;
pub use memory::MemoryStore;

/// Durable key/value store boundary.
///
/// The engine only requires eventual durability of `set` and tolerates
/// `get` returning stale data; staleness is reconciled upstream by the
/// conflict resolver. Transactions are not required.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Fetch a value, `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Durably associate a value with a key, replacing any previous value.
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every key.
    async fn clear(&self) -> Result<()>;

    /// Enumerate all keys, in no particular order.
    async fn keys(&self) -> Result<Vec<String>>;
}
