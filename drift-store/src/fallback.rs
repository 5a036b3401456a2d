//! Composite primary/secondary storage
//!
//! Reads try the primary and fall back to the secondary on error or
//! absence. Writes must succeed on the primary; they are then replicated
//! to the secondary on a best-effort basis only - a secondary failure is
//! logged and swallowed, never surfaced to the caller. Callers that need
//! guaranteed durability on both tiers must write to each directly.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::StorageAdapter;

/// Two-tier store: mandatory primary, best-effort secondary.
pub struct FallbackStore {
    primary: Arc<dyn StorageAdapter>,
    secondary: Arc<dyn StorageAdapter>,
}

impl FallbackStore {
    pub fn new(primary: Arc<dyn StorageAdapter>, secondary: Arc<dyn StorageAdapter>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl StorageAdapter for FallbackStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.primary.get(key).await {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => self.secondary.get(key).await,
            Err(e) => {
                warn!("Primary store read failed for {}: {}", key, e);
                self.secondary.get(key).await
            }
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.primary.set(key, value.clone()).await?;

        // Best-effort replication; the secondary catches up on later writes.
        if let Err(e) = self.secondary.set(key, value).await {
            warn!("Secondary store write failed for {}: {}", key, e);
        } else {
            debug!("Replicated {} to secondary store", key);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.primary.remove(key).await?;
        if let Err(e) = self.secondary.remove(key).await {
            warn!("Secondary store remove failed for {}: {}", key, e);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.primary.clear().await?;
        if let Err(e) = self.secondary.clear().await {
            warn!("Secondary store clear failed: {}", e);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = self.primary.keys().await?;
        match self.secondary.keys().await {
            Ok(extra) => {
                for key in extra {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
            Err(e) => warn!("Secondary store key listing failed: {}", e),
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::MemoryStore;
    use serde_json::json;

    /// Store that fails every operation, for exercising fallback paths.
    struct BrokenStore;

    #[async_trait]
    impl StorageAdapter for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Value>> {
            Err(StoreError::Backend("broken".to_string()))
        }
        async fn set(&self, _key: &str, _value: Value) -> Result<()> {
            Err(StoreError::Backend("broken".to_string()))
        }
        async fn remove(&self, _key: &str) -> Result<()> {
            Err(StoreError::Backend("broken".to_string()))
        }
        async fn clear(&self) -> Result<()> {
            Err(StoreError::Backend("broken".to_string()))
        }
        async fn keys(&self) -> Result<Vec<String>> {
            Err(StoreError::Backend("broken".to_string()))
        }
    }

    #[tokio::test]
    async fn test_read_falls_back_to_secondary() {
        let primary = Arc::new(MemoryStore::new());
        let secondary = Arc::new(MemoryStore::new());
        secondary.set("k", json!("old")).await.unwrap();

        let store = FallbackStore::new(primary, secondary);
        assert_eq!(store.get("k").await.unwrap(), Some(json!("old")));
    }

    #[tokio::test]
    async fn test_secondary_failure_is_swallowed_on_write() {
        let primary = Arc::new(MemoryStore::new());
        let store = FallbackStore::new(primary.clone(), Arc::new(BrokenStore));

        store.set("k", json!(1)).await.unwrap();
        assert_eq!(primary.get("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_primary_failure_propagates_on_write() {
        let store = FallbackStore::new(Arc::new(BrokenStore), Arc::new(MemoryStore::new()));
        assert!(store.set("k", json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_write_replicates_to_secondary() {
        let primary = Arc::new(MemoryStore::new());
        let secondary = Arc::new(MemoryStore::new());
        let store = FallbackStore::new(primary, secondary.clone());

        store.set("k", json!(2)).await.unwrap();
        assert_eq!(secondary.get("k").await.unwrap(), Some(json!(2)));
    }
}
