//! Copy-on-write cache of session records
//!
//! Readers get a shared `Arc` snapshot of a record; the orchestrator is
//! the sole writer and replaces whole entries only after a successful
//! persist, so a reader never observes a partially-updated record.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::SessionRecord;

#[derive(Debug, Default)]
pub struct SessionCache {
    entries: RwLock<HashMap<String, Arc<SessionRecord>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        self.entries.read().await.get(session_id).cloned()
    }

    /// Replace the cached record wholesale.
    pub async fn insert(&self, record: SessionRecord) {
        let mut entries = self.entries.write().await;
        entries.insert(record.session_id.clone(), Arc::new(record));
    }

    pub async fn evict(&self, session_id: &str) {
        self.entries.write().await.remove(session_id);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_snapshot_survives_replacement() {
        let cache = SessionCache::new();
        let t0 = Utc::now();
        cache.insert(SessionRecord::new("s1", "u1", t0)).await;

        let snapshot = cache.get("s1").await.unwrap();

        let mut updated = SessionRecord::new("s1", "u1", t0);
        updated.metrics.actions_performed = 5;
        cache.insert(updated).await;

        // The old snapshot is untouched; new readers see the replacement.
        assert_eq!(snapshot.metrics.actions_performed, 0);
        assert_eq!(
            cache.get("s1").await.unwrap().metrics.actions_performed,
            5
        );
    }

    #[tokio::test]
    async fn test_evict() {
        let cache = SessionCache::new();
        cache
            .insert(SessionRecord::new("s1", "u1", Utc::now()))
            .await;
        cache.evict("s1").await;
        assert!(cache.get("s1").await.is_none());
        assert_eq!(cache.len().await, 0);
    }
}
