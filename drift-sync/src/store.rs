//! Session persistence over the storage adapter
//!
//! Wraps the durable key/value boundary with integrity stamping on save
//! and integrity verification on load, plus the copy-on-write cache. A
//! record that fails verification is treated as absent rather than
//! returned partially trusted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use drift_store::StorageAdapter;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cache::SessionCache;
use crate::errors::{Result, SyncError};
use crate::integrity;
use crate::model::SessionRecord;
use crate::scheduler::Clock;

pub const SESSION_KEY_PREFIX: &str = "session/";

fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, session_id)
}

/// Aggregate usage counters over the persisted sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub session_count: usize,
    pub total_bytes: u64,
    pub cached_sessions: usize,
}

pub struct SessionStore {
    adapter: Arc<dyn StorageAdapter>,
    cache: SessionCache,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(adapter: Arc<dyn StorageAdapter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            adapter,
            cache: SessionCache::new(),
            clock,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    /// Persist a record, restamping checksums and the sync timestamp.
    ///
    /// `last_sync_time` never moves backwards. The cache is updated only
    /// after the adapter write succeeded. Returns the record as persisted.
    pub async fn save(&self, mut record: SessionRecord) -> Result<SessionRecord> {
        record.last_sync_time = record.last_sync_time.max(self.clock.now());
        for mode in record.modes.values_mut() {
            mode.checksum = integrity::checksum(&mode.payload);
        }

        let value = serde_json::to_value(&record)?;
        self.adapter.set(&session_key(&record.session_id), value).await?;
        self.cache.insert(record.clone()).await;

        debug!("Persisted session {}", record.session_id);
        Ok(record)
    }

    /// Cache-first load. Corrupt persisted records are treated as absent.
    pub async fn load(&self, session_id: &str) -> Result<Option<Arc<SessionRecord>>> {
        if let Some(cached) = self.cache.get(session_id).await {
            return Ok(Some(cached));
        }

        match self.fetch(session_id).await? {
            Some(record) => {
                self.cache.insert(record.clone()).await;
                // The insert above stored a fresh Arc for this record.
                Ok(self.cache.get(session_id).await)
            }
            None => Ok(None),
        }
    }

    /// Adapter-direct validated load, bypassing the cache.
    ///
    /// Used for the freshly loaded remote copy during a sync pass.
    pub async fn fetch(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let Some(value) = self.adapter.get(&session_key(session_id)).await? else {
            return Ok(None);
        };

        let record: SessionRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                warn!("Unreadable record for session {}: {}", session_id, e);
                return Ok(None);
            }
        };

        if !integrity::validate_record(&record) {
            warn!(
                "Rejecting session {} - integrity validation failed",
                session_id
            );
            return Ok(None);
        }

        Ok(Some(record))
    }

    pub async fn remove(&self, session_id: &str) -> Result<()> {
        self.adapter.remove(&session_key(session_id)).await?;
        self.cache.evict(session_id).await;
        Ok(())
    }

    pub async fn evict_cached(&self, session_id: &str) {
        self.cache.evict(session_id).await;
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.len().await
    }

    /// Remove persisted sessions whose last sync predates `cutoff`.
    pub async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for key in self.adapter.keys().await? {
            let Some(session_id) = key.strip_prefix(SESSION_KEY_PREFIX) else {
                continue;
            };
            // Expiry is judged on the stored copy, not the cache.
            if let Some(record) = self.fetch(session_id).await? {
                if record.last_sync_time < cutoff {
                    self.remove(session_id).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("Cleaned up {} expired sessions", removed);
        }
        Ok(removed)
    }

    /// Count persisted sessions and their serialized footprint.
    ///
    /// Keys outside the session prefix (such as the offline queue backup)
    /// are not counted.
    pub async fn stats(&self) -> Result<StorageStats> {
        let mut session_count = 0;
        let mut total_bytes = 0u64;
        for key in self.adapter.keys().await? {
            if !key.starts_with(SESSION_KEY_PREFIX) {
                continue;
            }
            if let Some(value) = self.adapter.get(&key).await? {
                session_count += 1;
                total_bytes += serde_json::to_vec(&value)?.len() as u64;
            }
        }
        Ok(StorageStats {
            session_count,
            total_bytes,
            cached_sessions: self.cache.len().await,
        })
    }

    /// Bundle every session belonging to `owner_id` into one portable
    /// document. Records that fail integrity validation are skipped, the
    /// same as on load.
    pub async fn export_sessions(&self, owner_id: &str) -> Result<Value> {
        let mut sessions = Vec::new();
        for key in self.adapter.keys().await? {
            let Some(session_id) = key.strip_prefix(SESSION_KEY_PREFIX) else {
                continue;
            };
            if let Some(record) = self.fetch(session_id).await? {
                if record.owner_id == owner_id {
                    sessions.push(serde_json::to_value(&record)?);
                }
            }
        }
        info!("Exported {} sessions for {}", sessions.len(), owner_id);
        Ok(json!({
            "owner_id": owner_id,
            "exported_at": self.clock.now(),
            "sessions": sessions,
        }))
    }

    /// Restore sessions from an exported document.
    ///
    /// Each record goes through the normal save path, so checksums are
    /// restamped and the cache stays consistent. Returns the number of
    /// records imported; an unreadable record aborts the import.
    pub async fn import_sessions(&self, document: &Value) -> Result<usize> {
        let entries = document
            .get("sessions")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                SyncError::Corrupt("export document has no sessions array".to_string())
            })?;

        let mut imported = 0;
        for entry in entries {
            let record: SessionRecord = serde_json::from_value(entry.clone())?;
            self.save(record).await?;
            imported += 1;
        }
        info!("Imported {} sessions", imported);
        Ok(imported)
    }
}
