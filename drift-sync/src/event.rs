//! Sync events and the pending-event queue
//!
//! Events are immutable facts describing a change, strongly typed per
//! kind. The queue keeps them in arrival order, groups them per session
//! for batched replay, and can spill to the persistent store while
//! offline so a restart does not lose pending changes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use drift_store::StorageAdapter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::{Result, SyncError};

/// Reserved store key holding the serialized queue while offline.
pub const QUEUE_BACKUP_KEY: &str = "sync/queue-backup";

/// What happened, with a strongly-typed payload per kind.
///
/// `Unknown` exists for forward compatibility: a backup written by a newer
/// version deserializes to it and is skipped at application time instead
/// of failing the whole restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    DataChanged { mode: String, changes: Value },
    ModeCompleted { mode: String, results: Value },
    SessionStarted,
    SessionEnded {
        duration_secs: u64,
        final_metrics: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

impl EventKind {
    /// Stable name used for subscriber filtering.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::DataChanged { .. } => "data_changed",
            EventKind::ModeCompleted { .. } => "mode_completed",
            EventKind::SessionStarted => "session_started",
            EventKind::SessionEnded { .. } => "session_ended",
            EventKind::Unknown => "unknown",
        }
    }
}

/// Immutable change fact emitted by collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub source: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SyncEvent {
    pub fn new(
        source: impl Into<String>,
        session_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        kind: EventKind,
    ) -> Self {
        Self {
            source: source.into(),
            session_id: session_id.into(),
            timestamp,
            kind,
        }
    }

    /// Structural well-formedness: enumerated kind, non-empty identifiers.
    pub fn validate(&self) -> Result<()> {
        if self.source.is_empty() {
            return Err(SyncError::InvalidEvent("empty source".to_string()));
        }
        if self.session_id.is_empty() {
            return Err(SyncError::InvalidEvent("empty session id".to_string()));
        }
        if matches!(self.kind, EventKind::Unknown) {
            return Err(SyncError::InvalidEvent(
                "unrecognized event kind".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ordered pending-event queue, FIFO per session.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Vec<SyncEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and append. Malformed events never enter the queue.
    pub fn enqueue(&mut self, event: SyncEvent) -> Result<()> {
        event.validate()?;
        debug!(
            "Queued {} event for session {}",
            event.kind.name(),
            event.session_id
        );
        self.events.push(event);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop every pending event, including any spilled backup, so a
    /// later restore cannot resurrect them.
    pub async fn clear(&mut self, store: &Arc<dyn StorageAdapter>) -> Result<()> {
        self.events.clear();
        store.remove(QUEUE_BACKUP_KEY).await?;
        Ok(())
    }

    /// Snapshot of all pending events in arrival order.
    pub fn snapshot(&self) -> Vec<SyncEvent> {
        self.events.clone()
    }

    /// Group pending events by session, preserving arrival order within
    /// each group. No ordering guarantee exists across sessions.
    pub fn group_by_session(&self) -> HashMap<String, Vec<SyncEvent>> {
        let mut grouped: HashMap<String, Vec<SyncEvent>> = HashMap::new();
        for event in &self.events {
            grouped
                .entry(event.session_id.clone())
                .or_default()
                .push(event.clone());
        }
        grouped
    }

    /// Remove the first `count` events belonging to `session_id`.
    ///
    /// Called after a session's batch was applied successfully; events that
    /// arrived after the batch was snapshotted stay queued.
    pub fn remove_applied(&mut self, session_id: &str, count: usize) {
        let mut remaining = count;
        self.events.retain(|event| {
            if remaining > 0 && event.session_id == session_id {
                remaining -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Spill the queue to the store under the reserved backup key.
    ///
    /// Leaves the in-memory queue untouched; events are only dropped once
    /// they have been applied.
    pub async fn persist_offline(&self, store: &Arc<dyn StorageAdapter>) -> Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }
        let value = serde_json::to_value(&self.events)?;
        store.set(QUEUE_BACKUP_KEY, value).await?;
        info!("Persisted {} pending events offline", self.events.len());
        Ok(())
    }

    /// Merge any persisted backup into the in-memory queue.
    ///
    /// Events still present in memory are not re-added, and the backup key
    /// is removed immediately after merging, so restoring twice cannot
    /// duplicate events.
    pub async fn restore_offline(&mut self, store: &Arc<dyn StorageAdapter>) -> Result<usize> {
        let Some(value) = store.get(QUEUE_BACKUP_KEY).await? else {
            return Ok(0);
        };

        let restored: Vec<SyncEvent> = match serde_json::from_value(value) {
            Ok(events) => events,
            Err(e) => {
                warn!("Discarding unreadable queue backup: {}", e);
                store.remove(QUEUE_BACKUP_KEY).await?;
                return Ok(0);
            }
        };

        let mut count = 0;
        for event in restored {
            if !self.events.contains(&event) {
                self.events.push(event);
                count += 1;
            }
        }
        store.remove(QUEUE_BACKUP_KEY).await?;

        if count > 0 {
            info!("Restored {} pending events from offline backup", count);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_store::MemoryStore;
    use serde_json::json;

    fn event(session: &str, n: u64) -> SyncEvent {
        SyncEvent::new(
            "test",
            session,
            Utc::now(),
            EventKind::DataChanged {
                mode: "chat".to_string(),
                changes: json!({ "count": n }),
            },
        )
    }

    #[test]
    fn test_invalid_events_are_rejected() {
        let mut queue = EventQueue::new();

        let mut bad = event("s1", 1);
        bad.source = String::new();
        assert!(matches!(
            queue.enqueue(bad),
            Err(SyncError::InvalidEvent(_))
        ));

        let mut bad = event("", 1);
        bad.session_id = String::new();
        assert!(queue.enqueue(bad).is_err());

        let unknown = SyncEvent::new("test", "s1", Utc::now(), EventKind::Unknown);
        assert!(queue.enqueue(unknown).is_err());

        assert!(queue.is_empty());
    }

    #[test]
    fn test_grouping_preserves_per_session_order() {
        let mut queue = EventQueue::new();
        queue.enqueue(event("s1", 1)).unwrap();
        queue.enqueue(event("s2", 10)).unwrap();
        queue.enqueue(event("s1", 2)).unwrap();
        queue.enqueue(event("s1", 3)).unwrap();

        let grouped = queue.group_by_session();
        let s1: Vec<_> = grouped["s1"]
            .iter()
            .map(|e| match &e.kind {
                EventKind::DataChanged { changes, .. } => changes["count"].as_u64().unwrap(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(s1, vec![1, 2, 3]);
        assert_eq!(grouped["s2"].len(), 1);
    }

    #[test]
    fn test_remove_applied_keeps_late_arrivals() {
        let mut queue = EventQueue::new();
        queue.enqueue(event("s1", 1)).unwrap();
        queue.enqueue(event("s1", 2)).unwrap();
        // A third event arrives after the batch of two was snapshotted.
        queue.enqueue(event("s1", 3)).unwrap();

        queue.remove_applied("s1", 2);
        assert_eq!(queue.len(), 1);
        match &queue.snapshot()[0].kind {
            EventKind::DataChanged { changes, .. } => {
                assert_eq!(changes["count"], 3);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_offline_persist_restore_no_duplicates() {
        let store: Arc<dyn StorageAdapter> = Arc::new(MemoryStore::new());

        let mut queue = EventQueue::new();
        queue.enqueue(event("s1", 1)).unwrap();
        queue.enqueue(event("s2", 2)).unwrap();
        queue.enqueue(event("s1", 3)).unwrap();
        let original = queue.snapshot();

        queue.persist_offline(&store).await.unwrap();

        // Simulate restart: fresh queue restored from the backup.
        let mut restored = EventQueue::new();
        assert_eq!(restored.restore_offline(&store).await.unwrap(), 3);
        assert_eq!(restored.snapshot(), original);

        // Backup key is gone; a second restore is a no-op.
        assert_eq!(restored.restore_offline(&store).await.unwrap(), 0);
        assert_eq!(restored.len(), 3);
    }

    #[tokio::test]
    async fn test_restore_skips_events_still_in_memory() {
        let store: Arc<dyn StorageAdapter> = Arc::new(MemoryStore::new());

        // Spilled while offline, then restored without a restart: the
        // queue still holds the same events in memory.
        let mut queue = EventQueue::new();
        queue.enqueue(event("s1", 1)).unwrap();
        queue.enqueue(event("s1", 2)).unwrap();
        queue.persist_offline(&store).await.unwrap();

        assert_eq!(queue.restore_offline(&store).await.unwrap(), 0);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_removes_spilled_backup() {
        let store: Arc<dyn StorageAdapter> = Arc::new(MemoryStore::new());

        let mut queue = EventQueue::new();
        queue.enqueue(event("s1", 1)).unwrap();
        queue.persist_offline(&store).await.unwrap();

        queue.clear(&store).await.unwrap();
        assert!(queue.is_empty());
        assert!(store.get(QUEUE_BACKUP_KEY).await.unwrap().is_none());

        // Nothing comes back after a clear.
        assert_eq!(queue.restore_offline(&store).await.unwrap(), 0);
    }

    #[test]
    fn test_event_kind_serde_tagging() {
        let event = event("s1", 1);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "data_changed");
        assert_eq!(json["mode"], "chat");

        let back: SyncEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_unknown_kind_deserializes_for_forward_compat() {
        let json = json!({
            "source": "future",
            "session_id": "s1",
            "timestamp": Utc::now(),
            "type": "holographic_sync"
        });
        let event: SyncEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.kind, EventKind::Unknown);
    }
}
