//! Session record data model
//!
//! [`SessionRecord`] is the unit of synchronization: a per-session map of
//! named sub-records ([`ModeData`]) plus embedded progress metrics. Records
//! are value types - the persisted copy and any in-flight merge copy never
//! alias each other.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::integrity;

/// One named sub-record of a session (e.g. one training mode's state).
///
/// The checksum always covers the payload at rest; a stored mode whose
/// checksum no longer matches its payload is treated as corrupt and the
/// containing record is rejected on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeData {
    pub name: String,
    pub payload: Value,
    pub last_modified: DateTime<Utc>,
    pub version: u64,
    pub checksum: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ModeData {
    /// Create a fresh sub-record at version 1 with a valid checksum.
    pub fn new(name: impl Into<String>, payload: Value, timestamp: DateTime<Utc>) -> Self {
        let checksum = integrity::checksum(&payload);
        Self {
            name: name.into(),
            payload,
            last_modified: timestamp,
            version: 1,
            checksum,
            completed: false,
            completed_at: None,
        }
    }

    /// Replace the payload, bump the version and restamp the checksum.
    pub fn update_payload(&mut self, payload: Value, timestamp: DateTime<Utc>) {
        self.checksum = integrity::checksum(&payload);
        self.payload = payload;
        self.last_modified = timestamp;
        self.version += 1;
    }
}

/// Aggregated progress metrics embedded in a session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionMetrics {
    /// Overall completion percentage, 0-100.
    pub overall_completion: f64,
    /// Cumulative time spent across all sessions, in seconds.
    pub total_time_secs: u64,
    pub session_started_at: Option<DateTime<Utc>>,
    pub session_duration_secs: u64,
    pub actions_performed: u64,
}

/// Point-in-time progress snapshot, appended when a session ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub timestamp: DateTime<Utc>,
    pub overall_completion: f64,
    pub total_time_secs: u64,
    pub session_count: usize,
}

/// The unit of synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub owner_id: String,
    #[serde(default)]
    pub modes: HashMap<String, ModeData>,
    #[serde(default)]
    pub metrics: SessionMetrics,
    #[serde(default)]
    pub progress_history: Vec<ProgressSnapshot>,
    pub last_sync_time: DateTime<Utc>,
}

impl SessionRecord {
    /// Freshly initialized record for a session with no persisted state.
    pub fn new(
        session_id: impl Into<String>,
        owner_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            owner_id: owner_id.into(),
            modes: HashMap::new(),
            metrics: SessionMetrics::default(),
            progress_history: Vec::new(),
            last_sync_time: timestamp,
        }
    }

    pub fn mode(&self, name: &str) -> Option<&ModeData> {
        self.modes.get(name)
    }
}
