//! Conflict detection and resolution
//!
//! Given a local record (authoritative in-memory state) and a remote
//! record (last persisted copy, possibly newer if another writer got
//! there first), the resolver produces a single reconciled record plus a
//! list of the conflicts it resolved. Reconciliation is pure and
//! idempotent: re-merging the output with either input changes nothing.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::integrity;
use crate::model::{ModeData, SessionRecord};

/// Resolution strategy for a conflicting sub-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Keep the local sub-record wholesale.
    LocalWins,
    /// Take the remote sub-record wholesale.
    RemoteWins,
    /// Field-level union of both payloads.
    Merge,
}

/// Default strategy plus per-mode overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionPolicy {
    pub default: MergeStrategy,
    #[serde(default)]
    pub overrides: HashMap<String, MergeStrategy>,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self {
            default: MergeStrategy::Merge,
            overrides: HashMap::new(),
        }
    }
}

impl ResolutionPolicy {
    pub fn strategy_for(&self, mode: &str) -> MergeStrategy {
        self.overrides.get(mode).copied().unwrap_or(self.default)
    }
}

/// Why two copies of a sub-record diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Local and remote claim different versions.
    VersionMismatch,
    /// Same version claims, divergent content - indicates a write race.
    ContentDivergence,
}

/// Record of one resolved conflict, kept for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedConflict {
    pub mode: String,
    pub kind: ConflictKind,
    pub strategy: MergeStrategy,
    pub local_version: u64,
    pub remote_version: u64,
}

/// Whole-record rule-based merger. Not a CRDT: coarse-grained,
/// last-writer-and-rule-based only.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policy: ResolutionPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ResolutionPolicy) -> Self {
        Self { policy }
    }

    pub fn set_policy(&mut self, policy: ResolutionPolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> &ResolutionPolicy {
        &self.policy
    }

    /// Reconcile a local and a remote copy of the same session.
    pub fn reconcile(
        &self,
        local: &SessionRecord,
        remote: &SessionRecord,
    ) -> (SessionRecord, Vec<ResolvedConflict>) {
        // Fast path: remote is not newer, local wins trivially.
        if remote.last_sync_time <= local.last_sync_time {
            return (local.clone(), Vec::new());
        }

        let mut merged = local.clone();
        let mut conflicts = Vec::new();

        let mode_names: HashSet<&String> =
            local.modes.keys().chain(remote.modes.keys()).collect();

        for name in mode_names {
            match (local.modes.get(name), remote.modes.get(name)) {
                (Some(l), Some(r)) => {
                    let kind = if l.version != r.version {
                        Some(ConflictKind::VersionMismatch)
                    } else if l.checksum != r.checksum {
                        Some(ConflictKind::ContentDivergence)
                    } else {
                        None
                    };

                    if let Some(kind) = kind {
                        let strategy = self.policy.strategy_for(name);
                        debug!(
                            "Resolving {:?} on mode {} with {:?}",
                            kind, name, strategy
                        );
                        merged
                            .modes
                            .insert(name.clone(), resolve_mode(l, r, strategy));
                        conflicts.push(ResolvedConflict {
                            mode: name.clone(),
                            kind,
                            strategy,
                            local_version: l.version,
                            remote_version: r.version,
                        });
                    }
                }
                // Remote-only modes are adopted as-is; local-only stay.
                (None, Some(r)) => {
                    merged.modes.insert(name.clone(), r.clone());
                }
                (Some(_), None) | (None, None) => {}
            }
        }

        merge_metrics(&mut merged, remote);
        if remote.progress_history.len() > merged.progress_history.len() {
            merged.progress_history = remote.progress_history.clone();
        }
        merged.last_sync_time = merged.last_sync_time.max(remote.last_sync_time);

        (merged, conflicts)
    }
}

/// Resolve one conflicting sub-record. The resulting version is
/// `max(local, remote)` regardless of which payload is kept, so later
/// comparisons stay consistent.
fn resolve_mode(local: &ModeData, remote: &ModeData, strategy: MergeStrategy) -> ModeData {
    let version = local.version.max(remote.version);
    match strategy {
        MergeStrategy::LocalWins => ModeData {
            version,
            ..local.clone()
        },
        MergeStrategy::RemoteWins => ModeData {
            version,
            ..remote.clone()
        },
        MergeStrategy::Merge => {
            let payload = merge_payloads(&local.payload, &remote.payload);
            let checksum = integrity::checksum(&payload);
            ModeData {
                name: local.name.clone(),
                payload,
                last_modified: local.last_modified.max(remote.last_modified),
                version,
                checksum,
                completed: local.completed || remote.completed,
                completed_at: match (local.completed_at, remote.completed_at) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                },
            }
        }
    }
}

/// Shallow union of two payloads. Local fields win on collision, except
/// fields numeric on both sides, which take the maximum - progress never
/// regresses.
pub fn merge_payloads(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => {
            let mut out = l.clone();
            for (key, remote_value) in r {
                match out.get(key) {
                    Some(local_value) => {
                        if let Some(max) = numeric_max(local_value, remote_value) {
                            out.insert(key.clone(), max);
                        }
                        // Non-numeric collision: local wins, leave as-is.
                    }
                    None => {
                        out.insert(key.clone(), remote_value.clone());
                    }
                }
            }
            Value::Object(out)
        }
        _ => numeric_max(local, remote).unwrap_or_else(|| local.clone()),
    }
}

/// Overlay `changes` on top of `base`: changed fields win outright.
/// Used when applying a `data_changed` event to the working copy.
pub fn overlay_changes(base: &Value, changes: &Value) -> Value {
    match (base, changes) {
        (Value::Object(b), Value::Object(c)) => {
            let mut out = b.clone();
            for (key, value) in c {
                out.insert(key.clone(), value.clone());
            }
            Value::Object(out)
        }
        _ => changes.clone(),
    }
}

fn numeric_max(a: &Value, b: &Value) -> Option<Value> {
    let (na, nb) = (a.as_f64()?, b.as_f64()?);
    Some(if nb > na { b.clone() } else { a.clone() })
}

fn merge_metrics(merged: &mut SessionRecord, remote: &SessionRecord) {
    let m = &mut merged.metrics;
    let r = &remote.metrics;
    m.overall_completion = m.overall_completion.max(r.overall_completion);
    m.total_time_secs = m.total_time_secs.max(r.total_time_secs);
    m.actions_performed = m.actions_performed.max(r.actions_performed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn record_with_mode(
        session: &str,
        mode: &str,
        payload: Value,
        version: u64,
        sync_offset_secs: i64,
    ) -> SessionRecord {
        let base = Utc::now();
        let mut record = SessionRecord::new(session, "user-1", base);
        record.last_sync_time = base + Duration::seconds(sync_offset_secs);
        let mut data = ModeData::new(mode, payload, base);
        data.version = version;
        record.modes.insert(mode.to_string(), data);
        record
    }

    #[test]
    fn test_fast_path_when_remote_not_newer() {
        let resolver = ConflictResolver::default();
        let local = record_with_mode("s1", "chat", json!({"n": 5}), 3, 10);
        let remote = record_with_mode("s1", "chat", json!({"n": 1}), 1, 0);

        let (merged, conflicts) = resolver.reconcile(&local, &remote);
        assert_eq!(merged, local);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_version_mismatch_detected_and_version_maxed() {
        let resolver = ConflictResolver::default();
        let local = record_with_mode("s1", "chat", json!({"a": 1}), 2, 0);
        let remote = record_with_mode("s1", "chat", json!({"b": 2}), 5, 10);

        let (merged, conflicts) = resolver.reconcile(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::VersionMismatch);

        let mode = merged.mode("chat").unwrap();
        assert_eq!(mode.version, 5);
        assert_eq!(mode.payload, json!({"a": 1, "b": 2}));
        assert!(integrity::verify(&mode.payload, &mode.checksum));
    }

    #[test]
    fn test_content_divergence_same_version() {
        let resolver = ConflictResolver::default();
        let local = record_with_mode("s1", "chat", json!({"text": "mine"}), 3, 0);
        let remote = record_with_mode("s1", "chat", json!({"text": "theirs"}), 3, 10);

        let (merged, conflicts) = resolver.reconcile(&local, &remote);
        assert_eq!(conflicts[0].kind, ConflictKind::ContentDivergence);
        // Local field wins the non-numeric collision.
        assert_eq!(merged.mode("chat").unwrap().payload["text"], "mine");
    }

    #[test]
    fn test_progress_never_regresses_under_merge() {
        let resolver = ConflictResolver::default();
        let local = record_with_mode("s1", "workshop", json!({"progress": 40}), 1, 0);
        let remote = record_with_mode("s1", "workshop", json!({"progress": 55}), 2, 10);

        let (merged, _) = resolver.reconcile(&local, &remote);
        assert_eq!(merged.mode("workshop").unwrap().payload["progress"], 55);
    }

    #[test]
    fn test_per_mode_override_beats_default() {
        let mut overrides = HashMap::new();
        overrides.insert("prefs".to_string(), MergeStrategy::LocalWins);
        let resolver = ConflictResolver::new(ResolutionPolicy {
            default: MergeStrategy::RemoteWins,
            overrides,
        });

        let mut local = record_with_mode("s1", "prefs", json!({"theme": "dark"}), 1, 0);
        let base = Utc::now();
        local.modes.insert(
            "chat".to_string(),
            ModeData::new("chat", json!({"text": "local"}), base),
        );

        let mut remote = record_with_mode("s1", "prefs", json!({"theme": "light"}), 2, 10);
        let mut remote_chat = ModeData::new("chat", json!({"text": "remote"}), base);
        remote_chat.version = 2;
        remote.modes.insert("chat".to_string(), remote_chat);

        let (merged, conflicts) = resolver.reconcile(&local, &remote);
        assert_eq!(conflicts.len(), 2);
        assert_eq!(merged.mode("prefs").unwrap().payload["theme"], "dark");
        assert_eq!(merged.mode("chat").unwrap().payload["text"], "remote");
        // Kept payloads still carry the maxed version.
        assert_eq!(merged.mode("prefs").unwrap().version, 2);
    }

    #[test]
    fn test_remote_only_modes_are_adopted() {
        let resolver = ConflictResolver::default();
        let local = record_with_mode("s1", "chat", json!({"n": 1}), 1, 0);
        let remote = record_with_mode("s1", "quiz", json!({"score": 80}), 1, 10);

        let (merged, conflicts) = resolver.reconcile(&local, &remote);
        assert!(conflicts.is_empty());
        assert!(merged.mode("chat").is_some());
        assert_eq!(merged.mode("quiz").unwrap().payload["score"], 80);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let resolver = ConflictResolver::default();
        let local = record_with_mode("s1", "chat", json!({"count": 3, "text": "a"}), 2, 0);
        let remote = record_with_mode("s1", "chat", json!({"count": 7, "other": true}), 4, 10);

        let (merged, _) = resolver.reconcile(&local, &remote);

        let (again_remote, conflicts) = resolver.reconcile(&merged, &remote);
        assert_eq!(again_remote, merged);
        assert!(conflicts.is_empty());

        let (again_local, conflicts) = resolver.reconcile(&merged, &local);
        assert_eq!(again_local, merged);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_metrics_merge_takes_maximum() {
        let resolver = ConflictResolver::default();
        let mut local = record_with_mode("s1", "chat", json!({}), 1, 0);
        local.metrics.overall_completion = 40.0;
        local.metrics.total_time_secs = 100;

        let mut remote = record_with_mode("s1", "chat", json!({}), 1, 10);
        remote.metrics.overall_completion = 55.0;
        remote.metrics.total_time_secs = 80;

        let (merged, _) = resolver.reconcile(&local, &remote);
        assert_eq!(merged.metrics.overall_completion, 55.0);
        assert_eq!(merged.metrics.total_time_secs, 100);
    }

    #[test]
    fn test_overlay_changes_event_semantics() {
        let base = json!({"a": 1, "b": "keep"});
        let changes = json!({"a": 9, "c": true});
        assert_eq!(
            overlay_changes(&base, &changes),
            json!({"a": 9, "b": "keep", "c": true})
        );
    }
}
