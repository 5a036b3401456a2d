//! Sync orchestration
//!
//! The orchestrator owns the pending-event queue and the sync status,
//! drives the periodic sync tick and connectivity probe, and runs sync
//! passes: drain queued events per session, reconcile against the freshly
//! loaded remote copy, persist, publish status. Sessions within one pass
//! are processed concurrently with a bounded fan-out; passes themselves
//! are single-flight.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use drift_store::StorageAdapter;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::conflict::{
    overlay_changes, ConflictResolver, MergeStrategy, ResolutionPolicy, ResolvedConflict,
};
use crate::connectivity::{BackoffPolicy, ConnectivityMonitor};
use crate::errors::{Result, SyncError};
use crate::event::{EventKind, EventQueue, SyncEvent};
use crate::model::{ModeData, ProgressSnapshot, SessionRecord};
use crate::reporter::{NoopReporter, ProgressReporter};
use crate::scheduler::{Clock, Scheduler, SystemClock, TaskHandle};
use crate::store::{SessionStore, StorageStats};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Period of the background sync tick.
    pub sync_interval: Duration,
    /// Period of the connectivity liveness probe.
    pub probe_interval: Duration,
    /// Fan-out limit for concurrent per-session reconciliation.
    pub max_concurrent_sessions: usize,
    /// Save attempts per session before the pass gives up on it.
    pub save_retries: u32,
    /// First save-retry delay; doubles per attempt.
    pub save_retry_base: Duration,
    /// Reconnect backoff parameters.
    pub backoff: BackoffPolicy,
    /// Conflict resolution policy.
    pub policy: ResolutionPolicy,
    /// Owner id stamped on freshly-initialized session records.
    pub default_owner_id: String,
    /// Connectivity assumption at startup.
    pub initially_online: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            probe_interval: Duration::from_secs(5),
            max_concurrent_sessions: 4,
            save_retries: 3,
            save_retry_base: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
            policy: ResolutionPolicy::default(),
            default_owner_id: "default-user".to_string(),
            initially_online: true,
        }
    }
}

/// Process-wide sync state, readable by any subscriber.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub online: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_changes: usize,
    pub sync_in_progress: bool,
    pub errors: Vec<String>,
}

/// Periodic liveness probe consulted by the connectivity monitor.
pub type LivenessProbe = Arc<dyn Fn() -> bool + Send + Sync>;

type SubscriberCallback = Box<dyn Fn(&SyncEvent) + Send + Sync>;

struct Subscriber {
    filters: Option<Vec<String>>,
    callback: SubscriberCallback,
}

impl Subscriber {
    fn matches(&self, event: &SyncEvent) -> bool {
        match &self.filters {
            Some(filters) => filters.iter().any(|f| f == event.kind.name()),
            None => true,
        }
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default)]
struct PassOutcome {
    attempted: usize,
    succeeded: usize,
    failed: usize,
}

/// Top-level sync coordinator. Construct one per application through the
/// composition root and share it as an `Arc`; there is no global
/// instance.
pub struct SyncOrchestrator {
    config: SyncConfig,
    store: SessionStore,
    queue: Mutex<EventQueue>,
    status: RwLock<SyncStatus>,
    resolver: std::sync::RwLock<ConflictResolver>,
    monitor: ConnectivityMonitor,
    reporter: Arc<dyn ProgressReporter>,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    subscribers: std::sync::RwLock<HashMap<String, Subscriber>>,
    probe_fn: std::sync::RwLock<Option<LivenessProbe>>,
    sync_in_flight: AtomicBool,
    pass_done: tokio::sync::Notify,
    handles: Mutex<Vec<TaskHandle>>,
}

impl SyncOrchestrator {
    pub fn new(adapter: Arc<dyn StorageAdapter>, config: SyncConfig) -> Arc<Self> {
        Self::with_parts(adapter, config, Arc::new(SystemClock), Arc::new(NoopReporter))
    }

    /// Full constructor with injected clock and metrics reporter.
    pub fn with_parts(
        adapter: Arc<dyn StorageAdapter>,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Arc<Self> {
        let monitor = ConnectivityMonitor::new(config.backoff.clone(), config.initially_online);
        let resolver = ConflictResolver::new(config.policy.clone());
        let status = SyncStatus {
            online: config.initially_online,
            ..SyncStatus::default()
        };

        Arc::new(Self {
            store: SessionStore::new(adapter, clock.clone()),
            queue: Mutex::new(EventQueue::new()),
            status: RwLock::new(status),
            resolver: std::sync::RwLock::new(resolver),
            monitor,
            reporter,
            clock,
            scheduler: Scheduler,
            subscribers: std::sync::RwLock::new(HashMap::new()),
            probe_fn: std::sync::RwLock::new(None),
            sync_in_flight: AtomicBool::new(false),
            pass_done: tokio::sync::Notify::new(),
            handles: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Install the liveness probe consulted by the periodic check.
    pub fn set_liveness_probe(&self, probe: LivenessProbe) {
        *self.probe_fn.write().unwrap() = Some(probe);
    }

    /// Start the background sync tick and connectivity probe.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;

        let this = Arc::clone(self);
        handles.push(self.scheduler.spawn_periodic(
            self.config.sync_interval,
            move || {
                let this = this.clone();
                async move {
                    if this.monitor.is_online() {
                        this.sync_if_idle().await;
                    }
                }
            },
        ));

        let this = Arc::clone(self);
        handles.push(self.scheduler.spawn_periodic(
            self.config.probe_interval,
            move || {
                let this = this.clone();
                async move {
                    this.run_probe().await;
                }
            },
        ));

        info!(
            "Sync orchestrator started (tick {:?}, probe {:?})",
            self.config.sync_interval, self.config.probe_interval
        );
    }

    /// Cancel all scheduled work. No timers or reconnects survive this.
    pub async fn shutdown(&self) {
        let mut handles = self.handles.lock().await;
        handles.clear(); // dropping a handle aborts its task
        self.status.write().await.sync_in_progress = false;
        info!("Sync orchestrator shut down");
    }

    // ---- event intake ----------------------------------------------------

    /// Validate, publish to subscribers, and enqueue a change event.
    ///
    /// Never returns an error: the caller must not block on (or care
    /// about) the network. Failures are recorded in the status.
    pub async fn emit(self: &Arc<Self>, event: SyncEvent) {
        if let Err(e) = event.validate() {
            warn!("Dropping invalid event from {}: {}", event.source, e);
            self.record_error(format!("invalid event: {}", e)).await;
            return;
        }

        for panic_msg in self.notify_subscribers(&event) {
            self.record_error(panic_msg).await;
        }

        let pending = {
            let mut queue = self.queue.lock().await;
            // Validation already passed; a failure here is unreachable.
            if let Err(e) = queue.enqueue(event) {
                self.record_error(format!("enqueue failed: {}", e)).await;
                return;
            }
            queue.len()
        };
        self.status.write().await.pending_changes = pending;

        if self.monitor.is_online() {
            self.spawn_sync();
        } else {
            // Working offline: make the queue durable instead.
            let queue = self.queue.lock().await;
            if let Err(e) = queue.persist_offline(self.store.adapter()).await {
                warn!("Failed to persist offline queue: {}", e);
                self.record_error(format!("offline persist failed: {}", e))
                    .await;
            }
        }
    }

    fn notify_subscribers(&self, event: &SyncEvent) -> Vec<String> {
        let subscribers = self.subscribers.read().unwrap();
        let mut panics = Vec::new();
        for (id, subscriber) in subscribers.iter() {
            if !subscriber.matches(event) {
                continue;
            }
            // One misbehaving subscriber must not block event processing.
            if catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(event))).is_err() {
                warn!("Subscriber {} panicked while handling event", id);
                panics.push(format!("subscriber {} panicked", id));
            }
        }
        panics
    }

    pub fn subscribe(
        &self,
        id: impl Into<String>,
        filters: Option<Vec<String>>,
        callback: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) {
        let id = id.into();
        debug!("Subscriber {} registered", id);
        self.subscribers.write().unwrap().insert(
            id,
            Subscriber {
                filters,
                callback: Box::new(callback),
            },
        );
    }

    pub fn unsubscribe(&self, id: &str) {
        if self.subscribers.write().unwrap().remove(id).is_some() {
            debug!("Subscriber {} removed", id);
        }
    }

    // ---- sync passes -----------------------------------------------------

    /// Run one sync pass and wait for it. Concurrent callers coalesce
    /// onto the running pass: they wait for it to finish, and only start
    /// another one if events arrived after it snapshotted its batch.
    pub async fn trigger_sync(self: &Arc<Self>) {
        loop {
            let notified = self.pass_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.sync_in_flight.swap(true, Ordering::SeqCst) {
                break;
            }
            debug!("Sync already in progress, coalescing");
            notified.await;
            if self.queue.lock().await.is_empty() {
                return;
            }
        }
        self.run_flagged_pass().await;
    }

    /// Background variant: skip entirely when a pass is in flight. The
    /// running pass or the next periodic tick covers whatever is queued.
    async fn sync_if_idle(self: &Arc<Self>) {
        if self.sync_in_flight.swap(true, Ordering::SeqCst) {
            debug!("Sync already in progress, skipping");
            return;
        }
        self.run_flagged_pass().await;
    }

    fn spawn_sync(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.sync_if_idle().await;
        });
    }

    /// Runs with the in-flight flag held by the caller.
    async fn run_flagged_pass(self: &Arc<Self>) {
        let result = self.run_sync_pass().await;
        self.sync_in_flight.store(false, Ordering::SeqCst);
        self.status.write().await.sync_in_progress = false;
        self.pass_done.notify_waiters();

        match result {
            Ok(outcome) => {
                if outcome.attempted == 0 {
                    return;
                }
                if outcome.succeeded > 0 {
                    self.monitor.record_sync_success();
                    self.refresh_online_flag().await;
                }
                if outcome.failed == outcome.attempted {
                    // Fully failed pass: likely the store itself is
                    // unreachable. Back off and reconnect.
                    warn!("Sync pass failed for all {} sessions", outcome.failed);
                    self.monitor.record_sync_failure();
                    self.refresh_online_flag().await;
                    self.schedule_reconnect().await;
                }
            }
            Err(e) => {
                error!("Critical error during sync pass: {}", e);
                self.record_error(format!("critical: {}", e)).await;
                self.monitor.record_sync_failure();
                self.refresh_online_flag().await;
                self.schedule_reconnect().await;
            }
        }
    }

    async fn run_sync_pass(self: &Arc<Self>) -> Result<PassOutcome> {
        {
            let mut status = self.status.write().await;
            status.errors.clear();
            status.sync_in_progress = true;
        }

        let grouped = {
            let mut queue = self.queue.lock().await;
            // Pull in anything spilled while offline before draining.
            queue.restore_offline(self.store.adapter()).await?;
            queue.group_by_session()
        };

        if grouped.is_empty() {
            debug!("No pending events to sync");
            return Ok(PassOutcome::default());
        }

        let mut outcome = PassOutcome {
            attempted: grouped.len(),
            ..PassOutcome::default()
        };
        info!(
            "Sync pass: {} sessions, {} events",
            grouped.len(),
            grouped.values().map(Vec::len).sum::<usize>()
        );

        // Fan-out/fan-in across sessions, bounded by the concurrency limit.
        // One bad session must never block the others.
        let mut join: JoinSet<(String, usize, Result<Vec<ResolvedConflict>>)> = JoinSet::new();
        let mut pending_groups = grouped.into_iter();
        loop {
            while join.len() < self.config.max_concurrent_sessions {
                let Some((session_id, events)) = pending_groups.next() else {
                    break;
                };
                let this = Arc::clone(self);
                join.spawn(async move {
                    let count = events.len();
                    let result = this.sync_session(&session_id, events).await;
                    (session_id, count, result)
                });
            }

            let Some(joined) = join.join_next().await else {
                break;
            };
            match joined {
                Ok((session_id, applied, Ok(conflicts))) => {
                    self.queue.lock().await.remove_applied(&session_id, applied);
                    if !conflicts.is_empty() {
                        info!(
                            "Session {} reconciled with {} conflicts",
                            session_id,
                            conflicts.len()
                        );
                    }
                    outcome.succeeded += 1;
                }
                Ok((session_id, _, Err(e))) => {
                    // Events stay queued for the next pass.
                    warn!("Session {} failed to sync: {}", session_id, e);
                    self.record_error(format!("session {}: {}", session_id, e))
                        .await;
                    outcome.failed += 1;
                }
                Err(e) => {
                    warn!("Session sync task aborted: {}", e);
                    self.record_error(format!("sync task aborted: {}", e)).await;
                    outcome.failed += 1;
                }
            }
        }

        let pending = self.queue.lock().await.len();
        {
            let mut status = self.status.write().await;
            status.pending_changes = pending;
            if outcome.succeeded > 0 {
                status.last_sync = Some(self.clock.now());
            }
        }

        Ok(outcome)
    }

    /// Reconcile and persist one session's batch of queued events.
    async fn sync_session(
        &self,
        session_id: &str,
        events: Vec<SyncEvent>,
    ) -> Result<Vec<ResolvedConflict>> {
        debug!(
            "Syncing session {} ({} events)",
            session_id,
            events.len()
        );

        // Working copy: cached local state, else the persisted copy, else
        // a freshly-initialized record.
        let mut working = match self.store.load(session_id).await? {
            Some(cached) => (*cached).clone(),
            None => SessionRecord::new(
                session_id,
                &self.config.default_owner_id,
                self.clock.now(),
            ),
        };

        for event in &events {
            self.apply_event(&mut working, event).await;
        }

        // Another writer may have persisted since the working copy was
        // cached; reconcile against the freshly loaded remote state.
        let (reconciled, conflicts) = match self.store.fetch(session_id).await? {
            Some(remote) => self.resolver.read().unwrap().reconcile(&working, &remote),
            None => (working, Vec::new()),
        };

        self.save_with_retry(reconciled).await?;
        Ok(conflicts)
    }

    /// Apply a single event to the working copy. Unknown kinds are
    /// skipped for forward compatibility.
    async fn apply_event(&self, record: &mut SessionRecord, event: &SyncEvent) {
        match &event.kind {
            EventKind::SessionStarted => {
                let metrics = &mut record.metrics;
                metrics.session_started_at = Some(event.timestamp);
                metrics.session_duration_secs = 0;
                metrics.actions_performed = 0;
            }
            EventKind::SessionEnded {
                duration_secs,
                final_metrics,
            } => {
                let metrics = &mut record.metrics;
                metrics.session_duration_secs = *duration_secs;
                metrics.total_time_secs += duration_secs;
                if let Some(completion) = final_metrics
                    .as_ref()
                    .and_then(|m| m.get("overall_completion"))
                    .and_then(|v| v.as_f64())
                {
                    metrics.overall_completion = metrics.overall_completion.max(completion);
                }
                let snapshot = ProgressSnapshot {
                    timestamp: event.timestamp,
                    overall_completion: record.metrics.overall_completion,
                    total_time_secs: record.metrics.total_time_secs,
                    session_count: record.progress_history.len() + 1,
                };
                record.progress_history.push(snapshot);
            }
            EventKind::ModeCompleted { mode, results } => {
                let entry = record.modes.entry(mode.clone()).or_insert_with(|| {
                    ModeData::new(mode.clone(), json!({}), event.timestamp)
                });
                entry.completed = true;
                entry.completed_at = Some(event.timestamp);
                let payload =
                    overlay_changes(&entry.payload, &json!({ "results": results }));
                entry.update_payload(payload, event.timestamp);

                // Fire-and-forget metrics update; failures are logged only.
                if let Err(e) = self
                    .reporter
                    .record_completion(&record.session_id, mode, results)
                    .await
                {
                    warn!(
                        "Metrics update failed for session {} mode {}: {}",
                        record.session_id, mode, e
                    );
                }
            }
            EventKind::DataChanged { mode, changes } => {
                let strategy = self
                    .resolver
                    .read()
                    .unwrap()
                    .policy()
                    .strategy_for(mode);
                match record.modes.get_mut(mode) {
                    None => {
                        record.modes.insert(
                            mode.clone(),
                            ModeData::new(mode.clone(), changes.clone(), event.timestamp),
                        );
                    }
                    Some(existing) => match strategy {
                        MergeStrategy::Merge => {
                            let payload = overlay_changes(&existing.payload, changes);
                            existing.update_payload(payload, event.timestamp);
                        }
                        MergeStrategy::RemoteWins => {
                            existing.update_payload(changes.clone(), event.timestamp);
                        }
                        MergeStrategy::LocalWins => {
                            // Payload untouched; still record the write.
                            existing.version += 1;
                            existing.last_modified = event.timestamp;
                        }
                    },
                }
            }
            EventKind::Unknown => {
                debug!("Ignoring event of unknown kind from {}", event.source);
            }
        }
    }

    /// Persist with a fixed retry budget and doubling delay.
    async fn save_with_retry(&self, record: SessionRecord) -> Result<SessionRecord> {
        let session_id = record.session_id.clone();
        let mut delay = self.config.save_retry_base;
        let mut last_error = String::new();

        for attempt in 1..=self.config.save_retries {
            match self.store.save(record.clone()).await {
                Ok(saved) => return Ok(saved),
                Err(e) => {
                    warn!(
                        "Save attempt {}/{} failed for session {}: {}",
                        attempt, self.config.save_retries, session_id, e
                    );
                    last_error = e.to_string();
                    if attempt < self.config.save_retries {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(SyncError::SaveFailed {
            session_id,
            attempts: self.config.save_retries,
            message: last_error,
        })
    }

    // ---- connectivity ----------------------------------------------------

    async fn run_probe(self: &Arc<Self>) {
        let probe = { self.probe_fn.read().unwrap().clone() };
        let Some(probe) = probe else { return };
        let observed = probe();
        if self.monitor.probe(observed) {
            info!("Probe detected reconnection - triggering sync");
            self.sync_if_idle().await;
        }
        self.refresh_online_flag().await;
    }

    /// Platform "came online" signal.
    pub async fn handle_online(self: &Arc<Self>) {
        if self.monitor.notify_online() {
            self.refresh_online_flag().await;
            self.trigger_sync().await;
        }
    }

    /// Platform "went offline" signal. Pending events become durable.
    pub async fn handle_offline(&self) {
        self.monitor.notify_offline();
        self.refresh_online_flag().await;
        let queue = self.queue.lock().await;
        if let Err(e) = queue.persist_offline(self.store.adapter()).await {
            warn!("Failed to persist offline queue: {}", e);
        }
    }

    /// Manual intervention after the reconnect budget is exhausted.
    pub async fn force_reconnect(self: &Arc<Self>) {
        self.monitor.force_reconnect();
        self.trigger_sync().await;
    }

    // Boxed because the reconnect chain is cyclic (a pass schedules a
    // retry pass); an opaque future here would nest without bound and
    // the compiler could not prove it Send.
    fn schedule_reconnect(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.schedule_reconnect_inner())
    }

    async fn schedule_reconnect_inner(self: &Arc<Self>) {
        match self.monitor.next_reconnect_delay() {
            Some(delay) => {
                let this = Arc::clone(self);
                let handle = self.scheduler.spawn_after(delay, async move {
                    this.sync_if_idle().await;
                });
                let mut handles = self.handles.lock().await;
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            None => {
                let attempts = self.monitor.policy().max_attempts;
                self.record_error(SyncError::ReconnectExhausted { attempts }.to_string())
                    .await;
            }
        }
    }

    async fn refresh_online_flag(&self) {
        self.status.write().await.online = self.monitor.is_online();
    }

    async fn record_error(&self, message: String) {
        self.status.write().await.errors.push(message);
    }

    // ---- read-only and direct operations ---------------------------------

    /// Snapshot of the current status (a copy, not a live reference).
    pub async fn get_status(&self) -> SyncStatus {
        let mut status = self.status.read().await.clone();
        status.online = self.monitor.is_online();
        status.pending_changes = self.queue.lock().await.len();
        status
    }

    /// Snapshot of the pending events in arrival order.
    pub async fn get_pending_events(&self) -> Vec<SyncEvent> {
        self.queue.lock().await.snapshot()
    }

    /// Discard pending events, both in memory and any offline spill.
    pub async fn clear_pending_events(&self) {
        let cleared = {
            let mut queue = self.queue.lock().await;
            queue.clear(self.store.adapter()).await
        };
        if let Err(e) = cleared {
            warn!("Failed to remove offline queue backup: {}", e);
        }
        self.status.write().await.pending_changes = 0;
    }

    /// Swap the conflict resolution policy.
    pub fn set_policy(&self, policy: ResolutionPolicy) {
        self.resolver.write().unwrap().set_policy(policy);
    }

    /// Direct user-requested load; errors propagate to the caller.
    pub async fn load_session(&self, session_id: &str) -> Result<Option<Arc<SessionRecord>>> {
        self.store.load(session_id).await
    }

    /// Direct user-requested save; errors propagate to the caller.
    pub async fn save_session(&self, record: SessionRecord) -> Result<SessionRecord> {
        self.store.save(record).await
    }

    /// Remove persisted sessions idle longer than `retention`.
    pub async fn cleanup_expired(&self, retention: chrono::Duration) -> Result<usize> {
        self.store.cleanup_expired(self.clock.now() - retention).await
    }

    /// Aggregate storage usage, for diagnostics surfaces.
    pub async fn storage_stats(&self) -> Result<StorageStats> {
        self.store.stats().await
    }

    /// Bundle an owner's sessions into one portable document.
    pub async fn export_user_data(&self, owner_id: &str) -> Result<Value> {
        self.store.export_sessions(owner_id).await
    }

    /// Restore sessions from a previously exported document.
    pub async fn import_user_data(&self, document: &Value) -> Result<usize> {
        self.store.import_sessions(document).await
    }
}
