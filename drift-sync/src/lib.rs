//! Offline-first synchronization engine for drift
//!
//! This crate provides the central synchronization engine that manages:
//! - Event intake, queuing, and offline spill/restore
//! - Single-flight sync passes with per-session isolation
//! - Conflict detection and policy-driven resolution
//! - Checksum-based record integrity validation
//! - Connectivity tracking with capped exponential reconnect backoff
//! - Session persistence with a copy-on-write read cache

pub mod cache;
pub mod conflict;
pub mod connectivity;
pub mod errors;
pub mod event;
pub mod integrity;
pub mod model;
pub mod orchestrator;
pub mod reporter;
pub mod scheduler;
pub mod store;

pub use cache::SessionCache;
pub use conflict::{
    merge_payloads, overlay_changes, ConflictKind, ConflictResolver, MergeStrategy,
    ResolutionPolicy, ResolvedConflict,
};
pub use connectivity::{BackoffPolicy, ConnectivityMonitor, ConnectivityState};
pub use errors::{Result, SyncError};
pub use event::{EventKind, EventQueue, SyncEvent, QUEUE_BACKUP_KEY};
pub use model::{ModeData, ProgressSnapshot, SessionMetrics, SessionRecord};
pub use orchestrator::{LivenessProbe, SyncConfig, SyncOrchestrator, SyncStatus};
pub use reporter::{NoopReporter, ProgressReporter};
pub use scheduler::{Clock, ManualClock, Scheduler, SystemClock, TaskHandle};
pub use store::{SessionStore, StorageStats, SESSION_KEY_PREFIX};
