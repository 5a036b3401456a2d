//! Time sources and cancellable scheduled work
//!
//! All delayed work in the engine goes through this module so shutdown is
//! deterministic: the orchestrator owns every [`TaskHandle`] it creates
//! and aborts them as a unit. Timestamp logic goes through the [`Clock`]
//! seam so tests can drive time without wall-clock waits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Handle to a scheduled task, aborted when dropped.
#[derive(Debug)]
pub struct TaskHandle {
    inner: JoinHandle<()>,
}

impl TaskHandle {
    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

/// Spawns periodic and delayed work as cancellable tasks.
#[derive(Debug, Clone, Default)]
pub struct Scheduler;

impl Scheduler {
    /// Run `tick` every `period`, starting one period from now.
    pub fn spawn_periodic<F, Fut>(&self, period: Duration, tick: F) -> TaskHandle
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick of tokio's interval fires immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        TaskHandle { inner: handle }
    }

    /// Run `work` once after `delay`.
    pub fn spawn_after<Fut>(&self, delay: Duration, work: Fut) -> TaskHandle
    where
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            work.await;
        });
        TaskHandle { inner: handle }
    }
}
