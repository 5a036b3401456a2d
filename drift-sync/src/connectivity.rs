//! Connectivity state machine with exponential reconnect backoff
//!
//! Tracks online/offline from both platform push signals and periodic
//! probes. Going offline is triggered by a signal or by three consecutive
//! failed sync attempts; coming back transitions through `Reconnecting`,
//! which attempts one immediate sync and retries with capped exponential
//! backoff until the attempt budget is spent.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Consecutive sync failures that force the Offline state.
const FAILURES_TO_OFFLINE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
    Reconnecting,
}

/// Deterministic capped exponential backoff (no jitter).
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub cap_delay: Duration,
    /// Attempts before the monitor stops auto-retrying.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            cap_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^attempt, cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.cap_delay);
        delay.min(self.cap_delay)
    }
}

#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: Mutex<ConnectivityState>,
    consecutive_failures: AtomicU32,
    reconnect_attempts: AtomicU32,
    policy: BackoffPolicy,
}

impl ConnectivityMonitor {
    pub fn new(policy: BackoffPolicy, initially_online: bool) -> Self {
        let state = if initially_online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        Self {
            state: Mutex::new(state),
            consecutive_failures: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
            policy,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.lock().unwrap()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Auto-retry budget spent; only a signal or force-reconnect resumes.
    pub fn is_exhausted(&self) -> bool {
        self.reconnect_attempts() >= self.policy.max_attempts
    }

    /// Platform "came online" signal. Returns true when this left the
    /// Offline state; the caller should attempt one immediate sync. A
    /// signal during an ongoing reconnect does not start a second one.
    pub fn notify_online(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != ConnectivityState::Offline {
            return false;
        }
        info!("Connectivity restored - entering reconnect");
        *state = ConnectivityState::Reconnecting;
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        true
    }

    /// Platform "went offline" signal.
    pub fn notify_offline(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != ConnectivityState::Offline {
            info!("Connectivity lost - entering offline mode");
            *state = ConnectivityState::Offline;
        }
    }

    /// Periodic liveness probe result. Returns true when the probe
    /// detected an offline-to-online change the caller should act on.
    pub fn probe(&self, observed_online: bool) -> bool {
        match (self.state(), observed_online) {
            (ConnectivityState::Offline, true) => {
                debug!("Probe detected reconnection");
                self.notify_online()
            }
            (ConnectivityState::Online, false) => {
                debug!("Probe detected connection loss");
                self.notify_offline();
                false
            }
            _ => false,
        }
    }

    /// Record a successful sync: counters reset, state goes Online.
    pub fn record_sync_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if *state != ConnectivityState::Online {
            info!("Sync succeeded - back online");
            *state = ConnectivityState::Online;
        }
    }

    /// Record a failed sync attempt. Returns true when the failure streak
    /// just forced the Offline state.
    pub fn record_sync_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= FAILURES_TO_OFFLINE {
            let mut state = self.state.lock().unwrap();
            if *state != ConnectivityState::Offline {
                warn!(
                    "{} consecutive sync failures - treating as offline",
                    failures
                );
                *state = ConnectivityState::Offline;
                return true;
            }
        }
        false
    }

    /// Claim the next reconnect slot: move to Reconnecting and return the
    /// delay to wait before retrying, or `None` when the budget is spent.
    pub fn next_reconnect_delay(&self) -> Option<Duration> {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.policy.max_attempts {
            warn!(
                "Reconnect attempts exhausted ({}) - holding for manual intervention",
                self.policy.max_attempts
            );
            return None;
        }
        let delay = self.policy.delay_for(attempt);
        *self.state.lock().unwrap() = ConnectivityState::Reconnecting;
        debug!(
            "Scheduling reconnect attempt {} in {:?}",
            attempt + 1,
            delay
        );
        Some(delay)
    }

    /// Manual intervention: reset the budget and re-enter Reconnecting.
    pub fn force_reconnect(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        *self.state.lock().unwrap() = ConnectivityState::Reconnecting;
        info!("Forced reconnect requested");
    }
}
