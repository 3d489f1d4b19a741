//! Contact health for outbound channels.
//!
//! Tracks delivery successes and failures towards one receiver and the time of
//! the last successful contact.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const STATUS_UNKNOWN: u8 = 0;
const STATUS_HEALTHY: u8 = 1;
const STATUS_DEGRADED: u8 = 2;
const STATUS_UNHEALTHY: u8 = 3;

/// Health status of a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    /// Last delivery succeeded.
    Healthy,
    /// Recent deliveries failed, but fewer than the threshold.
    Degraded,
    /// Consecutive failures reached the threshold.
    Unhealthy,
    /// Nothing delivered yet.
    #[default]
    Unknown,
}

impl From<u8> for HealthStatus {
    fn from(raw: u8) -> Self {
        match raw {
            STATUS_HEALTHY => HealthStatus::Healthy,
            STATUS_DEGRADED => HealthStatus::Degraded,
            STATUS_UNHEALTHY => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

impl From<HealthStatus> for u8 {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => STATUS_HEALTHY,
            HealthStatus::Degraded => STATUS_DEGRADED,
            HealthStatus::Unhealthy => STATUS_UNHEALTHY,
            HealthStatus::Unknown => STATUS_UNKNOWN,
        }
    }
}

/// Snapshot of [`ContactHealth`].
#[derive(Debug, Clone, Default)]
pub struct HealthStats {
    /// Current status.
    pub status: HealthStatus,
    /// Successful deliveries.
    pub success_count: u64,
    /// Failed attempts.
    pub failure_count: u64,
    /// Failed attempts since the last success.
    pub consecutive_failures: u32,
    /// Last successful contact (secs since epoch, 0 if never).
    pub last_success_ts: u64,
}

/// Thread-safe delivery health of one channel.
pub struct ContactHealth {
    failure_threshold: u32,
    status: AtomicU8,
    consecutive_failures: AtomicU32,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    last_success_ts: AtomicU64,
    last_success: Mutex<Option<Instant>>,
}

impl ContactHealth {
    /// Creates a tracker that turns unhealthy after `failure_threshold`
    /// consecutive failures.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            status: AtomicU8::new(STATUS_UNKNOWN),
            consecutive_failures: AtomicU32::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            last_success_ts: AtomicU64::new(0),
            last_success: Mutex::new(None),
        }
    }

    fn now_ts() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Records a delivered message.
    pub fn record_success(&self) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success_ts.store(Self::now_ts(), Ordering::Relaxed);
        if let Ok(mut last) = self.last_success.lock() {
            *last = Some(Instant::now());
        }
        self.status.store(STATUS_HEALTHY, Ordering::Relaxed);
    }

    /// Records a failed attempt.
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let status = if failures >= self.failure_threshold {
            STATUS_UNHEALTHY
        } else {
            STATUS_DEGRADED
        };
        self.status.store(status, Ordering::Relaxed);
    }

    /// Current status.
    pub fn status(&self) -> HealthStatus {
        self.status.load(Ordering::Relaxed).into()
    }

    /// Failed attempts since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Total successful deliveries.
    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    /// Total failed attempts.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Time since the last successful contact, if there was one.
    pub fn since_last_success(&self) -> Option<Duration> {
        self.last_success
            .lock()
            .ok()
            .and_then(|last| last.map(|at| at.elapsed()))
    }

    /// Full snapshot.
    pub fn stats(&self) -> HealthStats {
        HealthStats {
            status: self.status(),
            success_count: self.success_count(),
            failure_count: self.failure_count(),
            consecutive_failures: self.consecutive_failures(),
            last_success_ts: self.last_success_ts.load(Ordering::Relaxed),
        }
    }
}

impl Default for ContactHealth {
    fn default() -> Self {
        Self::new(3)
    }
}
