// =============================================================================
// Health monitor — bounded reading history with derived status
// =============================================================================
//
// Each monitored component keeps a ring of recent readings (status, latency,
// error). The derived summary covers success rate over the retained window,
// average latency, consecutive failures and last check time. Status changes
// fire registered callbacks; callbacks run outside the lock and a panicking
// callback is swallowed with a log line.
// =============================================================================

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

/// Consecutive failures at which a component turns unhealthy.
const UNHEALTHY_FAILURE_RUN: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        write!(f, "{s}")
    }
}

/// One health probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReading {
    pub ok: bool,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
    pub at_ms: i64,
}

/// Derived component summary.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub name: String,
    pub status: HealthStatus,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub last_check_ms: Option<i64>,
    pub readings: usize,
}

type StatusCallback = Box<dyn Fn(HealthStatus, HealthStatus) + Send + Sync>;

struct Inner {
    readings: VecDeque<HealthReading>,
    status: HealthStatus,
    consecutive_failures: u32,
}

pub struct HealthMonitor {
    name: String,
    capacity: usize,
    inner: Mutex<Inner>,
    callbacks: Mutex<Vec<StatusCallback>>,
}

impl HealthMonitor {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                readings: VecDeque::new(),
                status: HealthStatus::Healthy,
                consecutive_failures: 0,
            }),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a callback fired on every status change with
    /// (old, new).
    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(HealthStatus, HealthStatus) + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Box::new(callback));
    }

    pub fn record_success(&self, latency_ms: f64) {
        self.record(HealthReading {
            ok: true,
            latency_ms: Some(latency_ms),
            error: None,
            at_ms: Utc::now().timestamp_millis(),
        });
    }

    pub fn record_failure(&self, error: impl Into<String>) {
        self.record(HealthReading {
            ok: false,
            latency_ms: None,
            error: Some(error.into()),
            at_ms: Utc::now().timestamp_millis(),
        });
    }

    /// Fold a reading into the ring and re-derive the status. Callbacks run
    /// after the lock is released.
    pub fn record(&self, reading: HealthReading) {
        let transition = {
            let mut inner = self.inner.lock();
            if reading.ok {
                inner.consecutive_failures = 0;
            } else {
                inner.consecutive_failures += 1;
            }
            inner.readings.push_back(reading);
            while inner.readings.len() > self.capacity {
                inner.readings.pop_front();
            }

            let new_status = if inner.consecutive_failures >= UNHEALTHY_FAILURE_RUN {
                HealthStatus::Unhealthy
            } else if inner.consecutive_failures > 0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };

            let old = inner.status;
            if new_status != old {
                inner.status = new_status;
                Some((old, new_status))
            } else {
                None
            }
        };

        if let Some((old, new)) = transition {
            info!(monitor = %self.name, from = %old, to = %new, "health status changed");
            let callbacks = self.callbacks.lock();
            for cb in callbacks.iter() {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    cb(old, new);
                }));
                if result.is_err() {
                    error!(monitor = %self.name, "health callback panicked; ignoring");
                }
            }
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.lock().status
    }

    pub fn summary(&self) -> HealthSummary {
        let inner = self.inner.lock();
        let total = inner.readings.len();
        let successes = inner.readings.iter().filter(|r| r.ok).count();
        let latencies: Vec<f64> = inner.readings.iter().filter_map(|r| r.latency_ms).collect();

        HealthSummary {
            name: self.name.clone(),
            status: inner.status,
            success_rate: if total == 0 {
                1.0
            } else {
                successes as f64 / total as f64
            },
            avg_latency_ms: if latencies.is_empty() {
                None
            } else {
                Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
            },
            consecutive_failures: inner.consecutive_failures,
            last_check_ms: inner.readings.back().map(|r| r.at_ms),
            readings: total,
        }
    }
}
