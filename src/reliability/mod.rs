// =============================================================================
// Reliability substrate — breakers, retry, health, system roll-up
// =============================================================================
//
// Every I/O boundary (discovery, subscribe, external calls) is wrapped
// retry(circuit_breaker(call)). The registry owns all breakers and
// monitors, keeps a bounded alert ring, and exposes one aggregate snapshot.
// =============================================================================

pub mod circuit_breaker;
pub mod health;
pub mod retry;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use health::{HealthMonitor, HealthStatus};
pub use retry::RetryPolicy;

/// Alerts retained for the dashboard.
const MAX_ALERTS: usize = 100;

/// One recorded reliability event.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub source: String,
    pub message: String,
    pub at: String,
}

/// Aggregate reliability view.
#[derive(Debug, Clone, Serialize)]
pub struct ReliabilitySnapshot {
    pub overall: HealthStatus,
    pub breakers: Vec<circuit_breaker::CircuitBreakerSnapshot>,
    pub monitors: Vec<health::HealthSummary>,
    pub recent_alerts: Vec<Alert>,
}

/// Process-wide registry of breakers and monitors. Constructed eagerly at
/// startup and handed around explicitly; tests build their own.
pub struct ReliabilityRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    monitors: Mutex<HashMap<String, Arc<HealthMonitor>>>,
    alerts: Mutex<VecDeque<Alert>>,
}

impl ReliabilityRegistry {
    pub fn new() -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            alerts: Mutex::new(VecDeque::new()),
        }
    }

    /// Get or create a breaker by name.
    pub fn breaker(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Get or create a monitor by name.
    pub fn monitor(&self, name: &str, capacity: usize) -> Arc<HealthMonitor> {
        self.monitors
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(HealthMonitor::new(name, capacity)))
            .clone()
    }

    /// Record an alert into the bounded ring.
    pub fn record_alert(&self, source: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(source = %source, alert = %message, "reliability alert");
        let mut alerts = self.alerts.lock();
        alerts.push_back(Alert {
            source: source.to_string(),
            message,
            at: Utc::now().to_rfc3339(),
        });
        while alerts.len() > MAX_ALERTS {
            alerts.pop_front();
        }
    }

    /// Aggregate state: unhealthy when any breaker is open or any monitor
    /// is unhealthy; degraded when anything is half-open or degraded.
    pub fn snapshot(&self) -> ReliabilitySnapshot {
        let breakers: Vec<_> = self
            .breakers
            .lock()
            .values()
            .map(|b| b.snapshot())
            .collect();
        let monitors: Vec<_> = self.monitors.lock().values().map(|m| m.summary()).collect();

        let any_open = breakers.iter().any(|b| b.state == CircuitState::Open);
        let any_unhealthy = monitors.iter().any(|m| m.status == HealthStatus::Unhealthy);
        let any_half_open = breakers.iter().any(|b| b.state == CircuitState::HalfOpen);
        let any_degraded = monitors.iter().any(|m| m.status == HealthStatus::Degraded);

        let overall = if any_open || any_unhealthy {
            HealthStatus::Unhealthy
        } else if any_half_open || any_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ReliabilitySnapshot {
            overall,
            breakers,
            monitors,
            recent_alerts: self.alerts.lock().iter().cloned().collect(),
        }
    }
}

impl Default for ReliabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
