// =============================================================================
// Circuit breaker — fail fast when a dependency is down
// =============================================================================
//
// State machine:
//   closed    → open      after N consecutive failures
//   open      → half-open once `timeout` has elapsed since the last failure
//   half-open → closed    after M consecutive successes
//   half-open → open      on any failure
//
// While open, calls are rejected with CircuitOpen without executing: during
// a single open window the number of executed calls is zero regardless of
// caller concurrency. All transitions happen inside one mutex.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before it closes again.
    pub success_threshold: u32,
    /// Time the breaker stays open before permitting a trial call.
    pub timeout: Duration,
    /// Recent-outcome window size for the success-rate stat.
    pub window: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            window: 32,
        }
    }
}

/// Serialisable view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub window_success_rate: f64,
    pub last_failure_age_s: Option<f64>,
    pub opened_count: u64,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    window: VecDeque<bool>,
    last_failure_at: Option<Instant>,
    opened_count: u64,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                window: VecDeque::new(),
                last_failure_at: None,
                opened_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Gate a call. Err(CircuitOpen) means the call must not execute.
    /// An open breaker whose timeout has elapsed moves to half-open and
    /// admits the caller as a trial.
    pub fn try_acquire(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    info!(breaker = %self.name, "circuit half-open, admitting trial call");
                    Ok(())
                } else {
                    Err(EngineError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    /// Record a successful outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.push_window(&mut inner, true);
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                info!(breaker = %self.name, "circuit closed");
            }
        }
    }

    /// Record a failed outcome.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.push_window(&mut inner, false);
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(Instant::now());

        let should_open = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            // Any half-open failure reopens.
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_count += 1;
            warn!(
                breaker = %self.name,
                consecutive_failures = inner.consecutive_failures,
                "circuit opened"
            );
        }
    }

    /// Run a synchronous operation under the breaker.
    pub fn call<T, F>(&self, op: F) -> EngineResult<T>
    where
        F: FnOnce() -> EngineResult<T>,
    {
        self.try_acquire()?;
        match op() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Run an async operation under the breaker.
    pub async fn call_async<T, F, Fut>(&self, op: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = EngineResult<T>>,
    {
        self.try_acquire()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        let successes = inner.window.iter().filter(|ok| **ok).count();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            window_success_rate: if inner.window.is_empty() {
                1.0
            } else {
                successes as f64 / inner.window.len() as f64
            },
            last_failure_age_s: inner.last_failure_at.map(|t| t.elapsed().as_secs_f64()),
            opened_count: inner.opened_count,
        }
    }

    fn push_window(&self, inner: &mut Inner, ok: bool) {
        inner.window.push_back(ok);
        while inner.window.len() > self.config.window {
            inner.window.pop_front();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(failures: u32, successes: u32, timeout_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            timeout: Duration::from_millis(timeout_ms),
            window: 16,
        }
    }

    fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call::<(), _>(|| Err(EngineError::Transport("down".into())));
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("dyno", fast_config(3, 1, 10_000));
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn threshold_of_one_opens_on_first_failure() {
        let cb = CircuitBreaker::new("dyno", fast_config(1, 1, 10_000));
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn open_breaker_rejects_without_executing() {
        let cb = CircuitBreaker::new("dyno", fast_config(1, 1, 60_000));
        fail(&cb);

        let executed = AtomicU32::new(0);
        for _ in 0..10 {
            let result = cb.call(|| {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            assert_eq!(result.unwrap_err().kind(), "circuit_open");
        }
        assert_eq!(executed.load(Ordering::SeqCst), 0, "open window executed calls");
    }

    #[test]
    fn open_window_executes_zero_calls_under_concurrency() {
        let cb = Arc::new(CircuitBreaker::new("dyno", fast_config(1, 1, 60_000)));
        fail(&cb);

        let executed = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cb = cb.clone();
            let executed = executed.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let _ = cb.call(|| {
                        executed.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_successes() {
        let cb = CircuitBreaker::new("dyno", fast_config(1, 2, 0));
        fail(&cb);
        // Timeout of zero: next acquire flips to half-open immediately.
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new("dyno", fast_config(1, 2, 0));
        fail(&cb);
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().opened_count, 2);
    }

    #[test]
    fn success_resets_the_failure_run() {
        let cb = CircuitBreaker::new("dyno", fast_config(3, 1, 10_000));
        fail(&cb);
        fail(&cb);
        cb.record_success();
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed, "run was reset by the success");
    }

    #[tokio::test]
    async fn async_call_reports_outcomes() {
        let cb = CircuitBreaker::new("dyno", fast_config(1, 1, 60_000));
        let ok: EngineResult<u32> = cb.call_async(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: EngineResult<u32> = cb
            .call_async(|| async { Err(EngineError::Transport("down".into())) })
            .await;
        assert!(err.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn snapshot_reflects_window() {
        let cb = CircuitBreaker::new("dyno", fast_config(10, 1, 10_000));
        cb.record_success();
        cb.record_success();
        cb.record_failure();
        let snap = cb.snapshot();
        assert_eq!(snap.name, "dyno");
        assert!((snap.window_success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(snap.last_failure_age_s.is_some());
    }
}
