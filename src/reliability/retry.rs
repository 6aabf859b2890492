// =============================================================================
// Retry policy — capped exponential backoff with jitter
// =============================================================================
//
// Only error kinds on the allow-list are retried; everything else
// propagates immediately. Jitter spreads retries across callers:
// d_actual = d · (0.5 + rand()), i.e. between half and one-and-a-half of
// the nominal delay.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Error kinds (EngineError::kind values) worth retrying.
    pub retryable_kinds: Vec<&'static str>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: true,
            retryable_kinds: vec!["transport", "timeout"],
        }
    }
}

impl RetryPolicy {
    /// Nominal (pre-jitter) delay before the given 1-based attempt's retry.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let nominal = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(nominal.min(self.max_delay.as_secs_f64()))
    }

    /// Apply jitter to a nominal delay.
    fn jittered(&self, nominal: Duration) -> Duration {
        if !self.jitter {
            return nominal;
        }
        let factor = 0.5 + rand::thread_rng().gen::<f64>();
        Duration::from_secs_f64(nominal.as_secs_f64() * factor)
    }

    pub fn is_retryable(&self, err: &EngineError) -> bool {
        self.retryable_kinds.contains(&err.kind())
    }

    /// Run `op` until it succeeds, a non-retryable error appears, or the
    /// attempt budget is spent. Sleeps between attempts.
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = name, attempt, "retry succeeded");
                    }
                    return Ok(value);
                }
                Err(e) if !self.is_retryable(&e) => {
                    debug!(op = name, kind = e.kind(), "non-retryable error, giving up");
                    return Err(e);
                }
                Err(e) if attempt >= self.max_attempts => {
                    warn!(op = name, attempts = attempt, error = %e, "retry budget exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.jittered(self.delay_for_attempt(attempt));
                    warn!(
                        op = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
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

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            jitter: false,
            retryable_kinds: vec!["transport", "timeout"],
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(300),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        let nominal = Duration::from_millis(100);
        for _ in 0..50 {
            let d = policy.jittered(nominal).as_secs_f64();
            assert!((0.05..0.15).contains(&d), "jittered delay {d} out of band");
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_budget() {
        let policy = fast_policy(3);
        let calls = AtomicU32::new(0);

        let result: EngineResult<()> = policy
            .run("probe", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Transport("down".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_propagate_immediately() {
        let policy = fast_policy(5);
        let calls = AtomicU32::new(0);

        let result: EngineResult<()> = policy
            .run("probe", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Validation("bad input".into())) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), "validation");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = fast_policy(5);
        let calls = AtomicU32::new(0);

        let result = policy
            .run("probe", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EngineError::Timeout(Duration::from_millis(1)))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn circuit_open_is_not_retryable_by_default() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_retryable(&EngineError::CircuitOpen("dyno".into())));
        assert!(policy.is_retryable(&EngineError::Transport("x".into())));
        assert!(policy.is_retryable(&EngineError::Timeout(Duration::from_secs(1))));
        assert!(!policy.is_retryable(&EngineError::Analysis("x".into())));
    }
}
