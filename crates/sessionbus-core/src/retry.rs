//! Retry policy with jittered exponential back-off.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Upper bound of the jitter, as a fraction of the base delay.
const MAX_JITTER: f64 = 0.25;

/// Controls how transient failures are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (cap).
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            max_retries: 0,
        }
    }

    /// Back-off before jitter for the given retry number (0-indexed), capped
    /// at `max_delay`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Delay before the given retry: the base delay plus up to 25% random
    /// jitter, drawn per call.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() {
            return base;
        }
        base.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..=MAX_JITTER))
    }

    /// Whether the given retry number exceeds the max.
    #[must_use]
    pub const fn should_give_up(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }

    /// Run `attempt_fn` until it succeeds, fails fatally, runs out of
    /// retries, or `deadline` passes.
    ///
    /// Each attempt receives the time remaining before the deadline. A retry
    /// is only scheduled when its back-off delay ends before the deadline, so
    /// the call never outlives it by more than one attempt's own bound.
    ///
    /// # Errors
    /// Returns the last error, or `Error::Timeout` if the deadline passed
    /// before an attempt could start.
    pub async fn run<T, F, Fut>(&self, operation: &str, deadline: Instant, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!("{operation} deadline elapsed")));
            }

            match attempt_fn(remaining).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && !self.should_give_up(attempt) => {
                    let delay = self.delay_for_attempt(attempt);
                    if Instant::now() + delay >= deadline {
                        return Err(e);
                    }
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "retrying transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn default_policy_values() {
        let p = RetryPolicy::default();
        assert_eq!(p.initial_delay, Duration::from_millis(100));
        assert_eq!(p.max_delay, Duration::from_secs(30));
        assert_eq!(p.max_retries, 5);
    }

    #[test]
    fn delay_grows_with_backoff() {
        let p = RetryPolicy::default();
        let d0 = p.delay_for_attempt(0);
        let d1 = p.delay_for_attempt(1);
        let d2 = p.delay_for_attempt(2);
        assert!(d1 > d0);
        assert!(d2 > d1);
    }

    #[test]
    fn delay_capped_at_max() {
        let p = RetryPolicy {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            backoff_factor: 10.0,
            max_retries: 3,
        };
        // Cap plus at most 25% jitter.
        assert!(p.delay_for_attempt(10) <= Duration::from_millis(37_500));
    }

    #[test]
    fn jitter_varies_per_call_within_bound() {
        let p = RetryPolicy::default();
        let base = p.base_delay(1);
        assert_eq!(base.as_millis(), 200);

        let draws: Vec<Duration> = (0..64).map(|_| p.delay_for_attempt(1)).collect();
        for d in &draws {
            assert!((200..=250).contains(&d.as_millis()), "{d:?}");
        }
        assert!(draws.iter().any(|d| *d != draws[0]));
    }

    #[test]
    fn no_retry_gives_up_immediately() {
        assert!(RetryPolicy::no_retry().should_give_up(0));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::default()
            .run("renew", Instant::now() + Duration::from_secs(60), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Communication("reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_surface_at_once() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::default()
            .run("settle", Instant::now() + Duration::from_secs(60), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::SessionLockLost {
                        session_id: "s".into(),
                    })
                }
            })
            .await;
        assert!(result.unwrap_err().is_session_lock_lost());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_the_deadline() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.0,
            max_retries: 10,
        };
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run("renew", Instant::now() + Duration::from_secs(12), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Communication("down".into())) }
            })
            .await;
        assert!(matches!(result, Err(Error::Communication(_))));
        // Delays of 5s (+ jitter) fit twice before the 12s deadline at most.
        assert!(calls.load(Ordering::SeqCst) <= 3);
    }
}
