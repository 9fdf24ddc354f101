//! Retry executor: exponential backoff with jitter over one guarded call.
//!
//! Wraps an operation that performs exactly one attempt (already breaker
//! protected) and re-runs it while the error stays retryable. Backoff grows
//! as `base_delay * multiplier^(attempt-1)` capped at `max_delay`, scaled by
//! a uniform jitter factor in `[0.5, 1.0]` so concurrent jobs do not retry in
//! lockstep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::event_bus::Event;
use crate::stage::StageError;

/// Lower bound of the uniform jitter factor applied to each backoff delay.
const JITTER_FLOOR: f64 = 0.5;

/// Retry tuning for one collaborator.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Pre-jitter delay after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base_delay.mul_f64(exp);
        raw.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Runs operations under a [`RetryPolicy`], reporting every attempt.
pub struct RetryExecutor {
    policy: RetryPolicy,
    events: flume::Sender<Event>,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(policy: RetryPolicy, events: flume::Sender<Event>) -> Self {
        Self { policy, events }
    }

    /// Attempt `op` up to `max_attempts` times.
    ///
    /// Returns the first success or the last error, together with the number
    /// of attempts actually made. Stops early on non-retryable errors:
    /// validation and fatal failures abort immediately, and breaker-open
    /// errors return so the fallback chain can advance to the next
    /// collaborator without burning the remaining budget.
    pub async fn execute<T, F, Fut>(&self, dependency: &str, mut op: F) -> (Result<T, StageError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            let started = Instant::now();
            let result = op().await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(value) => {
                    let _ = self
                        .events
                        .send(Event::attempt(dependency, attempt, latency_ms, None));
                    return (Ok(value), attempt);
                }
                Err(error) => {
                    let _ = self.events.send(Event::attempt(
                        dependency,
                        attempt,
                        latency_ms,
                        Some(error.to_string()),
                    ));
                    if !error.is_retryable() || attempt >= self.policy.max_attempts {
                        return (Err(error), attempt);
                    }

                    let mut delay = self.policy.delay_for(attempt);
                    if self.policy.jitter {
                        let factor = rand::rng().random_range(JITTER_FLOOR..=1.0);
                        delay = delay.mul_f64(factor);
                    }
                    tracing::debug!(
                        dependency,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
