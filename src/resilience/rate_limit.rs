//! Token-bucket rate limiter shared by all calls of a collaborator class.
//!
//! The bucket refills continuously at `refill_per_sec` up to `capacity`.
//! [`acquire`](RateLimiter::acquire) blocks (asleep, not spinning) until the
//! requested tokens are available or the caller's bounded wait elapses; the
//! timeout surfaces as retryable [`StageError::Throttled`] so the retry
//! executor backs off instead of failing the job outright.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::stage::StageError;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, capacity: f64, refill_per_sec: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
    }
}

/// Token bucket keyed by collaborator class name.
pub struct RateLimiter {
    class: String,
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Bucket starts full.
    #[must_use]
    pub fn new(class: impl Into<String>, capacity: f64, refill_per_sec: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            class: class.into(),
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Tokens currently available (after lazy refill).
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(self.capacity, self.refill_per_sec);
        bucket.tokens
    }

    /// Take `tokens` immediately if available.
    pub async fn try_acquire(&self, tokens: f64) -> bool {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(self.capacity, self.refill_per_sec);
        if bucket.tokens + f64::EPSILON >= tokens {
            bucket.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Block until `tokens` are available or `max_wait` elapses, whichever
    /// comes first.
    ///
    /// # Errors
    ///
    /// [`StageError::Throttled`] once the deadline passes without the bucket
    /// filling far enough.
    pub async fn acquire(&self, tokens: f64, max_wait: Duration) -> Result<(), StageError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let shortfall = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(self.capacity, self.refill_per_sec);
                if bucket.tokens + f64::EPSILON >= tokens {
                    bucket.tokens -= tokens;
                    return Ok(());
                }
                tokens - bucket.tokens
            };

            // Sleep exactly until the shortfall could have refilled; another
            // caller may still win the race, in which case we loop again.
            let wait_secs = if self.refill_per_sec > 0.0 {
                shortfall / self.refill_per_sec
            } else {
                f64::INFINITY
            };

            let now = Instant::now();
            if !wait_secs.is_finite()
                || now + Duration::from_secs_f64(wait_secs) > deadline
            {
                tokio::time::sleep_until(deadline).await;
                tracing::debug!(class = %self.class, tokens, "rate limit acquisition timed out");
                return Err(StageError::Throttled {
                    class: self.class.clone(),
                });
            }
            tokio::time::sleep(Duration::from_secs_f64(wait_secs)).await;
        }
    }
}
