//! Per-dependency circuit breaker.
//!
//! One [`CircuitBreaker`] wraps every external collaborator. In `Closed` it
//! passes calls through and counts classified failures; at the configured
//! threshold it flips `Open` and fails fast without touching the dependency.
//! After the cooldown a single probe call is admitted (`HalfOpen`); its
//! outcome decides between returning to `Closed` and restarting the cooldown.
//!
//! Which errors count toward the threshold is a pluggable predicate
//! ([`BreakerSettings::with_trip_predicate`]); by default only
//! transient-class errors trip, so validation mistakes can never wedge a
//! healthy dependency open.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::health::DependencyHandle;
use crate::event_bus::Event;
use crate::stage::{ErrorClass, StageError};

/// Circuit breaker state machine position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through; consecutive classified failures are counted.
    Closed,
    /// Calls fail fast with `DependencyUnavailable`; no dependency traffic.
    Open,
    /// One probe call is in flight; concurrent callers are rejected.
    HalfOpen,
}

impl BreakerState {
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Predicate deciding whether an error counts toward the trip threshold.
pub type TripPredicate = Arc<dyn Fn(&StageError) -> bool + Send + Sync>;

/// Breaker tuning knobs.
#[derive(Clone)]
pub struct BreakerSettings {
    /// Consecutive classified failures that flip `Closed` to `Open`.
    pub failure_threshold: u32,
    /// How long `Open` lasts before a probe is admitted.
    pub cooldown: Duration,
    /// Per-call timeout enforced around the wrapped operation.
    pub call_timeout: Duration,
    trip_on: TripPredicate,
}

impl BreakerSettings {
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Replace the failure-classification predicate.
    #[must_use]
    pub fn with_trip_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StageError) -> bool + Send + Sync + 'static,
    {
        self.trip_on = Arc::new(predicate);
        self
    }

    fn counts_as_failure(&self, error: &StageError) -> bool {
        (self.trip_on)(error)
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            trip_on: Arc::new(|error| error.class() == ErrorClass::Transient),
        }
    }
}

impl fmt::Debug for BreakerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerSettings")
            .field("failure_threshold", &self.failure_threshold)
            .field("cooldown", &self.cooldown)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Fault isolation around a single external dependency.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    health: DependencyHandle,
    events: flume::Sender<Event>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        settings: BreakerSettings,
        health: DependencyHandle,
        events: flume::Sender<Event>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            health,
            events,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Run one dependency call under breaker protection.
    ///
    /// Admission happens before `op` is constructed, so a fast-failed call
    /// never touches the collaborator. The call runs under
    /// [`BreakerSettings::call_timeout`]; timeouts surface as
    /// [`StageError::Timeout`] and count as classified failures under the
    /// default predicate.
    ///
    /// # Errors
    ///
    /// [`StageError::DependencyUnavailable`] when the breaker rejects the
    /// call, otherwise whatever the operation itself returns.
    pub async fn guard<T, F, Fut>(&self, op: F) -> Result<T, StageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let is_probe = self.admit()?;

        let started = Instant::now();
        let result = match tokio::time::timeout(self.settings.call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout {
                dependency: self.name.clone(),
                waited_ms: self.settings.call_timeout.as_millis() as u64,
            }),
        };
        let latency = started.elapsed();

        match &result {
            Ok(_) => self.on_success(is_probe, latency),
            Err(error) => self.on_failure(is_probe, error, latency),
        }
        result
    }

    /// Decide whether a call may proceed. Returns `Ok(true)` when the caller
    /// is the half-open probe.
    fn admit(&self) -> Result<bool, StageError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.settings.cooldown);
                if cooled_down {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(true)
                } else {
                    Err(self.unavailable())
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.unavailable())
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self, is_probe: bool, latency: Duration) {
        self.health.record_call(true, latency);
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        if is_probe {
            inner.probe_in_flight = false;
            inner.opened_at = None;
            self.transition(&mut inner, BreakerState::Closed);
        }
        self.health
            .record_transition(inner.state, inner.consecutive_failures);
    }

    fn on_failure(&self, is_probe: bool, error: &StageError, latency: Duration) {
        self.health.record_call(false, latency);
        let mut inner = self.inner.lock().unwrap();

        if !self.settings.counts_as_failure(error) {
            // Not a dependency-health signal (e.g. validation). The probe
            // still proved the dependency reachable, so a probing breaker
            // closes again.
            if is_probe {
                inner.probe_in_flight = false;
                inner.opened_at = None;
                self.transition(&mut inner, BreakerState::Closed);
            }
            self.health
                .record_transition(inner.state, inner.consecutive_failures);
            return;
        }

        inner.consecutive_failures += 1;
        if is_probe {
            inner.probe_in_flight = false;
            inner.opened_at = Some(Instant::now());
            self.transition(&mut inner, BreakerState::Open);
        } else if inner.state == BreakerState::Closed
            && inner.consecutive_failures >= self.settings.failure_threshold
        {
            inner.opened_at = Some(Instant::now());
            self.transition(&mut inner, BreakerState::Open);
        }
        self.health
            .record_transition(inner.state, inner.consecutive_failures);
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::info!(
            dependency = %self.name,
            from = from.key(),
            to = to.key(),
            "circuit breaker transition"
        );
        let _ = self.events.send(Event::breaker(self.name.clone(), from, to));
    }

    fn unavailable(&self) -> StageError {
        StageError::DependencyUnavailable {
            dependency: self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::HealthMonitor;

    fn breaker(threshold: u32, cooldown: Duration) -> (CircuitBreaker, flume::Receiver<Event>) {
        let monitor = HealthMonitor::default();
        let handle = monitor.register("dep", true);
        let (tx, rx) = flume::unbounded();
        let settings = BreakerSettings::default()
            .with_failure_threshold(threshold)
            .with_cooldown(cooldown);
        (CircuitBreaker::new("dep", settings, handle, tx), rx)
    }

    async fn fail_once(breaker: &CircuitBreaker) -> Result<(), StageError> {
        breaker
            .guard(|| async { Err::<(), _>(StageError::transient("dep", "boom")) })
            .await
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let (breaker, _rx) = breaker(3, Duration::from_secs(60));
        for _ in 0..2 {
            let _ = fail_once(&breaker).await;
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        let _ = fail_once(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // Open fails fast with DependencyUnavailable.
        let err = breaker
            .guard(|| async { Ok::<_, StageError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::DependencyUnavailable { .. }));
    }

    #[tokio::test]
    async fn success_resets_consecutive_count() {
        let (breaker, _rx) = breaker(3, Duration::from_secs(60));
        let _ = fail_once(&breaker).await;
        let _ = fail_once(&breaker).await;
        breaker
            .guard(|| async { Ok::<_, StageError>(()) })
            .await
            .unwrap();
        let _ = fail_once(&breaker).await;
        let _ = fail_once(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes_probe_failure_reopens() {
        let (breaker, _rx) = breaker(1, Duration::from_secs(10));
        let _ = fail_once(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;

        // Probe fails: back to Open, cooldown restarts.
        let _ = fail_once(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(9)).await;
        let err = breaker
            .guard(|| async { Ok::<_, StageError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::DependencyUnavailable { .. }));

        tokio::time::advance(Duration::from_secs(1)).await;
        breaker
            .guard(|| async { Ok::<_, StageError>(()) })
            .await
            .unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_probe() {
        let (breaker, _rx) = breaker(1, Duration::from_secs(5));
        let _ = fail_once(&breaker).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let breaker = Arc::new(breaker);
        let gate = Arc::new(tokio::sync::Notify::new());

        // Probe that blocks until released.
        let probe_breaker = breaker.clone();
        let probe_gate = gate.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .guard(|| async move {
                    probe_gate.notified().await;
                    Ok::<_, StageError>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Concurrent caller is rejected while the probe is in flight.
        let err = breaker
            .guard(|| async { Ok::<_, StageError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::DependencyUnavailable { .. }));

        gate.notify_one();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn validation_errors_do_not_trip() {
        let (breaker, _rx) = breaker(2, Duration::from_secs(60));
        for _ in 0..5 {
            let _ = breaker
                .guard(|| async { Err::<(), _>(StageError::validation("bad input")) })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn call_timeout_counts_as_failure() {
        let (breaker, _rx) = breaker(1, Duration::from_secs(60));
        let err = breaker
            .guard(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, StageError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Timeout { .. }));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn transitions_are_emitted() {
        let (breaker, rx) = breaker(1, Duration::from_secs(60));
        let _ = fail_once(&breaker).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            Event::breaker("dep", BreakerState::Closed, BreakerState::Open)
        );
    }
}
