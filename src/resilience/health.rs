//! Dependency health records and the system-wide health rollup.
//!
//! Every circuit breaker owns exactly one [`DependencyHealth`] record,
//! obtained from [`HealthMonitor::register`] as a [`DependencyHandle`]. The
//! breaker is the only writer; everything else reads through
//! [`HealthMonitor::snapshot`], which never mutates job or breaker state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::breaker::BreakerState;

/// Smoothing factor for the rolling latency average.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Overall service health, rolled up from per-dependency breaker states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        write!(f, "{s}")
    }
}

/// Rolling health record for one external dependency.
///
/// Created on first registration and kept for the process lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    /// Critical dependencies degrade overall health as soon as they open.
    pub critical: bool,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_state_change: DateTime<Utc>,
    pub calls: u64,
    pub failures: u64,
    /// Exponentially weighted moving average over observed call latencies.
    pub avg_latency_ms: f64,
}

impl DependencyHealth {
    fn new(name: String, critical: bool) -> Self {
        Self {
            name,
            critical,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_state_change: Utc::now(),
            calls: 0,
            failures: 0,
            avg_latency_ms: 0.0,
        }
    }

    /// Fraction of observed calls that succeeded, 1.0 before any call.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            1.0
        } else {
            (self.calls - self.failures) as f64 / self.calls as f64
        }
    }
}

/// Writer handle to one dependency record, owned by its circuit breaker.
#[derive(Clone)]
pub struct DependencyHandle {
    record: Arc<Mutex<DependencyHealth>>,
}

impl DependencyHandle {
    /// Record the outcome and latency of one call attempt.
    pub(crate) fn record_call(&self, ok: bool, latency: Duration) {
        let mut record = self.record.lock().unwrap();
        record.calls += 1;
        if !ok {
            record.failures += 1;
        }
        let ms = latency.as_secs_f64() * 1000.0;
        record.avg_latency_ms = if record.calls == 1 {
            ms
        } else {
            record.avg_latency_ms * (1.0 - LATENCY_EWMA_ALPHA) + ms * LATENCY_EWMA_ALPHA
        };
    }

    /// Sync the record with the breaker's state and failure count.
    /// `last_state_change` moves only when the state actually changed.
    pub(crate) fn record_transition(&self, to: BreakerState, consecutive_failures: u32) {
        let mut record = self.record.lock().unwrap();
        if record.state != to {
            record.state = to;
            record.last_state_change = Utc::now();
        }
        record.consecutive_failures = consecutive_failures;
    }

    /// Point-in-time copy of the record.
    #[must_use]
    pub fn snapshot(&self) -> DependencyHealth {
        self.record.lock().unwrap().clone()
    }
}

/// Thresholds for rolling dependency states up into a [`ServiceHealth`].
#[derive(Clone, Copy, Debug)]
pub struct HealthThresholds {
    /// Unhealthy once more than this fraction of breakers is open.
    pub unhealthy_open_fraction: f64,
    /// Degrade on any open breaker; when false, only critical ones degrade.
    pub degrade_on_any_open: bool,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            unhealthy_open_fraction: 0.5,
            degrade_on_any_open: true,
        }
    }
}

/// Read-only aggregation of every dependency's health record.
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    records: Mutex<FxHashMap<String, Arc<Mutex<DependencyHealth>>>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            records: Mutex::new(FxHashMap::default()),
        }
    }

    /// Create (or reuse) the record for `name` and return its writer handle.
    ///
    /// Registering the same name twice returns a handle to the same record, so
    /// a dependency shared by several stages reports as one entry.
    pub fn register(&self, name: impl Into<String>, critical: bool) -> DependencyHandle {
        let name = name.into();
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(DependencyHealth::new(name, critical))))
            .clone();
        DependencyHandle { record }
    }

    /// Current overall status plus per-dependency detail, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        let records = self.records.lock().unwrap();
        let mut dependencies: Vec<DependencyHealth> = records
            .values()
            .map(|record| record.lock().unwrap().clone())
            .collect();
        dependencies.sort_by(|a, b| a.name.cmp(&b.name));

        HealthSnapshot {
            status: self.roll_up(&dependencies),
            dependencies,
        }
    }

    /// Current overall status only.
    #[must_use]
    pub fn status(&self) -> ServiceHealth {
        self.snapshot().status
    }

    fn roll_up(&self, dependencies: &[DependencyHealth]) -> ServiceHealth {
        if dependencies.is_empty() {
            return ServiceHealth::Healthy;
        }
        let open: Vec<&DependencyHealth> = dependencies
            .iter()
            .filter(|d| d.state == BreakerState::Open)
            .collect();
        let open_fraction = open.len() as f64 / dependencies.len() as f64;
        if open_fraction > self.thresholds.unhealthy_open_fraction {
            return ServiceHealth::Unhealthy;
        }
        let degraded = if self.thresholds.degrade_on_any_open {
            !open.is_empty()
        } else {
            open.iter().any(|d| d.critical)
        };
        if degraded {
            ServiceHealth::Degraded
        } else {
            ServiceHealth::Healthy
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

/// Point-in-time system health view returned by `health()`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: ServiceHealth,
    pub dependencies: Vec<DependencyHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_monitor_is_healthy() {
        let monitor = HealthMonitor::default();
        assert_eq!(monitor.status(), ServiceHealth::Healthy);
    }

    #[test]
    fn single_open_breaker_degrades() {
        let monitor = HealthMonitor::default();
        let handle = monitor.register("search_api", false);
        monitor.register("tts", false);
        monitor.register("renderer", false);

        handle.record_transition(BreakerState::Open, 5);
        assert_eq!(monitor.status(), ServiceHealth::Degraded);
    }

    #[test]
    fn open_majority_is_unhealthy() {
        let monitor = HealthMonitor::default();
        let a = monitor.register("a", false);
        let b = monitor.register("b", false);
        monitor.register("c", false);

        a.record_transition(BreakerState::Open, 5);
        b.record_transition(BreakerState::Open, 5);
        assert_eq!(monitor.status(), ServiceHealth::Unhealthy);
    }

    #[test]
    fn critical_only_mode_ignores_noncritical_opens() {
        let monitor = HealthMonitor::new(HealthThresholds {
            unhealthy_open_fraction: 0.5,
            degrade_on_any_open: false,
        });
        let side = monitor.register("thumbnails", false);
        monitor.register("research", true);
        monitor.register("tts", true);

        side.record_transition(BreakerState::Open, 3);
        assert_eq!(monitor.status(), ServiceHealth::Healthy);
    }

    #[test]
    fn register_twice_shares_the_record() {
        let monitor = HealthMonitor::default();
        let first = monitor.register("search_api", true);
        let second = monitor.register("search_api", false);

        first.record_call(false, Duration::from_millis(80));
        assert_eq!(second.snapshot().failures, 1);
        assert_eq!(monitor.snapshot().dependencies.len(), 1);
        // First registration wins on criticality.
        assert!(second.snapshot().critical);
    }

    #[test]
    fn latency_average_moves_towards_samples() {
        let monitor = HealthMonitor::default();
        let handle = monitor.register("search_api", false);
        handle.record_call(true, Duration::from_millis(100));
        assert!((handle.snapshot().avg_latency_ms - 100.0).abs() < 1e-6);
        handle.record_call(true, Duration::from_millis(200));
        let avg = handle.snapshot().avg_latency_ms;
        assert!(avg > 100.0 && avg < 200.0);
        assert!((handle.snapshot().success_rate() - 1.0).abs() < 1e-9);
    }
}
