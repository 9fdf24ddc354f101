//! Resilience layer wrapping every external call the pipeline makes.
//!
//! Composition order for one stage invocation:
//!
//! ```text
//! FallbackChain
//!   └─ RetryExecutor          (per collaborator)
//!        └─ RateLimiter        (token acquired per attempt)
//!        └─ CircuitBreaker     (per dependency, owns its health record)
//!             └─ Collaborator  (exactly one attempt)
//! ```
//!
//! The [`HealthMonitor`] aggregates every breaker's dependency record into
//! the overall `healthy | degraded | unhealthy` signal exposed by the
//! pipeline's `health()` surface.

pub mod breaker;
pub mod fallback;
pub mod health;
pub mod rate_limit;
pub mod retry;

pub use breaker::{BreakerSettings, BreakerState, CircuitBreaker, TripPredicate};
pub use fallback::{
    AttemptReportRow, ChainError, ChainSuccess, CollaboratorFailure, FallbackChain,
    GuardedCollaborator,
};
pub use health::{
    DependencyHandle, DependencyHealth, HealthMonitor, HealthSnapshot, HealthThresholds,
    ServiceHealth,
};
pub use rate_limit::RateLimiter;
pub use retry::{RetryExecutor, RetryPolicy};
