//! Fallback chain: ordered alternates behind a primary collaborator.
//!
//! Each link in the chain carries its own circuit breaker and retry policy,
//! so an alternate's health is tracked independently of the primary's. The
//! chain tries links in order; a link is abandoned when its retries are
//! exhausted or its breaker rejects the call, and the next link takes over.
//! If every link fails, the caller receives an aggregated report naming each
//! collaborator and its final error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::breaker::CircuitBreaker;
use super::rate_limit::RateLimiter;
use super::retry::{RetryExecutor, RetryPolicy};
use crate::event_bus::Event;
use crate::stage::{SharedCollaborator, StageContext, StageError, StageOutput};

/// One collaborator wrapped with its own breaker and retry policy.
pub struct GuardedCollaborator {
    pub collaborator: SharedCollaborator,
    pub breaker: Arc<CircuitBreaker>,
    pub retry: RetryPolicy,
}

/// Final error of one exhausted collaborator within a chain run.
#[derive(Clone, Debug)]
pub struct CollaboratorFailure {
    pub collaborator: String,
    pub error: StageError,
}

/// Successful chain invocation.
#[derive(Clone, Debug)]
pub struct ChainSuccess {
    pub output: StageOutput,
    /// Which collaborator actually satisfied the call.
    pub served_by: String,
    /// Collaborators that were exhausted before `served_by` answered.
    pub failures: Vec<CollaboratorFailure>,
    /// Call attempts made across all links, including the successful one.
    pub total_attempts: u32,
}

/// Aggregated failure: every link was exhausted.
#[derive(Clone, Debug)]
pub struct ChainError {
    pub failures: Vec<CollaboratorFailure>,
    pub total_attempts: u32,
}

impl ChainError {
    /// The error of the last collaborator tried.
    ///
    /// Chains are never built empty, so a `ChainError` always carries at
    /// least one failure.
    #[must_use]
    pub fn last_error(&self) -> &StageError {
        &self
            .failures
            .last()
            .expect("chain error with no failures")
            .error
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all collaborators exhausted: ")?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", failure.collaborator, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ChainError {}

/// Serializable row of an aggregated failure report.
#[derive(Clone, Debug, Serialize)]
pub struct AttemptReportRow {
    pub collaborator: String,
    pub error: String,
}

impl ChainError {
    /// Report rows for observability surfaces.
    #[must_use]
    pub fn report(&self) -> Vec<AttemptReportRow> {
        self.failures
            .iter()
            .map(|f| AttemptReportRow {
                collaborator: f.collaborator.clone(),
                error: f.error.to_string(),
            })
            .collect()
    }
}

/// Primary-plus-alternates invocation path for one stage.
pub struct FallbackChain {
    links: Vec<GuardedCollaborator>,
    events: flume::Sender<Event>,
}

impl FallbackChain {
    /// Chain of `primary` followed by `fallbacks`, tried in order.
    #[must_use]
    pub fn new(
        primary: GuardedCollaborator,
        fallbacks: Vec<GuardedCollaborator>,
        events: flume::Sender<Event>,
    ) -> Self {
        let mut links = Vec::with_capacity(1 + fallbacks.len());
        links.push(primary);
        links.extend(fallbacks);
        Self { links, events }
    }

    /// Dependency names in try order.
    #[must_use]
    pub fn collaborator_names(&self) -> Vec<&str> {
        self.links
            .iter()
            .map(|link| link.collaborator.name())
            .collect()
    }

    /// Invoke the chain for one stage execution.
    ///
    /// When `limiter` is set, a token is acquired inside every attempt (with
    /// `acquire_wait` as the bounded wait), so throttling backs off through
    /// the retry policy instead of stalling the whole chain.
    ///
    /// # Errors
    ///
    /// [`ChainError`] once the primary and every alternate are exhausted.
    pub async fn invoke(
        &self,
        ctx: &StageContext,
        limiter: Option<Arc<RateLimiter>>,
        acquire_wait: Duration,
    ) -> Result<ChainSuccess, ChainError> {
        let mut failures: Vec<CollaboratorFailure> = Vec::new();
        let mut total_attempts: u32 = 0;

        for link in &self.links {
            let name = link.collaborator.name().to_string();
            let executor = RetryExecutor::new(link.retry.clone(), self.events.clone());

            let breaker = link.breaker.clone();
            let collaborator = link.collaborator.clone();
            let (result, attempts) = executor
                .execute(&name, || {
                    let breaker = breaker.clone();
                    let collaborator = collaborator.clone();
                    let limiter = limiter.clone();
                    let ctx = ctx.clone();
                    async move {
                        if let Some(limiter) = &limiter {
                            limiter.acquire(1.0, acquire_wait).await?;
                        }
                        breaker
                            .guard(|| async move { collaborator.invoke(ctx).await })
                            .await
                    }
                })
                .await;
            total_attempts += attempts;

            match result {
                Ok(output) => {
                    if !failures.is_empty() {
                        tracing::info!(
                            served_by = %name,
                            failed = failures.len(),
                            "fallback collaborator satisfied the call"
                        );
                    }
                    return Ok(ChainSuccess {
                        output,
                        served_by: name,
                        failures,
                        total_attempts,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        collaborator = %name,
                        error = %error,
                        "collaborator exhausted, moving to next fallback"
                    );
                    failures.push(CollaboratorFailure {
                        collaborator: name,
                        error,
                    });
                }
            }
        }

        Err(ChainError {
            failures,
            total_attempts,
        })
    }
}
