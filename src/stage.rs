//! Stage collaborator framework for the reelforge pipeline.
//!
//! This module provides the seam between the orchestration core and the
//! external systems that do the actual generation work: the [`Collaborator`]
//! trait, the execution context handed to each call, and the classified
//! [`StageError`] taxonomy that drives retry, breaker, and fallback decisions.
//!
//! # Design Principles
//!
//! - **Opaque payloads**: the core stores whatever a collaborator returns
//!   under the stage's key and never interprets it.
//! - **Classified failures**: every error a collaborator surfaces is one of
//!   the [`StageError`] variants; the variant, not the caller, decides whether
//!   the call is retried, skipped to a fallback, or aborts the job.
//! - **Observable**: collaborators report sub-progress through the context so
//!   the weighted progress model can credit partial work.
//!
//! # Examples
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use reelforge::stage::{Collaborator, StageContext, StageError, StageOutput};
//! use serde_json::json;
//!
//! struct ResearchService;
//!
//! #[async_trait]
//! impl Collaborator for ResearchService {
//!     fn name(&self) -> &str {
//!         "research_api"
//!     }
//!
//!     async fn invoke(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
//!         ctx.progress.report(0.5).await;
//!         Ok(StageOutput::json(json!({"facts": ["..."]})))
//!     }
//! }
//! ```

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::event_bus::Event;
use crate::job::{Job, JobRequest};
use crate::types::{GenerationStage, JobId};

// ============================================================================
// Core Trait
// ============================================================================

/// A single external system backing one pipeline stage.
///
/// Implementations perform exactly one attempt of the stage's work per
/// [`invoke`](Self::invoke) call; retries, circuit breaking, and fallback
/// selection are layered on by [`crate::resilience`]. Implementations must be
/// safe to share across job worker tasks.
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Dependency name for health records, breaker identity, and logging.
    fn name(&self) -> &str;

    /// Perform one attempt of this stage's work.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StageError`]; the classification controls how
    /// the resilience layer reacts (see [`StageError::class`]).
    async fn invoke(&self, ctx: StageContext) -> Result<StageOutput, StageError>;
}

/// Shared handle to a collaborator, as stored in stage plans.
pub type SharedCollaborator = Arc<dyn Collaborator>;

// ============================================================================
// Execution Context
// ============================================================================

/// Context passed to a collaborator for one stage invocation.
///
/// Carries the job identity, the original request parameters, and a snapshot
/// of every earlier stage's output. The snapshot is taken at stage start, so
/// a retried attempt sees the same inputs as the first.
#[derive(Clone)]
pub struct StageContext {
    /// Job being advanced.
    pub job_id: JobId,
    /// Stage this invocation serves.
    pub stage: GenerationStage,
    /// Parameters supplied at submission.
    pub request: Arc<JobRequest>,
    /// Outputs of all completed stages, keyed by stage key.
    pub results: FxHashMap<String, Value>,
    /// Sub-progress reporting handle for this stage.
    pub progress: ProgressReporter,
}

impl StageContext {
    /// Output of an earlier stage, if present.
    #[must_use]
    pub fn result(&self, stage: GenerationStage) -> Option<&Value> {
        self.results.get(stage.key())
    }

    /// Output of an earlier stage, or a `Fatal` error naming the gap.
    ///
    /// A missing upstream result means the pipeline wiring is wrong, not that
    /// the input was bad, so this is never retried.
    pub fn require_result(&self, stage: GenerationStage) -> Result<&Value, StageError> {
        self.result(stage).ok_or_else(|| StageError::Fatal {
            message: format!("missing upstream output for stage '{stage}'"),
        })
    }
}

/// Sub-progress handle credited against the running stage's weight.
///
/// Reports are clamped to `[0.0, 1.0]` and folded into the job's overall
/// progress as `completed_weights + fraction * stage_weight`; the job-level
/// monotonicity guard means late or out-of-order reports can never move
/// progress backwards.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Option<ReporterInner>,
}

#[derive(Clone)]
struct ReporterInner {
    job: Arc<tokio::sync::Mutex<Job>>,
    stage: GenerationStage,
    /// Sum of the weights of all stages already completed.
    base: f64,
    /// Weight of the stage currently running.
    weight: f64,
    events: flume::Sender<Event>,
}

impl ProgressReporter {
    /// Reporter wired to a live job record.
    #[must_use]
    pub(crate) fn attached(
        job: Arc<tokio::sync::Mutex<Job>>,
        stage: GenerationStage,
        base: f64,
        weight: f64,
        events: flume::Sender<Event>,
    ) -> Self {
        Self {
            inner: Some(ReporterInner {
                job,
                stage,
                base,
                weight,
                events,
            }),
        }
    }

    /// Reporter that discards all reports. For collaborator unit tests.
    #[must_use]
    pub fn detached() -> Self {
        Self { inner: None }
    }

    /// Report completion of `fraction` (clamped to `[0.0, 1.0]`) of the stage.
    pub async fn report(&self, fraction: f64) {
        let Some(inner) = &self.inner else {
            return;
        };
        let fraction = fraction.clamp(0.0, 1.0);
        let overall = inner.base + fraction * inner.weight;
        let mut job = inner.job.lock().await;
        if job.advance_progress(overall) {
            let _ = inner.events.send(Event::job(
                job.id,
                Some(inner.stage),
                "progress",
                format!("{:.0}% of stage complete", fraction * 100.0),
            ));
        }
    }
}

// ============================================================================
// Stage Output
// ============================================================================

/// Result payload of a successful stage invocation.
///
/// The payload is opaque to the core: it is stored verbatim under the stage's
/// key in `stage_results` and handed to later stages through [`StageContext`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub payload: Value,
}

impl StageOutput {
    /// Wrap a JSON payload as a stage output.
    #[must_use]
    pub fn json(payload: Value) -> Self {
        Self { payload }
    }
}

// ============================================================================
// Error Taxonomy
// ============================================================================

/// Coarse classification of a stage failure, stored on failed jobs.
///
/// This is the serialized, user-visible shape of [`StageError::class`]; the
/// finer-grained variants collapse into these four kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input parameters. Never retried.
    Validation,
    /// Network/timeout/throttling-shaped failure. Retried per policy.
    Transient,
    /// Circuit breaker open. Skips to the next fallback without retrying.
    DependencyUnavailable,
    /// Unexpected or unclassified. Aborts the job immediately.
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::DependencyUnavailable => "dependency_unavailable",
            Self::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Classified failure of a stage call or of the resilience layer around it.
///
/// Collaborators construct the variant that matches what actually happened;
/// the retry executor, fallback chain, and circuit breaker read the
/// classification rather than inspecting messages.
#[derive(Clone, Debug, Error, Diagnostic)]
pub enum StageError {
    /// Input parameters failed validation.
    #[error("validation failed: {message}")]
    #[diagnostic(
        code(reelforge::stage::validation),
        help("Check the request parameters; validation errors are never retried.")
    )]
    Validation { message: String },

    /// A dependency failed in a way that is expected to heal on its own.
    #[error("transient failure from {dependency}: {message}")]
    #[diagnostic(code(reelforge::stage::transient))]
    Transient { dependency: String, message: String },

    /// Rate-limit admission timed out. Retryable after backoff.
    #[error("throttled waiting for rate-limit class '{class}'")]
    #[diagnostic(
        code(reelforge::stage::throttled),
        help("The shared token bucket stayed empty for the whole bounded wait.")
    )]
    Throttled { class: String },

    /// A single collaborator call exceeded its timeout.
    #[error("call to {dependency} timed out after {waited_ms} ms")]
    #[diagnostic(code(reelforge::stage::timeout))]
    Timeout { dependency: String, waited_ms: u64 },

    /// The dependency's circuit breaker is open; no call was made.
    #[error("dependency '{dependency}' unavailable: circuit breaker open")]
    #[diagnostic(
        code(reelforge::stage::breaker_open),
        help("Calls resume after the breaker's cooldown admits a successful probe.")
    )]
    DependencyUnavailable { dependency: String },

    /// Unexpected failure the taxonomy has no better home for.
    #[error("fatal stage failure: {message}")]
    #[diagnostic(code(reelforge::stage::fatal))]
    Fatal { message: String },
}

impl StageError {
    /// Convenience constructor for transient dependency failures.
    pub fn transient(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for validation failures.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Collapse this error into its coarse class.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation { .. } => ErrorClass::Validation,
            Self::Transient { .. } | Self::Throttled { .. } | Self::Timeout { .. } => {
                ErrorClass::Transient
            }
            Self::DependencyUnavailable { .. } => ErrorClass::DependencyUnavailable,
            Self::Fatal { .. } => ErrorClass::Fatal,
        }
    }

    /// Whether the retry executor may attempt this call again.
    ///
    /// Breaker-open errors are deliberately not retryable here: the fallback
    /// chain reacts to them by moving to the next collaborator instead of
    /// burning retry budget against a breaker that will keep rejecting.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
