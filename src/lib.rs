//! # Reelforge: Resilient Video-Generation Orchestration
//!
//! Reelforge is the orchestration core of a multi-stage content-generation
//! pipeline (research → scripting → asset sourcing → audio → assembly →
//! finalization). It tracks per-job weighted progress, guarantees forward
//! progress or a well-defined failure outcome, and wraps every external call
//! in a resilience stack of rate limiting, retries, circuit breaking, and
//! ordered fallbacks.
//!
//! ## Core Concepts
//!
//! - **Jobs**: one tracked generation request with a status, current stage,
//!   monotone progress, and per-stage results
//! - **Collaborators**: external systems behind the [`stage::Collaborator`]
//!   trait, invoked once per attempt
//! - **Resilience**: fallback chain → retry executor → rate limiter →
//!   circuit breaker around each invocation
//! - **Health**: per-dependency breaker records rolled up into
//!   `healthy | degraded | unhealthy`
//! - **Events**: structured observability over a flume-backed bus with
//!   pluggable sinks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use reelforge::config::PipelineConfig;
//! use reelforge::job::JobRequest;
//! use reelforge::pipeline::{Pipeline, StageBinding};
//! use reelforge::types::GenerationStage;
//! # async fn example(
//! #     research: reelforge::stage::SharedCollaborator,
//! #     research_backup: reelforge::stage::SharedCollaborator,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//!
//! let pipeline = Pipeline::builder(PipelineConfig::from_env())
//!     .bind(
//!         GenerationStage::Researching,
//!         StageBinding::new(research)
//!             .with_fallback(research_backup)
//!             .with_rate_class("search")
//!             .critical(true),
//!     )
//!     .build();
//!
//! let id = pipeline
//!     .submit(JobRequest::new("A short history of the transistor"))
//!     .await?;
//!
//! let report = pipeline.status(id).await.expect("job exists");
//! println!("{}: {:.0}%", report.current_stage, report.progress * 100.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! For every job: `progress` never decreases until failure and is exactly
//! 1.0 iff the job completed; `current_stage` only moves forward (in-place
//! retries aside); terminal jobs are immutable; cancellation is observed at
//! stage boundaries and an in-flight attempt's result is discarded rather
//! than applied.
//!
//! ## Module Guide
//!
//! - [`types`] - Job identifiers, statuses, and the fixed stage order
//! - [`job`] - Job records, request validation, failure records
//! - [`stage`] - Collaborator trait, stage context, error taxonomy
//! - [`config`] - Stage weights and resilience/pipeline tuning
//! - [`registry`] - Job storage, status reads, listing, statistics
//! - [`pipeline`] - Submission, per-job workers, cancellation, health
//! - [`resilience`] - Retry, circuit breaker, fallback, rate limit, health
//! - [`event_bus`] - Structured events, bus, and sinks
//! - [`telemetry`] - Event formatting and tracing setup

pub mod config;
pub mod event_bus;
pub mod job;
pub mod pipeline;
pub mod registry;
pub mod resilience;
pub mod stage;
pub mod telemetry;
pub mod types;
