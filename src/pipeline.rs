//! The stage pipeline: one worker task per job, resilience around every call.
//!
//! # Execution model
//!
//! 1. [`Pipeline::submit`] validates the request, registers a `Queued` job,
//!    and spawns a worker task (admission-bounded by `max_concurrent_jobs`).
//! 2. The worker walks [`GenerationStage::pipeline_order`] front to back. A
//!    stage with a registered [`StageBinding`] is invoked through its
//!    fallback chain → retry executor → circuit breaker; a stage without one
//!    completes internally and just contributes its weight.
//! 3. Rate-limit tokens are acquired inside each retry attempt, so a bounded
//!    wait that times out surfaces as retryable throttling and backs off per
//!    policy instead of failing the job outright.
//! 4. Cancellation is cooperative: it is observed at every stage boundary,
//!    and an attempt already in flight finishes but has its result discarded.
//! 5. Exhausted failure (primary and all fallbacks) fails the job with the
//!    stage name and an aggregated, human-readable message; no further
//!    stages run. Success after `Finalizing` completes the job at 1.0.
//!
//! # Example
//!
//! ```rust,no_run
//! use reelforge::config::PipelineConfig;
//! use reelforge::job::JobRequest;
//! use reelforge::pipeline::{Pipeline, StageBinding};
//! use reelforge::types::GenerationStage;
//! # use std::sync::Arc;
//! # async fn example(research: reelforge::stage::SharedCollaborator) {
//! let pipeline = Pipeline::builder(PipelineConfig::default())
//!     .bind(
//!         GenerationStage::Researching,
//!         StageBinding::new(research).with_rate_class("search"),
//!     )
//!     .build();
//!
//! let id = pipeline
//!     .submit(JobRequest::new("A short history of the transistor"))
//!     .await
//!     .unwrap();
//! let report = pipeline.status(id).await.unwrap();
//! # }
//! ```

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::future::join_all;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PipelineConfig;
use crate::event_bus::{Event, EventBus, EventSink};
use crate::job::{Job, JobRequest, JobSummary};
use crate::registry::{CancelOutcome, JobFilter, JobRegistry, JobStatistics, Page, StatusReport};
use crate::resilience::{
    BreakerSettings, CircuitBreaker, FallbackChain, GuardedCollaborator, HealthMonitor,
    HealthSnapshot, RateLimiter, RetryPolicy,
};
use crate::stage::{ErrorClass, ProgressReporter, SharedCollaborator, StageContext, StageError};
use crate::types::{GenerationStage, JobId};

/// Collaborator wiring for one stage, consumed by the builder.
pub struct StageBinding {
    primary: SharedCollaborator,
    fallbacks: Vec<SharedCollaborator>,
    rate_class: Option<String>,
    retry: Option<RetryPolicy>,
    breaker: Option<BreakerSettings>,
    critical: bool,
}

impl StageBinding {
    #[must_use]
    pub fn new(primary: SharedCollaborator) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
            rate_class: None,
            retry: None,
            breaker: None,
            critical: false,
        }
    }

    /// Append an alternate tried after the previous ones are exhausted.
    #[must_use]
    pub fn with_fallback(mut self, collaborator: SharedCollaborator) -> Self {
        self.fallbacks.push(collaborator);
        self
    }

    /// Share a token bucket with every stage naming the same class.
    #[must_use]
    pub fn with_rate_class(mut self, class: impl Into<String>) -> Self {
        self.rate_class = Some(class.into());
        self
    }

    /// Override the pipeline-default retry policy for this stage's links.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Override the pipeline-default breaker settings for this stage's links.
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Mark this stage's dependencies critical for health rollup.
    #[must_use]
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }
}

struct StagePlan {
    chain: FallbackChain,
    rate_class: Option<String>,
}

/// Builder wiring collaborators, breakers, and rate limiters into a pipeline.
pub struct PipelineBuilder {
    config: PipelineConfig,
    bus: Option<EventBus>,
    bindings: Vec<(GenerationStage, StageBinding)>,
}

impl PipelineBuilder {
    /// Replace the default stdout event bus (e.g. with memory or channel
    /// sinks) before any worker starts emitting.
    #[must_use]
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Register the collaborator wiring for one stage. Binding the same
    /// stage twice keeps the later binding's chain; note that a dependency
    /// NAME keeps the breaker (and criticality) from its first appearance,
    /// since breakers are shared per dependency across stages.
    #[must_use]
    pub fn bind(mut self, stage: GenerationStage, binding: StageBinding) -> Self {
        self.bindings.push((stage, binding));
        self
    }

    /// Assemble the pipeline and start its event listener.
    #[must_use]
    pub fn build(self) -> Arc<Pipeline> {
        let bus = self.bus.unwrap_or_default();
        bus.listen_for_events();
        let events = bus.get_sender();

        let monitor = Arc::new(HealthMonitor::new(self.config.health));
        // One breaker per dependency name: a collaborator reused across
        // stages keeps a single failure history and health record.
        let mut breakers: FxHashMap<String, Arc<CircuitBreaker>> = FxHashMap::default();
        let mut limiters: FxHashMap<String, Arc<RateLimiter>> = FxHashMap::default();
        let mut plans: FxHashMap<GenerationStage, StagePlan> = FxHashMap::default();

        for (stage, binding) in self.bindings {
            if stage == GenerationStage::Completed {
                tracing::warn!("ignoring stage binding for terminal stage marker");
                continue;
            }

            if let Some(class) = &binding.rate_class
                && !limiters.contains_key(class)
            {
                let settings = self.config.rate_limit_for(class);
                limiters.insert(
                    class.clone(),
                    Arc::new(RateLimiter::new(
                        class.clone(),
                        settings.capacity,
                        settings.refill_per_sec,
                    )),
                );
            }

            let retry = binding.retry.unwrap_or_else(|| self.config.retry.clone());
            let breaker_settings = binding
                .breaker
                .unwrap_or_else(|| self.config.breaker.clone());
            let critical = binding.critical;
            let mut guard = |collaborator: SharedCollaborator| -> GuardedCollaborator {
                let name = collaborator.name().to_string();
                let breaker = breakers
                    .entry(name.clone())
                    .or_insert_with(|| {
                        Arc::new(CircuitBreaker::new(
                            name.clone(),
                            breaker_settings.clone(),
                            monitor.register(name.clone(), critical),
                            events.clone(),
                        ))
                    })
                    .clone();
                GuardedCollaborator {
                    collaborator,
                    breaker,
                    retry: retry.clone(),
                }
            };

            let primary = guard(binding.primary);
            let fallbacks = binding.fallbacks.into_iter().map(&mut guard).collect();
            plans.insert(
                stage,
                StagePlan {
                    chain: FallbackChain::new(primary, fallbacks, events.clone()),
                    rate_class: binding.rate_class,
                },
            );
        }

        let gate = Arc::new(Semaphore::new(self.config.max_concurrent_jobs));
        Arc::new(Pipeline {
            config: self.config,
            registry: Arc::new(JobRegistry::new()),
            monitor,
            plans,
            limiters,
            events,
            bus,
            gate,
            workers: StdMutex::new(Vec::new()),
        })
    }
}

/// Orchestration core: job intake, per-job workers, and read surfaces.
pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<JobRegistry>,
    monitor: Arc<HealthMonitor>,
    plans: FxHashMap<GenerationStage, StagePlan>,
    limiters: FxHashMap<String, Arc<RateLimiter>>,
    events: flume::Sender<Event>,
    bus: EventBus,
    gate: Arc<Semaphore>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Start building a pipeline with the given configuration.
    #[must_use]
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            bus: None,
            bindings: Vec::new(),
        }
    }

    /// Validate and enqueue a generation request, spawning its worker.
    ///
    /// # Errors
    ///
    /// [`StageError::Validation`] when the request fails its bounds checks;
    /// no job record is created in that case.
    pub async fn submit(self: &Arc<Self>, request: JobRequest) -> Result<JobId, StageError> {
        request.validate()?;
        let (id, record) = self.registry.create(request).await;
        let _ = self.events.send(Event::job(id, None, "status", "queued"));
        tracing::info!(job_id = %id, "job submitted");

        let pipeline = Arc::clone(self);
        let handle = tokio::spawn(pipeline.run_job(id, record));
        let mut workers = self.workers.lock().unwrap();
        workers.retain(|w| !w.is_finished());
        workers.push(handle);
        Ok(id)
    }

    /// Status snapshot for one job.
    pub async fn status(&self, id: JobId) -> Option<StatusReport> {
        self.registry.status(id).await
    }

    /// Request cancellation; the worker observes it at the next stage
    /// boundary and never starts a new stage afterwards.
    pub async fn cancel(&self, id: JobId) -> CancelOutcome {
        let outcome = self.registry.cancel(id).await;
        if outcome == CancelOutcome::Cancelled {
            let _ = self.events.send(Event::job(id, None, "status", "cancelled"));
        }
        outcome
    }

    /// Filtered, paginated job summaries, newest first.
    pub async fn list(&self, filter: JobFilter, page: Page) -> Vec<JobSummary> {
        self.registry.list(filter, page).await
    }

    /// Per-status job counts.
    pub async fn statistics(&self) -> JobStatistics {
        self.registry.statistics().await
    }

    /// Overall health plus per-dependency detail. Read-only.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.monitor.snapshot()
    }

    /// The registry backing this pipeline.
    #[must_use]
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Attach an additional event sink (e.g. a per-request stream).
    pub fn add_event_sink<T: EventSink + 'static>(&self, sink: T) {
        self.bus.add_sink(sink);
    }

    /// Wait for every spawned worker to finish.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap();
            workers.drain(..).collect()
        };
        join_all(handles).await;
    }

    /// Drain workers and stop the event listener.
    pub async fn shutdown(&self) {
        self.drain().await;
        self.bus.stop_listener().await;
    }

    async fn run_job(self: Arc<Self>, id: JobId, record: Arc<Mutex<Job>>) {
        let _permit = match self.gate.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        {
            let mut job = record.lock().await;
            if job.is_terminal() {
                // Cancelled while still queued.
                return;
            }
            job.mark_processing();
        }
        let _ = self.events.send(Event::job(id, None, "status", "processing"));
        tracing::info!(job_id = %id, "job processing started");

        let deadline = self
            .config
            .job_deadline
            .map(|total| (total, Instant::now() + total));
        let mut completed_weight = 0.0_f64;

        for stage in GenerationStage::pipeline_order() {
            if self.halted(&record).await {
                tracing::info!(job_id = %id, stage = %stage, "cancellation observed at stage boundary");
                return;
            }
            if let Some((total, at)) = deadline
                && Instant::now() >= at
            {
                record.lock().await.fail_with(
                    stage,
                    ErrorClass::Transient,
                    format!("job deadline of {}s exceeded", total.as_secs()),
                );
                let _ = self
                    .events
                    .send(Event::job(id, Some(stage), "status", "failed: deadline exceeded"));
                tracing::warn!(job_id = %id, stage = %stage, "job deadline exceeded");
                return;
            }

            let weight = self.config.weights.weight(stage);
            record.lock().await.enter_stage(stage);
            let _ = self.events.send(Event::job(id, Some(stage), "stage", "entered"));

            let Some(plan) = self.plans.get(&stage) else {
                // Internal stage: no collaborator, contributes its weight.
                completed_weight += weight;
                record.lock().await.advance_progress(completed_weight);
                continue;
            };

            let ctx = {
                let job = record.lock().await;
                StageContext {
                    job_id: id,
                    stage,
                    request: Arc::new(job.request.clone()),
                    results: job.stage_results.clone(),
                    progress: ProgressReporter::attached(
                        record.clone(),
                        stage,
                        completed_weight,
                        weight,
                        self.events.clone(),
                    ),
                }
            };
            let limiter = plan
                .rate_class
                .as_ref()
                .and_then(|class| self.limiters.get(class))
                .cloned();
            let acquire_wait = plan
                .rate_class
                .as_deref()
                .map(|class| self.config.rate_limit_for(class).max_wait)
                .unwrap_or(Duration::ZERO);

            let outcome = plan.chain.invoke(&ctx, limiter, acquire_wait).await;

            if self.halted(&record).await {
                // The attempt was allowed to finish; its result is dropped.
                let _ = self
                    .events
                    .send(Event::job(id, Some(stage), "cancel", "in-flight result discarded"));
                tracing::info!(job_id = %id, stage = %stage, "cancelled mid-stage, result discarded");
                return;
            }

            match outcome {
                Ok(success) => {
                    completed_weight += weight;
                    {
                        let mut job = record.lock().await;
                        job.complete_stage(stage, success.output.payload, success.total_attempts);
                        job.advance_progress(completed_weight);
                    }
                    let _ = self.events.send(Event::job(
                        id,
                        Some(stage),
                        "stage",
                        format!("completed via {}", success.served_by),
                    ));
                }
                Err(chain_error) => {
                    let kind = chain_error.last_error().class();
                    {
                        let mut job = record.lock().await;
                        job.record_attempts(stage, chain_error.total_attempts);
                        job.fail_with(stage, kind, chain_error.to_string());
                    }
                    let _ = self
                        .events
                        .send(Event::job(id, Some(stage), "status", "failed"));
                    tracing::error!(
                        job_id = %id,
                        stage = %stage,
                        error = %chain_error,
                        "stage exhausted primary and all fallbacks"
                    );
                    return;
                }
            }
        }

        record.lock().await.complete();
        let _ = self.events.send(Event::job(
            id,
            Some(GenerationStage::Completed),
            "status",
            "completed",
        ));
        tracing::info!(job_id = %id, "job completed");
    }

    /// A terminal status means the worker must stop touching the job.
    async fn halted(&self, record: &Arc<Mutex<Job>>) -> bool {
        record.lock().await.is_terminal()
    }
}
