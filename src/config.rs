//! Pipeline configuration: stage weights, resilience tuning, and limits.
//!
//! Everything tunable rather than contractual lives here: the per-stage
//! progress weights, default retry/breaker settings, rate-limit classes,
//! job concurrency, and the optional whole-job deadline.
//! A handful of operational knobs can be overridden from the environment
//! (via `.env` through dotenvy) without touching code.

use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::resilience::{BreakerSettings, HealthThresholds, RetryPolicy};
use crate::types::GenerationStage;

/// Relative progress weight of each stage, summing to 1.0.
///
/// Weights are configuration, not contract: callers may re-balance them to
/// match observed stage durations. [`normalized`](Self::normalized) rescales
/// a non-unit sum rather than rejecting it, logging a warning the way the
/// rest of the crate reports recoverable config drift.
#[derive(Clone, Debug)]
pub struct StageWeights {
    weights: FxHashMap<GenerationStage, f64>,
}

impl StageWeights {
    /// Custom weights; missing stages weigh zero.
    #[must_use]
    pub fn new(weights: FxHashMap<GenerationStage, f64>) -> Self {
        Self { weights }.normalized()
    }

    /// Rescale so the pipeline stages sum to 1.0.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let total: f64 = GenerationStage::pipeline_order()
            .iter()
            .map(|stage| self.weights.get(stage).copied().unwrap_or(0.0))
            .sum();
        if total <= 0.0 {
            tracing::warn!("stage weights sum to zero, falling back to defaults");
            return Self::default();
        }
        if (total - 1.0).abs() > 0.01 {
            tracing::warn!(total, "stage weights do not sum to 1.0, normalizing");
            for weight in self.weights.values_mut() {
                *weight /= total;
            }
        }
        self
    }

    /// Weight of one stage (0.0 if unknown).
    #[must_use]
    pub fn weight(&self, stage: GenerationStage) -> f64 {
        self.weights.get(&stage).copied().unwrap_or(0.0)
    }

    /// Sum of the weights of all stages strictly before `stage`.
    #[must_use]
    pub fn completed_before(&self, stage: GenerationStage) -> f64 {
        GenerationStage::pipeline_order()
            .iter()
            .filter(|s| s.precedes(&stage))
            .map(|s| self.weight(*s))
            .sum()
    }
}

impl Default for StageWeights {
    fn default() -> Self {
        let mut weights = FxHashMap::default();
        weights.insert(GenerationStage::Initializing, 0.05);
        weights.insert(GenerationStage::Researching, 0.15);
        weights.insert(GenerationStage::Scripting, 0.20);
        weights.insert(GenerationStage::AssetSourcing, 0.25);
        weights.insert(GenerationStage::AudioGeneration, 0.15);
        weights.insert(GenerationStage::VideoAssembly, 0.15);
        weights.insert(GenerationStage::Finalizing, 0.05);
        Self { weights }
    }
}

/// Token-bucket parameters for one collaborator class.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitSettings {
    pub capacity: f64,
    pub refill_per_sec: f64,
    /// Bounded wait for one acquisition before it reports throttling.
    pub max_wait: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 2.0,
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Top-level pipeline tuning, injected at construction.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use reelforge::config::PipelineConfig;
///
/// let config = PipelineConfig::default()
///     .with_max_concurrent_jobs(4)
///     .with_job_deadline(Some(Duration::from_secs(600)));
/// ```
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub weights: StageWeights,
    /// Default retry policy for collaborators without an override.
    pub retry: RetryPolicy,
    /// Default breaker settings for every dependency.
    pub breaker: BreakerSettings,
    /// Named rate-limit classes; stages reference these by name.
    pub rate_limits: FxHashMap<String, RateLimitSettings>,
    /// Fallback settings for classes not listed in `rate_limits`.
    pub default_rate_limit: RateLimitSettings,
    pub max_concurrent_jobs: usize,
    /// Whole-job deadline; exceeding it fails the job with a timeout error.
    pub job_deadline: Option<Duration>,
    pub health: HealthThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            weights: StageWeights::default(),
            retry: RetryPolicy::default(),
            breaker: BreakerSettings::default(),
            rate_limits: FxHashMap::default(),
            default_rate_limit: RateLimitSettings::default(),
            max_concurrent_jobs: 8,
            job_deadline: None,
            health: HealthThresholds::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults with operational overrides pulled from the environment:
    /// `REELFORGE_MAX_CONCURRENT_JOBS` and `REELFORGE_JOB_DEADLINE_SECS`.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Ok(value) = std::env::var("REELFORGE_MAX_CONCURRENT_JOBS")
            && let Ok(parsed) = value.parse::<usize>()
            && parsed > 0
        {
            config.max_concurrent_jobs = parsed;
        }
        if let Ok(value) = std::env::var("REELFORGE_JOB_DEADLINE_SECS")
            && let Ok(parsed) = value.parse::<u64>()
            && parsed > 0
        {
            config.job_deadline = Some(Duration::from_secs(parsed));
        }
        config
    }

    #[must_use]
    pub fn with_weights(mut self, weights: StageWeights) -> Self {
        self.weights = weights;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }

    #[must_use]
    pub fn with_rate_limit(
        mut self,
        class: impl Into<String>,
        settings: RateLimitSettings,
    ) -> Self {
        self.rate_limits.insert(class.into(), settings);
        self
    }

    #[must_use]
    pub fn with_max_concurrent_jobs(mut self, limit: usize) -> Self {
        self.max_concurrent_jobs = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_job_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.job_deadline = deadline;
        self
    }

    #[must_use]
    pub fn with_health_thresholds(mut self, health: HealthThresholds) -> Self {
        self.health = health;
        self
    }

    /// Settings for a rate-limit class, falling back to the default.
    #[must_use]
    pub fn rate_limit_for(&self, class: &str) -> RateLimitSettings {
        self.rate_limits
            .get(class)
            .copied()
            .unwrap_or(self.default_rate_limit)
    }
}
