//! Job records: the single source of truth for one generation request.
//!
//! A [`Job`] is created by the registry at submission and mutated exclusively
//! through the invariant-preserving methods here, always under the per-job
//! lock the registry hands out. The methods themselves enforce the
//! state-machine rules: terminal jobs are frozen, progress never regresses,
//! and the current stage only moves forward.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stage::{ErrorClass, StageError};
use crate::types::{GenerationStage, JobId, JobStatus};

/// Bounds for [`JobRequest::validate`]. Prompts and durations outside these
/// ranges are rejected before a job record is ever created.
pub const PROMPT_MIN_CHARS: usize = 10;
pub const PROMPT_MAX_CHARS: usize = 2000;
pub const DURATION_MIN_SECS: u32 = 10;
pub const DURATION_MAX_SECS: u32 = 600;

/// Narration/visual style requested for the generated video.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStyle {
    #[default]
    Professional,
    Casual,
    Educational,
    Entertainment,
    Documentary,
}

/// Output quality tier; collaborators map this to their own encoder settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoQuality {
    Low,
    Medium,
    #[default]
    High,
    Ultra,
}

/// Parameters of one generation request, validated at submission.
///
/// # Examples
///
/// ```rust
/// use reelforge::job::{JobRequest, VideoStyle};
///
/// let request = JobRequest::new("A short history of the transistor")
///     .with_duration_secs(90)
///     .with_style(VideoStyle::Educational);
/// assert!(request.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Topic prompt driving research and scripting.
    pub prompt: String,
    /// Target video length in seconds.
    pub duration_secs: u32,
    pub style: VideoStyle,
    pub quality: VideoQuality,
    /// Voice preference handed to the audio collaborator.
    pub voice: String,
}

impl JobRequest {
    /// Request with default duration (60s), style, quality, and voice.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            duration_secs: 60,
            style: VideoStyle::default(),
            quality: VideoQuality::default(),
            voice: "neutral".to_string(),
        }
    }

    #[must_use]
    pub fn with_duration_secs(mut self, secs: u32) -> Self {
        self.duration_secs = secs;
        self
    }

    #[must_use]
    pub fn with_style(mut self, style: VideoStyle) -> Self {
        self.style = style;
        self
    }

    #[must_use]
    pub fn with_quality(mut self, quality: VideoQuality) -> Self {
        self.quality = quality;
        self
    }

    #[must_use]
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    /// Check prompt and duration bounds.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<(), StageError> {
        let prompt = self.prompt.trim();
        if prompt.len() < PROMPT_MIN_CHARS || prompt.len() > PROMPT_MAX_CHARS {
            return Err(StageError::validation(format!(
                "prompt must be {PROMPT_MIN_CHARS}..={PROMPT_MAX_CHARS} characters, got {}",
                prompt.len()
            )));
        }
        if self.duration_secs < DURATION_MIN_SECS || self.duration_secs > DURATION_MAX_SECS {
            return Err(StageError::validation(format!(
                "duration must be {DURATION_MIN_SECS}..={DURATION_MAX_SECS} seconds, got {}",
                self.duration_secs
            )));
        }
        Ok(())
    }
}

/// Structured failure record, present on a job iff its status is `Failed`.
///
/// The message is composed by the pipeline from classified errors; raw
/// collaborator payloads never reach it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Stage that exhausted its retries and fallbacks.
    pub stage: GenerationStage,
    pub kind: ErrorClass,
    pub message: String,
}

/// One generation request tracked by the pipeline.
///
/// Mutable fields change only through the methods below, which uphold:
///
/// - a terminal job is immutable (every mutator becomes a no-op);
/// - `progress` is monotone non-decreasing until failure;
/// - `current_stage` never moves backwards;
/// - `error.is_some()` exactly when the status is `Failed`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub request: JobRequest,
    pub status: JobStatus,
    pub current_stage: GenerationStage,
    /// Completed stage outputs keyed by stage key. Opaque to the core.
    pub stage_results: FxHashMap<String, Value>,
    /// Overall weighted progress in `[0.0, 1.0]`.
    pub progress: f64,
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Attempt counters per stage key, for observability and bounding.
    pub retry_counts: FxHashMap<String, u32>,
}

impl Job {
    /// Fresh job in `Queued`/`Initializing` with zero progress.
    #[must_use]
    pub fn new(request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            request,
            status: JobStatus::Queued,
            current_stage: GenerationStage::Initializing,
            stage_results: FxHashMap::default(),
            progress: 0.0,
            error: None,
            created_at: now,
            updated_at: now,
            retry_counts: FxHashMap::default(),
        }
    }

    /// Whether the job has reached `Completed`, `Failed`, or `Cancelled`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move a queued job into `Processing`. No-op otherwise.
    pub fn mark_processing(&mut self) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        self.status = JobStatus::Processing;
        self.touch();
        true
    }

    /// Raise overall progress to `value` (clamped to `[0.0, 1.0]`).
    ///
    /// Returns `true` if progress actually moved. Lower-than-current values
    /// and updates on terminal jobs are discarded, which makes late
    /// sub-progress reports from a finished attempt harmless.
    pub fn advance_progress(&mut self, value: f64) -> bool {
        if self.is_terminal() {
            return false;
        }
        let value = value.clamp(0.0, 1.0);
        if value <= self.progress {
            return false;
        }
        self.progress = value;
        self.touch();
        true
    }

    /// Move `current_stage` forward to `stage`. Backward moves are ignored.
    pub fn enter_stage(&mut self, stage: GenerationStage) -> bool {
        if self.is_terminal() || stage.ordinal() < self.current_stage.ordinal() {
            return false;
        }
        if stage != self.current_stage {
            self.current_stage = stage;
            self.touch();
        }
        true
    }

    /// Record a completed stage: store its output, add its attempt count,
    /// and advance `current_stage` past it.
    pub fn complete_stage(&mut self, stage: GenerationStage, payload: Value, attempts: u32) {
        if self.is_terminal() {
            return;
        }
        self.stage_results.insert(stage.key().to_string(), payload);
        *self.retry_counts.entry(stage.key().to_string()).or_insert(0) += attempts;
        if let Some(next) = stage.next() {
            self.enter_stage(next);
        }
        self.touch();
    }

    /// Record additional attempts against a stage without completing it.
    pub fn record_attempts(&mut self, stage: GenerationStage, attempts: u32) {
        if self.is_terminal() || attempts == 0 {
            return;
        }
        *self.retry_counts.entry(stage.key().to_string()).or_insert(0) += attempts;
        self.touch();
    }

    /// Terminal transition to `Failed` with a structured failure record.
    pub fn fail(&mut self, stage: GenerationStage, error: &StageError) -> bool {
        self.fail_with(stage, error.class(), error.to_string())
    }

    /// Terminal failure with an explicit kind and composed message, used when
    /// the message aggregates more than one underlying error.
    pub fn fail_with(
        &mut self,
        stage: GenerationStage,
        kind: ErrorClass,
        message: impl Into<String>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error = Some(JobFailure {
            stage,
            kind,
            message: message.into(),
        });
        self.touch();
        true
    }

    /// Terminal transition to `Cancelled`; only valid from `Queued` or
    /// `Processing`.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.touch();
        true
    }

    /// Terminal transition to `Completed`; pins progress to exactly 1.0.
    pub fn complete(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Completed;
        self.current_stage = GenerationStage::Completed;
        self.progress = 1.0;
        self.touch();
        true
    }

    /// Lightweight read model for listings.
    #[must_use]
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            status: self.status,
            current_stage: self.current_stage,
            progress: self.progress,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Compact per-job row returned by `list`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub status: JobStatus,
    pub current_stage: GenerationStage,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> JobRequest {
        JobRequest::new("A short history of the transistor")
    }

    #[test]
    fn request_validation_bounds() {
        assert!(valid_request().validate().is_ok());
        assert!(JobRequest::new("too short").validate().is_err());
        assert!(JobRequest::new("x".repeat(2001)).validate().is_err());
        assert!(
            valid_request()
                .with_duration_secs(5)
                .validate()
                .is_err()
        );
        assert!(
            valid_request()
                .with_duration_secs(601)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn progress_is_monotone() {
        let mut job = Job::new(valid_request());
        assert!(job.advance_progress(0.3));
        assert!(!job.advance_progress(0.2));
        assert!((job.progress - 0.3).abs() < f64::EPSILON);
        assert!(job.advance_progress(0.9));
        // Values above 1.0 clamp rather than overflow.
        assert!(job.advance_progress(1.5));
        assert!((job.progress - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stage_never_moves_backwards() {
        let mut job = Job::new(valid_request());
        assert!(job.enter_stage(GenerationStage::Scripting));
        assert!(!job.enter_stage(GenerationStage::Researching));
        assert_eq!(job.current_stage, GenerationStage::Scripting);
    }

    #[test]
    fn terminal_jobs_are_frozen() {
        let mut job = Job::new(valid_request());
        job.mark_processing();
        assert!(job.cancel());
        let updated = job.updated_at;

        assert!(!job.advance_progress(0.5));
        assert!(!job.enter_stage(GenerationStage::Finalizing));
        assert!(!job.fail(
            GenerationStage::Researching,
            &StageError::transient("x", "y")
        ));
        assert!(!job.complete());
        assert!(!job.cancel());
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.updated_at, updated);
    }

    #[test]
    fn failure_record_present_iff_failed() {
        let mut job = Job::new(valid_request());
        assert!(job.error.is_none());
        job.mark_processing();
        job.fail(
            GenerationStage::AssetSourcing,
            &StageError::transient("stock_api", "connection reset"),
        );
        let failure = job.error.as_ref().unwrap();
        assert_eq!(failure.stage, GenerationStage::AssetSourcing);
        assert_eq!(failure.kind, ErrorClass::Transient);
        assert!(failure.message.contains("stock_api"));
    }

    #[test]
    fn completion_pins_progress() {
        let mut job = Job::new(valid_request());
        job.mark_processing();
        job.advance_progress(0.8);
        assert!(job.complete());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.current_stage, GenerationStage::Completed);
        assert!((job.progress - 1.0).abs() < f64::EPSILON);
    }
}
