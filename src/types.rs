//! Core identifier and state types for the reelforge pipeline.
//!
//! This module defines the fundamental vocabulary used throughout the crate:
//! which stages a generation job moves through, which lifecycle states a job
//! can be in, and how jobs are identified. These are the domain concepts that
//! define what a pipeline run *is*; the machinery that drives them lives in
//! [`crate::pipeline`] and [`crate::registry`].
//!
//! # Key Types
//!
//! - [`JobId`]: opaque unique identifier for one generation request
//! - [`JobStatus`]: lifecycle state (`Queued` through the terminal states)
//! - [`GenerationStage`]: the fixed, ordered stage sequence of the pipeline
//!
//! # Examples
//!
//! ```rust
//! use reelforge::types::{GenerationStage, JobStatus};
//!
//! let stage = GenerationStage::Researching;
//! assert_eq!(stage.key(), "researching");
//! assert_eq!(stage.next(), Some(GenerationStage::Scripting));
//!
//! assert!(!JobStatus::Processing.is_terminal());
//! assert!(JobStatus::Cancelled.is_terminal());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque unique identifier for a generation job.
///
/// Assigned once at submission and immutable afterwards. Wraps a v4 UUID so
/// identifiers are safe to hand to external callers and to use as storage keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh job identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a generation job.
///
/// Transitions are driven exclusively by the pipeline worker (and by an
/// explicit cancellation request): `Queued → Processing → Completed | Failed`,
/// with `Cancelled` reachable from `Queued` or `Processing`. Once a terminal
/// state is reached no further transitions occur and the job record becomes
/// immutable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted by the registry, not yet picked up by a worker.
    Queued,
    /// A worker task is advancing the job through stages.
    Processing,
    /// All stages finished; `progress` is exactly 1.0.
    Completed,
    /// A stage exhausted its retries and fallbacks; failure detail is recorded.
    Failed,
    /// Cancelled by explicit request before completion.
    Cancelled,
}

impl JobStatus {
    /// Returns `true` for `Completed`, `Failed`, and `Cancelled`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One step of the fixed generation sequence.
///
/// The pipeline advances every job through [`pipeline_order`](Self::pipeline_order)
/// front to back; `Completed` is the resting value of `current_stage` once the
/// job finishes. A stage may be retried in place, but `current_stage` never
/// moves backwards.
///
/// # Persistence
///
/// Stage values round-trip through [`key`](Self::key)/[`decode`](Self::decode)
/// for storage under string keys (`stage_results`, `retry_counts`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStage {
    /// Request intake and working-state setup. Runs internally, no collaborator.
    Initializing,
    /// Topic research via the research collaborator.
    Researching,
    /// Script/scene generation from research output.
    Scripting,
    /// Visual asset search and acquisition.
    AssetSourcing,
    /// Narration synthesis.
    AudioGeneration,
    /// Timeline assembly of assets and audio.
    VideoAssembly,
    /// Muxing, validation, and artifact registration.
    Finalizing,
    /// Terminal marker once `Finalizing` succeeds.
    Completed,
}

impl GenerationStage {
    /// The seven working stages, in execution order (excludes `Completed`).
    pub const fn pipeline_order() -> [GenerationStage; 7] {
        [
            Self::Initializing,
            Self::Researching,
            Self::Scripting,
            Self::AssetSourcing,
            Self::AudioGeneration,
            Self::VideoAssembly,
            Self::Finalizing,
        ]
    }

    /// Position of this stage in the full sequence (0-based).
    #[must_use]
    pub fn ordinal(&self) -> usize {
        match self {
            Self::Initializing => 0,
            Self::Researching => 1,
            Self::Scripting => 2,
            Self::AssetSourcing => 3,
            Self::AudioGeneration => 4,
            Self::VideoAssembly => 5,
            Self::Finalizing => 6,
            Self::Completed => 7,
        }
    }

    /// The stage that follows this one, or `None` from `Completed`.
    #[must_use]
    pub fn next(&self) -> Option<GenerationStage> {
        match self {
            Self::Initializing => Some(Self::Researching),
            Self::Researching => Some(Self::Scripting),
            Self::Scripting => Some(Self::AssetSourcing),
            Self::AssetSourcing => Some(Self::AudioGeneration),
            Self::AudioGeneration => Some(Self::VideoAssembly),
            Self::VideoAssembly => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Completed),
            Self::Completed => None,
        }
    }

    /// Snake-case storage key for this stage, also its display form.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Researching => "researching",
            Self::Scripting => "scripting",
            Self::AssetSourcing => "asset_sourcing",
            Self::AudioGeneration => "audio_generation",
            Self::VideoAssembly => "video_assembly",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
        }
    }

    /// Decode a persisted stage key back into a stage.
    ///
    /// Returns `None` for unrecognized keys rather than guessing; callers
    /// decide whether an unknown key is an error or skippable.
    #[must_use]
    pub fn decode(s: &str) -> Option<GenerationStage> {
        Self::pipeline_order()
            .into_iter()
            .chain(std::iter::once(Self::Completed))
            .find(|stage| stage.key() == s)
    }

    /// Returns `true` if `other` comes strictly later in the sequence.
    #[must_use]
    pub fn precedes(&self, other: &GenerationStage) -> bool {
        self.ordinal() < other.ordinal()
    }
}

impl fmt::Display for GenerationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
