//! Job registry: the single source of truth for job records.
//!
//! The registry owns the map of in-flight and finished jobs. Locking follows
//! the two-level discipline from the concurrency model: a registry-level
//! `RwLock` guards insertion, listing, and removal, while each job carries
//! its own `Mutex` so unrelated jobs never serialize behind one another.
//! Status reads clone a consistent snapshot and are side-effect free.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::job::{Job, JobFailure, JobRequest, JobSummary};
use crate::types::{GenerationStage, JobId, JobStatus};

/// Errors from registry bookkeeping operations.
#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("job not found: {id}")]
    #[diagnostic(code(reelforge::registry::not_found))]
    NotFound { id: JobId },

    /// Removal is only allowed once a job is terminal; retention of finished
    /// jobs is an external cleanup concern.
    #[error("job {id} is still {status}, refusing to remove")]
    #[diagnostic(
        code(reelforge::registry::not_terminal),
        help("Cancel the job or wait for it to finish before removing it.")
    )]
    NotTerminal { id: JobId, status: JobStatus },
}

/// Acknowledgement of a cancellation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CancelOutcome {
    /// The job was cancelled by this request.
    Cancelled,
    /// The job had already reached a terminal state; nothing changed.
    AlreadyTerminal { status: JobStatus },
    /// No job with that id exists.
    NotFound,
}

/// Point-in-time status view of one job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub id: JobId,
    pub status: JobStatus,
    pub current_stage: GenerationStage,
    pub progress: f64,
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Remaining wall-clock estimate extrapolated from elapsed time and
    /// progress; absent until enough progress exists to extrapolate from,
    /// and absent on terminal jobs.
    pub estimated_remaining_secs: Option<f64>,
}

impl StatusReport {
    fn from_job(job: &Job) -> Self {
        let estimated_remaining_secs = if job.status == JobStatus::Processing
            && job.progress > 0.01
        {
            let elapsed = (Utc::now() - job.created_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64();
            Some(elapsed * (1.0 - job.progress) / job.progress)
        } else {
            None
        };
        Self {
            id: job.id,
            status: job.status,
            current_stage: job.current_stage,
            progress: job.progress,
            error: job.error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            estimated_remaining_secs,
        }
    }
}

/// Filter for [`JobRegistry::list`]; unset fields match everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub stage: Option<GenerationStage>,
}

impl JobFilter {
    #[must_use]
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_stage(mut self, stage: GenerationStage) -> Self {
        self.stage = Some(stage);
        self
    }

    fn matches(&self, summary: &JobSummary) -> bool {
        self.status.is_none_or(|s| summary.status == s)
            && self.stage.is_none_or(|s| summary.current_stage == s)
    }
}

/// Offset/limit pagination for listings.
#[derive(Clone, Copy, Debug)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// Per-status job counts, for monitoring surfaces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Owner of all job records.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<FxHashMap<JobId, Arc<Mutex<Job>>>>,
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh `Queued` job and hand back its record.
    pub async fn create(&self, request: JobRequest) -> (JobId, Arc<Mutex<Job>>) {
        let job = Job::new(request);
        let id = job.id;
        let record = Arc::new(Mutex::new(job));
        self.jobs.write().await.insert(id, record.clone());
        (id, record)
    }

    /// The shared record for `id`, if present.
    pub async fn get(&self, id: JobId) -> Option<Arc<Mutex<Job>>> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// Side-effect-free status snapshot.
    pub async fn status(&self, id: JobId) -> Option<StatusReport> {
        let record = self.get(id).await?;
        let job = record.lock().await;
        Some(StatusReport::from_job(&job))
    }

    /// Request cancellation. Only `Queued` and `Processing` jobs transition;
    /// the running worker observes the new status at its next stage boundary.
    pub async fn cancel(&self, id: JobId) -> CancelOutcome {
        let Some(record) = self.get(id).await else {
            return CancelOutcome::NotFound;
        };
        let mut job = record.lock().await;
        if job.cancel() {
            tracing::info!(job_id = %id, "job cancelled");
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::AlreadyTerminal { status: job.status }
        }
    }

    /// Filtered, newest-first page of job summaries.
    pub async fn list(&self, filter: JobFilter, page: Page) -> Vec<JobSummary> {
        let records: Vec<Arc<Mutex<Job>>> = self.jobs.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(records.len());
        for record in records {
            let summary = record.lock().await.summary();
            if filter.matches(&summary) {
                summaries.push(summary);
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect()
    }

    /// Per-status counts over every known job.
    pub async fn statistics(&self) -> JobStatistics {
        let records: Vec<Arc<Mutex<Job>>> = self.jobs.read().await.values().cloned().collect();
        let mut stats = JobStatistics::default();
        for record in records {
            let status = record.lock().await.status;
            stats.total += 1;
            match status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Delete a terminal job's record.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotTerminal`] while the job could still be mutated,
    /// [`RegistryError::NotFound`] for unknown ids.
    pub async fn remove(&self, id: JobId) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs.get(&id).ok_or(RegistryError::NotFound { id })?;
        let status = record.lock().await.status;
        if !status.is_terminal() {
            return Err(RegistryError::NotTerminal { id, status });
        }
        jobs.remove(&id);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
