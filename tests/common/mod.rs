#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use reelforge::job::JobRequest;
use reelforge::resilience::RetryPolicy;
use reelforge::stage::{Collaborator, StageContext, StageError, StageOutput};

/// Request that passes validation.
pub fn valid_request() -> JobRequest {
    JobRequest::new("A short history of the transistor")
}

/// Retry policy with millisecond backoff for fast tests.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_base_delay(Duration::from_millis(1))
        .with_jitter(false)
}

/// Succeeds immediately with a fixed payload.
pub struct StaticCollaborator {
    name: &'static str,
}

impl StaticCollaborator {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self { name })
    }
}

#[async_trait]
impl Collaborator for StaticCollaborator {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        ctx.progress.report(0.5).await;
        Ok(StageOutput::json(
            json!({ "produced_by": self.name, "stage": ctx.stage.key() }),
        ))
    }
}

/// Fails with a transient error on every call.
pub struct FailingCollaborator {
    name: &'static str,
    pub calls: AtomicU32,
}

impl FailingCollaborator {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Collaborator for FailingCollaborator {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, _ctx: StageContext) -> Result<StageOutput, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StageError::transient(self.name, "service unavailable"))
    }
}

/// Fails `fail_first` times, then succeeds.
pub struct FlakyCollaborator {
    name: &'static str,
    fail_first: u32,
    calls: AtomicU32,
}

impl FlakyCollaborator {
    pub fn new(name: &'static str, fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail_first,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Collaborator for FlakyCollaborator {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, _ctx: StageContext) -> Result<StageOutput, StageError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
            Err(StageError::transient(self.name, "flaky"))
        } else {
            Ok(StageOutput::json(json!({ "produced_by": self.name })))
        }
    }
}

/// Blocks inside `invoke` until the shared gate opens, then succeeds.
///
/// Lets tests hold many jobs mid-stage and release them all at once.
pub struct GatedCollaborator {
    name: &'static str,
    gate: watch::Receiver<bool>,
    pub entered: AtomicU32,
}

impl GatedCollaborator {
    pub fn new(name: &'static str, gate: watch::Receiver<bool>) -> Arc<Self> {
        Arc::new(Self {
            name,
            gate,
            entered: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Collaborator for GatedCollaborator {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, _ctx: StageContext) -> Result<StageOutput, StageError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.clone();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| StageError::transient(self.name, "gate dropped"))?;
        Ok(StageOutput::json(json!({ "produced_by": self.name })))
    }
}

/// Reports sub-progress in steps with a small delay between them.
pub struct SteppedCollaborator {
    name: &'static str,
    steps: u32,
    step_delay: Duration,
}

impl SteppedCollaborator {
    pub fn new(name: &'static str, steps: u32, step_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            steps,
            step_delay,
        })
    }
}

#[async_trait]
impl Collaborator for SteppedCollaborator {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        for step in 1..=self.steps {
            tokio::time::sleep(self.step_delay).await;
            ctx.progress.report(f64::from(step) / f64::from(self.steps)).await;
        }
        Ok(StageOutput::json(json!({ "produced_by": self.name })))
    }
}
