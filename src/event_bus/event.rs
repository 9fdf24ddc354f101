use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::resilience::BreakerState;
use crate::types::{GenerationStage, JobId};

/// Structured observability event emitted by the pipeline and resilience layer.
///
/// Events flow over the bus to whatever sinks the embedding application
/// registered; the core only produces them and never blocks on delivery.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Event {
    /// Job lifecycle and stage progress.
    Job(JobEvent),
    /// Circuit breaker state transition.
    Breaker(BreakerEvent),
    /// One attempt against a dependency, with outcome and latency.
    Attempt(AttemptEvent),
    /// Free-form diagnostics from the core itself.
    Diagnostic(DiagnosticEvent),
}

impl Event {
    pub fn job(
        job_id: JobId,
        stage: Option<GenerationStage>,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Event::Job(JobEvent {
            job_id,
            stage,
            scope: scope.into(),
            message: message.into(),
        })
    }

    pub fn breaker(dependency: impl Into<String>, from: BreakerState, to: BreakerState) -> Self {
        Event::Breaker(BreakerEvent {
            dependency: dependency.into(),
            from,
            to,
        })
    }

    pub fn attempt(
        dependency: impl Into<String>,
        attempt: u32,
        latency_ms: u64,
        error: Option<String>,
    ) -> Self {
        Event::Attempt(AttemptEvent {
            dependency: dependency.into(),
            attempt,
            latency_ms,
            error,
        })
    }

    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic(DiagnosticEvent {
            scope: scope.into(),
            message: message.into(),
        })
    }

    pub fn scope_label(&self) -> &str {
        match self {
            Event::Job(e) => &e.scope,
            Event::Breaker(_) => "breaker",
            Event::Attempt(_) => "attempt",
            Event::Diagnostic(e) => &e.scope,
        }
    }

    /// Normalized JSON shape for log shippers and stream consumers:
    /// `{"type", "scope", "message", "timestamp", "metadata"}`.
    pub fn to_json_value(&self) -> Value {
        let (event_type, metadata) = match self {
            Event::Job(e) => {
                let mut meta = serde_json::Map::new();
                meta.insert("job_id".to_string(), json!(e.job_id.to_string()));
                if let Some(stage) = e.stage {
                    meta.insert("stage".to_string(), json!(stage.key()));
                }
                ("job", Value::Object(meta))
            }
            Event::Breaker(e) => {
                let mut meta = serde_json::Map::new();
                meta.insert("dependency".to_string(), json!(e.dependency));
                meta.insert("from".to_string(), json!(e.from.key()));
                meta.insert("to".to_string(), json!(e.to.key()));
                ("breaker", Value::Object(meta))
            }
            Event::Attempt(e) => {
                let mut meta = serde_json::Map::new();
                meta.insert("dependency".to_string(), json!(e.dependency));
                meta.insert("attempt".to_string(), json!(e.attempt));
                meta.insert("latency_ms".to_string(), json!(e.latency_ms));
                meta.insert("ok".to_string(), json!(e.error.is_none()));
                ("attempt", Value::Object(meta))
            }
            Event::Diagnostic(_) => ("diagnostic", Value::Object(serde_json::Map::new())),
        };

        json!({
            "type": event_type,
            "scope": self.scope_label(),
            "message": self.to_string(),
            "timestamp": Utc::now().to_rfc3339(),
            "metadata": metadata,
        })
    }

    /// Compact JSON string form of [`to_json_value`](Self::to_json_value).
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Job(e) => match e.stage {
                Some(stage) => write!(f, "[{}@{stage}] {}", e.job_id, e.message),
                None => write!(f, "[{}] {}", e.job_id, e.message),
            },
            Event::Breaker(e) => write!(
                f,
                "breaker '{}': {} -> {}",
                e.dependency,
                e.from.key(),
                e.to.key()
            ),
            Event::Attempt(e) => match &e.error {
                None => write!(
                    f,
                    "{} attempt {} ok ({} ms)",
                    e.dependency, e.attempt, e.latency_ms
                ),
                Some(err) => write!(
                    f,
                    "{} attempt {} failed ({} ms): {err}",
                    e.dependency, e.attempt, e.latency_ms
                ),
            },
            Event::Diagnostic(e) => write!(f, "{}", e.message),
        }
    }
}

/// Job-scoped event: status changes, stage entry/exit, progress, discards.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub stage: Option<GenerationStage>,
    pub scope: String,
    pub message: String,
}

/// Circuit breaker transition, one per state change.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BreakerEvent {
    pub dependency: String,
    pub from: BreakerState,
    pub to: BreakerState,
}

/// A single call attempt against a dependency.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AttemptEvent {
    pub dependency: String,
    /// 1-based attempt number within the current retry run.
    pub attempt: u32,
    pub latency_ms: u64,
    /// `None` on success, rendered error text on failure.
    pub error: Option<String>,
}

/// Free-form diagnostic from the core.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticEvent {
    pub scope: String,
    pub message: String,
}
