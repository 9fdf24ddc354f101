use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::watch;

use reelforge::config::PipelineConfig;
use reelforge::event_bus::{Event, EventBus, MemorySink};
use reelforge::pipeline::{Pipeline, StageBinding};
use reelforge::resilience::{BreakerSettings, ServiceHealth};
use reelforge::stage::ErrorClass;
use reelforge::types::{GenerationStage, JobStatus};

mod common;
use common::*;

/// Pipeline with a static collaborator bound to every external stage.
fn fully_bound() -> reelforge::pipeline::PipelineBuilder {
    Pipeline::builder(PipelineConfig::default())
        .bind(
            GenerationStage::Researching,
            StageBinding::new(StaticCollaborator::new("research_api")),
        )
        .bind(
            GenerationStage::Scripting,
            StageBinding::new(StaticCollaborator::new("script_llm")),
        )
        .bind(
            GenerationStage::AssetSourcing,
            StageBinding::new(StaticCollaborator::new("stock_assets")),
        )
        .bind(
            GenerationStage::AudioGeneration,
            StageBinding::new(StaticCollaborator::new("tts")),
        )
        .bind(
            GenerationStage::VideoAssembly,
            StageBinding::new(StaticCollaborator::new("renderer")),
        )
        .bind(
            GenerationStage::Finalizing,
            StageBinding::new(StaticCollaborator::new("muxer")),
        )
}

#[tokio::test]
async fn full_run_reaches_completed_with_all_stage_results() {
    let pipeline = fully_bound().build();
    let id = pipeline.submit(valid_request()).await.unwrap();
    pipeline.drain().await;

    let report = pipeline.status(id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.current_stage, GenerationStage::Completed);
    assert!((report.progress - 1.0).abs() < f64::EPSILON);
    assert!(report.error.is_none());

    let record = pipeline.registry().get(id).await.unwrap();
    let job = record.lock().await;
    for stage in [
        GenerationStage::Researching,
        GenerationStage::Scripting,
        GenerationStage::AssetSourcing,
        GenerationStage::AudioGeneration,
        GenerationStage::VideoAssembly,
        GenerationStage::Finalizing,
    ] {
        let payload = job.stage_results.get(stage.key()).unwrap();
        assert_eq!(payload["stage"], stage.key());
    }
    // Internal stage stores no payload.
    assert!(!job.stage_results.contains_key("initializing"));
}

#[tokio::test]
async fn failed_stage_halts_pipeline_and_records_failure() {
    let pipeline = fully_bound()
        .bind(
            GenerationStage::AssetSourcing,
            StageBinding::new(FailingCollaborator::new("stock_assets")).with_retry(fast_retry(2)),
        )
        .build();
    let id = pipeline.submit(valid_request()).await.unwrap();
    pipeline.drain().await;

    let report = pipeline.status(id).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.progress < 1.0);

    let failure = report.error.unwrap();
    assert_eq!(failure.stage, GenerationStage::AssetSourcing);
    assert_eq!(failure.kind, ErrorClass::Transient);
    assert!(failure.message.contains("stock_assets"));

    let record = pipeline.registry().get(id).await.unwrap();
    let job = record.lock().await;
    // Earlier stages kept their results, later stages never ran.
    assert!(job.stage_results.contains_key("scripting"));
    assert!(!job.stage_results.contains_key("asset_sourcing"));
    assert!(!job.stage_results.contains_key("audio_generation"));
    assert_eq!(job.retry_counts.get("asset_sourcing"), Some(&2));
}

#[tokio::test]
async fn fallback_satisfies_stage_when_primary_is_down() {
    let primary = FailingCollaborator::new("primary_assets");
    let pipeline = fully_bound()
        .bind(
            GenerationStage::AssetSourcing,
            StageBinding::new(primary.clone())
                .with_fallback(StaticCollaborator::new("backup_assets"))
                .with_retry(fast_retry(2)),
        )
        .build();
    let id = pipeline.submit(valid_request()).await.unwrap();
    pipeline.drain().await;

    let report = pipeline.status(id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(primary.calls.load(Ordering::SeqCst), 2);

    let record = pipeline.registry().get(id).await.unwrap();
    let job = record.lock().await;
    assert_eq!(
        job.stage_results.get("asset_sourcing").unwrap()["produced_by"],
        "backup_assets"
    );
    // Two failed attempts on the primary plus one success on the backup.
    assert_eq!(job.retry_counts.get("asset_sourcing"), Some(&3));
}

#[tokio::test]
async fn transient_flake_recovers_within_retry_budget() {
    let pipeline = fully_bound()
        .bind(
            GenerationStage::Researching,
            StageBinding::new(FlakyCollaborator::new("research_api", 2))
                .with_retry(fast_retry(3)),
        )
        .build();
    let id = pipeline.submit(valid_request()).await.unwrap();
    pipeline.drain().await;

    let report = pipeline.status(id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);

    let record = pipeline.registry().get(id).await.unwrap();
    assert_eq!(
        record.lock().await.retry_counts.get("researching"),
        Some(&3)
    );
}

#[tokio::test]
async fn cancellation_mid_stage_discards_the_inflight_result() {
    let (open, gate) = watch::channel(false);
    let gated = GatedCollaborator::new("stock_assets", gate);
    let pipeline = fully_bound()
        .bind(
            GenerationStage::AssetSourcing,
            StageBinding::new(gated.clone()),
        )
        .build();

    let id = pipeline.submit(valid_request()).await.unwrap();
    // Wait until the job is blocked inside asset sourcing.
    while gated.entered.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        pipeline.cancel(id).await,
        reelforge::registry::CancelOutcome::Cancelled
    );
    // The next status read already observes the cancellation.
    assert_eq!(
        pipeline.status(id).await.unwrap().status,
        JobStatus::Cancelled
    );

    open.send(true).unwrap();
    pipeline.drain().await;

    let record = pipeline.registry().get(id).await.unwrap();
    let job = record.lock().await;
    assert_eq!(job.status, JobStatus::Cancelled);
    // The finished attempt was discarded and no later stage ever ran.
    assert!(!job.stage_results.contains_key("asset_sourcing"));
    assert!(!job.stage_results.contains_key("audio_generation"));
}

#[tokio::test(start_paused = true)]
async fn job_deadline_fails_the_job_at_a_stage_boundary() {
    let pipeline = Pipeline::builder(
        PipelineConfig::default().with_job_deadline(Some(Duration::from_secs(3))),
    )
    .bind(
        GenerationStage::Researching,
        StageBinding::new(SteppedCollaborator::new(
            "research_api",
            3,
            Duration::from_secs(2),
        )),
    )
    .bind(
        GenerationStage::Scripting,
        StageBinding::new(StaticCollaborator::new("script_llm")),
    )
    .build();

    let id = pipeline.submit(valid_request()).await.unwrap();
    pipeline.drain().await;

    let report = pipeline.status(id).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    let failure = report.error.unwrap();
    assert!(failure.message.contains("deadline"));
    // Researching finished (6s > 3s deadline), so the boundary check fired
    // before scripting started.
    assert_eq!(failure.stage, GenerationStage::Scripting);
}

#[tokio::test]
async fn breaker_trip_degrades_reported_health() {
    let pipeline = Pipeline::builder(PipelineConfig::default())
        .bind(
            GenerationStage::Researching,
            StageBinding::new(FailingCollaborator::new("research_api"))
                .with_retry(fast_retry(3))
                .with_breaker(BreakerSettings::default().with_failure_threshold(3))
                .critical(true),
        )
        .bind(
            GenerationStage::Scripting,
            StageBinding::new(StaticCollaborator::new("script_llm")),
        )
        .build();

    assert_eq!(pipeline.health().status, ServiceHealth::Healthy);

    let id = pipeline.submit(valid_request()).await.unwrap();
    pipeline.drain().await;
    assert_eq!(
        pipeline.status(id).await.unwrap().status,
        JobStatus::Failed
    );

    let health = pipeline.health();
    assert_eq!(health.status, ServiceHealth::Degraded);
    let research = health
        .dependencies
        .iter()
        .find(|d| d.name == "research_api")
        .unwrap();
    assert_eq!(research.state, reelforge::resilience::BreakerState::Open);
    assert!(research.critical);
    assert_eq!(research.failures, 3);
}

#[tokio::test]
async fn progress_is_monotone_across_a_run() {
    let pipeline = fully_bound()
        .bind(
            GenerationStage::Scripting,
            StageBinding::new(SteppedCollaborator::new(
                "script_llm",
                4,
                Duration::from_millis(5),
            )),
        )
        .build();
    let id = pipeline.submit(valid_request()).await.unwrap();

    let mut observed = Vec::new();
    loop {
        let report = pipeline.status(id).await.unwrap();
        observed.push(report.progress);
        if report.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    pipeline.drain().await;

    assert!(observed.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*observed.last().unwrap(), 1.0);
}

#[tokio::test]
async fn events_trace_the_run() {
    let sink = MemorySink::new();
    let pipeline = fully_bound()
        .with_event_bus(EventBus::with_sink(sink.clone()))
        .build();
    let id = pipeline.submit(valid_request()).await.unwrap();
    pipeline.drain().await;
    // Give the listener a beat to flush the queue before stopping it.
    tokio::time::sleep(Duration::from_millis(20)).await;
    pipeline.shutdown().await;

    let events = sink.snapshot();
    let saw_queued = events
        .iter()
        .any(|e| matches!(e, Event::Job(j) if j.job_id == id && j.message == "queued"));
    let saw_completed = events
        .iter()
        .any(|e| matches!(e, Event::Job(j) if j.job_id == id && j.message == "completed"));
    let saw_attempts = events.iter().any(|e| matches!(e, Event::Attempt(_)));
    assert!(saw_queued && saw_completed && saw_attempts);
}
