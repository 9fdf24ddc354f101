use std::sync::atomic::Ordering;

use tokio::sync::watch;

use reelforge::config::PipelineConfig;
use reelforge::pipeline::{Pipeline, StageBinding};
use reelforge::registry::{CancelOutcome, JobFilter, Page};
use reelforge::types::{GenerationStage, JobStatus};

mod common;
use common::*;

const JOBS: usize = 100;

/// Submits 100 jobs that all block inside the researching stage, cancels
/// every third one while they are queued or in flight, then releases the
/// gate and checks the final ledger.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_jobs_with_interleaved_cancellations() {
    let (open, gate) = watch::channel(false);
    let gated = GatedCollaborator::new("research_api", gate);
    let pipeline = Pipeline::builder(PipelineConfig::default().with_max_concurrent_jobs(16))
        .bind(GenerationStage::Researching, StageBinding::new(gated.clone()))
        .bind(
            GenerationStage::Scripting,
            StageBinding::new(StaticCollaborator::new("script_llm")),
        )
        .bind(
            GenerationStage::Finalizing,
            StageBinding::new(StaticCollaborator::new("muxer")),
        )
        .build();

    let mut ids = Vec::with_capacity(JOBS);
    for _ in 0..JOBS {
        ids.push(pipeline.submit(valid_request()).await.unwrap());
    }

    let mut expected_cancelled = 0;
    for (i, id) in ids.iter().enumerate() {
        if i % 3 == 0 {
            assert_eq!(pipeline.cancel(*id).await, CancelOutcome::Cancelled);
            expected_cancelled += 1;
        }
    }

    open.send(true).unwrap();
    pipeline.drain().await;

    let stats = pipeline.statistics().await;
    assert_eq!(stats.total, JOBS);
    assert_eq!(stats.cancelled, expected_cancelled);
    assert_eq!(stats.completed, JOBS - expected_cancelled);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.processing, 0);

    // Every cancelled job stopped before producing later stage output.
    let cancelled = pipeline
        .list(
            JobFilter::default().with_status(JobStatus::Cancelled),
            Page {
                offset: 0,
                limit: JOBS,
            },
        )
        .await;
    assert_eq!(cancelled.len(), expected_cancelled);
    for summary in cancelled {
        let record = pipeline.registry().get(summary.id).await.unwrap();
        let job = record.lock().await;
        assert!(!job.stage_results.contains_key("scripting"));
        assert!(!job.stage_results.contains_key("finalizing"));
    }

    // The gate never admitted more callers than jobs that could reach it.
    assert!(gated.entered.load(Ordering::SeqCst) as usize <= JOBS);
}

/// Concurrent status reads against running jobs never deadlock or observe
/// torn state.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_reads_race_cleanly_with_workers() {
    let pipeline = Pipeline::builder(PipelineConfig::default().with_max_concurrent_jobs(8))
        .bind(
            GenerationStage::Researching,
            StageBinding::new(StaticCollaborator::new("research_api")),
        )
        .bind(
            GenerationStage::VideoAssembly,
            StageBinding::new(StaticCollaborator::new("renderer")),
        )
        .build();

    let mut ids = Vec::new();
    for _ in 0..32 {
        ids.push(pipeline.submit(valid_request()).await.unwrap());
    }

    let readers: Vec<_> = ids
        .iter()
        .map(|id| {
            let pipeline = pipeline.clone();
            let id = *id;
            tokio::spawn(async move {
                loop {
                    let report = pipeline.status(id).await.unwrap();
                    assert!((0.0..=1.0).contains(&report.progress));
                    if report.status.is_terminal() {
                        return report.status;
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for reader in readers {
        assert_eq!(reader.await.unwrap(), JobStatus::Completed);
    }
    pipeline.drain().await;
}
