//! Worker pools under the paused clock: end-to-end flow, shutdown and broker outages.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{CountingRenderer, FailingQueue, FakeOcr, Harness, RecordingNotifier, submission};
use contractq::config::PipelineConfig;
use contractq::engine::{Collaborators, Pipeline, WorkerPool, serve};
use contractq::error::Error;
use contractq::event::RecordingSink;
use contractq::model::{ContractState, NotificationTemplate, QueueName};
use contractq::store::MemoryContractStore;
use tokio::sync::watch;

fn pipeline_over(queue: Arc<FailingQueue>, store: Arc<MemoryContractStore>) -> Arc<Pipeline> {
    Arc::new(Pipeline::new(
        Collaborators {
            store,
            queue,
            ocr: Arc::new(FakeOcr::succeeding(97.0)),
            renderer: Arc::new(CountingRenderer::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            events: Arc::new(RecordingSink::new()),
        },
        PipelineConfig::default(),
    ))
}

#[tokio::test(start_paused = true)]
async fn serve_moves_contract_to_completion() {
    let h = Harness::new(FakeOcr::succeeding(97.0));
    let (stop, shutdown) = watch::channel(false);
    let server = tokio::spawn(serve(h.pipeline.clone(), shutdown));

    let id = h.submit().await;
    for _ in 0..200 {
        if h.notifier.count(NotificationTemplate::ContractCompleted) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    stop.send(true).unwrap();
    server.await.unwrap().unwrap();

    let status = h.pipeline.get_status(id).await.unwrap();
    assert_eq!(status.state, ContractState::Completed);
    assert_eq!(h.renderer.calls(), 1);
    assert_eq!(h.notifier.count(NotificationTemplate::ContractCompleted), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_pools_stop_on_shutdown() {
    let h = Harness::new(FakeOcr::succeeding(97.0));
    let (stop, shutdown) = watch::channel(false);
    let server = tokio::spawn(serve(h.pipeline.clone(), shutdown));

    tokio::time::sleep(Duration::from_secs(2)).await;
    stop.send(true).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropped_shutdown_sender_stops_pool() {
    let h = Harness::new(FakeOcr::succeeding(97.0));
    let (stop, shutdown) = watch::channel(false);
    let pool = tokio::spawn(WorkerPool::new(h.pipeline.clone(), QueueName::Notification).run(shutdown));

    drop(stop);
    pool.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn pool_concurrency_follows_stage_config() {
    let h = Harness::builder(FakeOcr::succeeding(97.0))
        .config(|c| c.stages.po_generation.concurrency = 7)
        .build();
    let pool = WorkerPool::new(h.pipeline.clone(), QueueName::PoGeneration);
    assert_eq!(pool.queue(), QueueName::PoGeneration);
    assert_eq!(pool.concurrency(), 7);
}

#[tokio::test(start_paused = true)]
async fn broker_outage_backs_off() {
    let queue = Arc::new(FailingQueue::default());
    let pipeline = pipeline_over(queue.clone(), Arc::new(MemoryContractStore::new()));
    let (stop, shutdown) = watch::channel(false);
    let pool = tokio::spawn(WorkerPool::new(pipeline, QueueName::Extraction).run(shutdown));

    // Backoff doubles from 1s: reads at 0, 1, 3 and 7 seconds.
    tokio::time::sleep(Duration::from_secs(10)).await;
    stop.send(true).unwrap();
    pool.await.unwrap();

    let reads = queue.dequeues();
    assert!((3..=5).contains(&reads), "{reads} reads");
}

#[tokio::test(start_paused = true)]
async fn failed_enqueue_fails_the_new_contract() {
    let store = Arc::new(MemoryContractStore::new());
    let pipeline = pipeline_over(Arc::new(FailingQueue::default()), store.clone());

    let err = pipeline
        .submit(submission("msa-acme.pdf", 48_000))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Queue(_)));
    assert_eq!(store.len(), 1);
}
