//! Shared fakes and an in-memory pipeline for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use contractq::collab::{Notifier, PoRenderer};
use contractq::config::PipelineConfig;
use contractq::engine::{Collaborators, Disposition, Pipeline};
use contractq::error::{Error, Failure, Result};
use contractq::event::RecordingSink;
use contractq::model::{
    Contract, ContractId, Delivery, DocumentRef, NotificationTemplate, QueueName, Receipt,
    Submission, Task,
};
use contractq::ocr::{Extraction, OcrClient};
use contractq::queue::{MemoryQueue, TaskQueue};
use contractq::store::MemoryContractStore;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Collaborator fakes
// ---------------------------------------------------------------------------

/// Extraction carrying every required field.
pub fn extraction(score: f64) -> Extraction {
    Extraction {
        data: json!({
            "contract_number": "C-2024-0117",
            "parties": ["Acme Corp", "Globex Ltd"],
            "total_value": 125000,
        }),
        accuracy_score: score,
    }
}

/// Replays a script of results, then repeats `fallback`.
pub struct FakeOcr {
    script: Mutex<VecDeque<std::result::Result<Extraction, Failure>>>,
    fallback: std::result::Result<Extraction, Failure>,
    calls: AtomicUsize,
}

impl FakeOcr {
    pub fn scripted(
        script: Vec<std::result::Result<Extraction, Failure>>,
        fallback: std::result::Result<Extraction, Failure>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(result: std::result::Result<Extraction, Failure>) -> Self {
        Self::scripted(Vec::new(), result)
    }

    pub fn succeeding(score: f64) -> Self {
        Self::always(Ok(extraction(score)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrClient for FakeOcr {
    async fn extract(
        &self,
        _document: &DocumentRef,
        _timeout: Duration,
    ) -> std::result::Result<Extraction, Failure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Counts invocations; optionally takes `delay` before answering.
#[derive(Default)]
pub struct CountingRenderer {
    delay: Duration,
    calls: AtomicUsize,
}

impl CountingRenderer {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoRenderer for CountingRenderer {
    async fn generate(&self, contract: &Contract) -> std::result::Result<String, Failure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(format!("s3://purchase-orders/{}.pdf", contract.id))
    }
}

/// Records every send; fails each one with `failure` when set.
#[derive(Default)]
pub struct RecordingNotifier {
    failure: Option<Failure>,
    delay: Duration,
    sent: Mutex<Vec<(NotificationTemplate, Value)>>,
}

impl RecordingNotifier {
    pub fn failing(failure: Failure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::default()
        }
    }

    /// Succeeds, but only after `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn count(&self, template: NotificationTemplate) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == template)
            .count()
    }

    pub fn variables(&self, template: NotificationTemplate) -> Option<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find(|(t, _)| *t == template)
            .map(|(_, v)| v.clone())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        template: NotificationTemplate,
        variables: &Value,
    ) -> std::result::Result<(), Failure> {
        self.sent.lock().unwrap().push((template, variables.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue wrappers
// ---------------------------------------------------------------------------

/// Delivers every task twice, as an at-least-once broker may.
pub struct DuplicatingQueue {
    inner: Arc<MemoryQueue>,
}

impl DuplicatingQueue {
    pub fn new(inner: Arc<MemoryQueue>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl TaskQueue for DuplicatingQueue {
    async fn ensure_queue(&self, queue: QueueName) -> Result<()> {
        self.inner.ensure_queue(queue).await
    }

    async fn enqueue(&self, queue: QueueName, task: &Task, delay: Duration) -> Result<()> {
        self.inner.enqueue(queue, task, delay).await?;
        self.inner.enqueue(queue, task, delay).await
    }

    async fn dequeue(&self, queue: QueueName, visibility: Duration) -> Result<Option<Delivery>> {
        self.inner.dequeue(queue, visibility).await
    }

    async fn ack(&self, queue: QueueName, receipt: Receipt) -> Result<()> {
        self.inner.ack(queue, receipt).await
    }

    async fn nack(&self, queue: QueueName, receipt: Receipt, delay: Duration) -> Result<()> {
        self.inner.nack(queue, receipt, delay).await
    }

    async fn depth(&self, queue: QueueName) -> Result<u64> {
        self.inner.depth(queue).await
    }
}

/// A broker that is down. Counts dequeue attempts.
#[derive(Default)]
pub struct FailingQueue {
    dequeues: AtomicUsize,
}

impl FailingQueue {
    pub fn dequeues(&self) -> usize {
        self.dequeues.load(Ordering::SeqCst)
    }

    fn down() -> Error {
        Error::Queue("connection refused".to_string())
    }
}

#[async_trait]
impl TaskQueue for FailingQueue {
    async fn ensure_queue(&self, _: QueueName) -> Result<()> {
        Err(Self::down())
    }

    async fn enqueue(&self, _: QueueName, _: &Task, _: Duration) -> Result<()> {
        Err(Self::down())
    }

    async fn dequeue(&self, _: QueueName, _: Duration) -> Result<Option<Delivery>> {
        self.dequeues.fetch_add(1, Ordering::SeqCst);
        Err(Self::down())
    }

    async fn ack(&self, _: QueueName, _: Receipt) -> Result<()> {
        Err(Self::down())
    }

    async fn nack(&self, _: QueueName, _: Receipt, _: Duration) -> Result<()> {
        Err(Self::down())
    }

    async fn depth(&self, _: QueueName) -> Result<u64> {
        Err(Self::down())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn submission(file_name: &str, size_bytes: u64) -> Submission {
    Submission {
        document: DocumentRef {
            uri: format!("s3://uploads/{file_name}"),
            file_name: file_name.to_string(),
            content_type: "application/pdf".to_string(),
            size_bytes,
        },
        organization_id: "org-acme".to_string(),
        submitted_by: "user-1".to_string(),
    }
}

pub struct Builder {
    config: PipelineConfig,
    ocr: FakeOcr,
    renderer: CountingRenderer,
    notifier: RecordingNotifier,
    duplicating: bool,
}

impl Builder {
    pub fn config(mut self, tune: impl FnOnce(&mut PipelineConfig)) -> Self {
        tune(&mut self.config);
        self
    }

    pub fn renderer(mut self, renderer: CountingRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn notifier(mut self, notifier: RecordingNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Enqueue every task twice.
    pub fn duplicating(mut self) -> Self {
        self.duplicating = true;
        self
    }

    pub fn build(self) -> Harness {
        let store = Arc::new(MemoryContractStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let ocr = Arc::new(self.ocr);
        let renderer = Arc::new(self.renderer);
        let notifier = Arc::new(self.notifier);
        let events = Arc::new(RecordingSink::new());

        let broker: Arc<dyn TaskQueue> = if self.duplicating {
            Arc::new(DuplicatingQueue::new(queue.clone()))
        } else {
            queue.clone()
        };
        let pipeline = Pipeline::new(
            Collaborators {
                store: store.clone(),
                queue: broker,
                ocr: ocr.clone(),
                renderer: renderer.clone(),
                notifier: notifier.clone(),
                events: events.clone(),
            },
            self.config,
        );

        Harness {
            pipeline: Arc::new(pipeline),
            store,
            queue,
            ocr,
            renderer,
            notifier,
            events,
        }
    }
}

pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<MemoryContractStore>,
    pub queue: Arc<MemoryQueue>,
    pub ocr: Arc<FakeOcr>,
    pub renderer: Arc<CountingRenderer>,
    pub notifier: Arc<RecordingNotifier>,
    pub events: Arc<RecordingSink>,
}

impl Harness {
    pub fn builder(ocr: FakeOcr) -> Builder {
        Builder {
            config: PipelineConfig::default(),
            ocr,
            renderer: CountingRenderer::default(),
            notifier: RecordingNotifier::default(),
            duplicating: false,
        }
    }

    pub fn new(ocr: FakeOcr) -> Self {
        Self::builder(ocr).build()
    }

    pub async fn submit(&self) -> ContractId {
        self.pipeline
            .submit(submission("msa-acme.pdf", 48_000))
            .await
            .unwrap()
    }

    pub async fn contract(&self, id: ContractId) -> Contract {
        self.pipeline.get_contract(id).await.unwrap()
    }

    /// Process tasks until every queue is empty, moving the paused clock
    /// forward whenever all remaining tasks are delayed.
    pub async fn drain(&self) -> Vec<(QueueName, Disposition)> {
        let mut seen = Vec::new();
        for _ in 0..1_000 {
            let mut progressed = false;
            for queue in QueueName::ALL {
                if let Some(disposition) = self.pipeline.process_next(queue).await.unwrap() {
                    seen.push((queue, disposition));
                    progressed = true;
                }
            }
            if progressed {
                continue;
            }
            let wait = QueueName::ALL
                .iter()
                .filter_map(|q| self.queue.time_until_next(*q))
                .min();
            match wait {
                Some(wait) => tokio::time::advance(wait + Duration::from_millis(1)).await,
                None => return seen,
            }
        }
        panic!("queues did not drain");
    }
}
