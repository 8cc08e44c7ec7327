//! The pipeline: inbound and query API plus the stage handlers workers run.
//!
//! A [`Pipeline`] is shared by every worker of every queue in a process. It
//! holds no per-contract state; all coordination goes through the queue and
//! the store's conditioned write.

pub mod pool;
mod stages;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::breaker::CircuitBreaker;
use crate::collab::{Notifier, PoRenderer};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::event::{EventSink, PipelineEvent};
use crate::lifecycle::{Applied, Lifecycle, Transition};
use crate::model::{
    Contract, ContractId, ContractState, ContractStatus, NotificationTemplate, QueueName, Submission,
    Task,
};
use crate::ocr::{GuardedOcr, OcrClient};
use crate::queue::TaskQueue;
use crate::router::TaskRouter;
use crate::store::ContractStore;

pub use pool::{WorkerPool, serve};

/// External systems the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ContractStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub ocr: Arc<dyn OcrClient>,
    pub renderer: Arc<dyn PoRenderer>,
    pub notifier: Arc<dyn Notifier>,
    pub events: Arc<dyn EventSink>,
}

/// A reviewer's decision on a contract parked in `NEEDS_REVIEW`.
#[derive(Debug, Clone)]
pub enum ReviewResolution {
    /// Accept, optionally replacing the extracted data. PO generation follows.
    Approve {
        corrected_data: Option<Value>,
        reviewer: String,
    },
    Reject {
        reason: String,
        reviewer: String,
    },
}

/// What became of one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Stage work committed; task acked.
    Done,
    /// Already handled by another delivery; task acked without effect.
    Stale,
    /// Handed back to the queue for redelivery after the delay.
    Deferred(Duration),
    /// Failure recorded; a fresh task for `attempt` is due after `delay`.
    Retried { attempt: u32, delay: Duration },
    /// Terminal failure recorded.
    Failed { reason: String },
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Done => "done",
            Disposition::Stale => "stale",
            Disposition::Deferred(_) => "deferred",
            Disposition::Retried { .. } => "retried",
            Disposition::Failed { .. } => "failed",
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    lifecycle: Lifecycle,
    router: TaskRouter,
    ocr: GuardedOcr,
    renderer: Arc<dyn PoRenderer>,
    notifier: Arc<dyn Notifier>,
    admission: AdmissionController,
    events: Arc<dyn EventSink>,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, config: PipelineConfig) -> Self {
        let Collaborators {
            store,
            queue,
            ocr,
            renderer,
            notifier,
            events,
        } = collaborators;

        let visibility = QueueName::ALL.map(|q| (q, config.stages.for_queue(q).visibility()));
        let breaker = Arc::new(CircuitBreaker::new(
            "ocr",
            config.breaker.clone(),
            events.clone(),
        ));

        Self {
            lifecycle: Lifecycle::new(store, events.clone()),
            router: TaskRouter::new(queue, visibility),
            ocr: GuardedOcr::new(ocr, breaker, config.ocr_timeout()),
            admission: AdmissionController::new(config.admission.clone()),
            renderer,
            notifier,
            events,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.ocr.breaker()
    }

    /// Create the queues.
    pub async fn init(&self) -> Result<()> {
        self.router.init().await
    }

    /// Admit a document and enqueue its extraction.
    ///
    /// Rejections (`InvalidDocument`, `AdmissionRejected`) create nothing.
    pub async fn submit(&self, submission: Submission) -> Result<ContractId> {
        self.config.documents.check(&submission.document)?;

        if let Err(e) = self
            .admission
            .admit(&submission.submitted_by, &submission.organization_id)
        {
            if let Error::AdmissionRejected { scope, retry_after } = &e {
                warn!(
                    organization_id = %submission.organization_id,
                    caller = %submission.submitted_by,
                    %scope,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "submission rejected by rate limit"
                );
                self.events.emit(PipelineEvent::AdmissionRejected {
                    organization_id: submission.organization_id.clone(),
                    caller: submission.submitted_by.clone(),
                    scope: scope.clone(),
                });
            }
            return Err(e);
        }

        let contract = Contract::received(submission, Utc::now());
        self.lifecycle.create(&contract).await?;

        if let Err(e) = self.router.dispatch(&Task::extraction(contract.id)).await {
            error!(contract_id = %contract.id, error = %e, "failed to enqueue extraction");
            let failed = Transition::Failed {
                reason: format!("could not enqueue extraction: {e}"),
                attempt: None,
            };
            if let Err(mark) = self.lifecycle.apply(&contract, failed).await {
                error!(contract_id = %contract.id, error = %mark, "failed to mark contract failed");
            }
            return Err(e);
        }

        info!(
            contract_id = %contract.id,
            organization_id = %contract.organization_id,
            file_name = %contract.document.file_name,
            "contract admitted"
        );
        self.events.emit(PipelineEvent::ContractAdmitted {
            contract_id: contract.id,
            organization_id: contract.organization_id.clone(),
        });
        Ok(contract.id)
    }

    /// Submit each document on its own. A rejected item does not stop the
    /// rest; results come back in input order.
    pub async fn submit_batch(&self, submissions: Vec<Submission>) -> Vec<Result<ContractId>> {
        let batch_id = Uuid::new_v4();
        let started = Instant::now();
        info!(%batch_id, batch_size = submissions.len(), "batch submission started");
        self.events.emit(PipelineEvent::BatchStarted {
            batch_id,
            size: submissions.len(),
        });

        let mut results = Vec::with_capacity(submissions.len());
        for (index, submission) in submissions.into_iter().enumerate() {
            let result = self.submit(submission).await;
            if let Err(e) = &result {
                warn!(%batch_id, index, error = %e, "batch item not admitted");
            }
            results.push(result);
        }

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results.len() - admitted;
        let latency_ms = started.elapsed().as_millis() as u64;
        info!(%batch_id, admitted, rejected, latency_ms, "batch submission finished");
        self.events.emit(PipelineEvent::BatchFinished {
            batch_id,
            admitted,
            rejected,
            latency_ms,
        });
        results
    }

    pub async fn get_status(&self, id: ContractId) -> Result<ContractStatus> {
        let contract = self.lifecycle.load(id).await?;
        Ok(ContractStatus::from(&contract))
    }

    /// Full stored record, including the transition history.
    pub async fn get_contract(&self, id: ContractId) -> Result<Contract> {
        self.lifecycle.load(id).await
    }

    /// Apply a reviewer's decision. The only way out of `NEEDS_REVIEW`.
    pub async fn resolve_review(
        &self,
        id: ContractId,
        resolution: ReviewResolution,
    ) -> Result<ContractStatus> {
        let mut contract = self.lifecycle.load(id).await?;
        loop {
            let (transition, target) = match &resolution {
                ReviewResolution::Approve {
                    corrected_data,
                    reviewer,
                } => (
                    Transition::ReviewApproved {
                        corrected_data: corrected_data.clone(),
                        reviewer: reviewer.clone(),
                    },
                    ContractState::Validated,
                ),
                ReviewResolution::Reject { reason, reviewer } => (
                    Transition::Failed {
                        reason: format!("rejected by {reviewer}: {reason}"),
                        attempt: None,
                    },
                    ContractState::Failed,
                ),
            };
            if contract.state != ContractState::NeedsReview {
                return Err(Error::InvalidTransition {
                    from: contract.state,
                    to: target,
                });
            }

            match self.lifecycle.apply(&contract, transition).await? {
                Applied::Committed(resolved) => {
                    info!(contract_id = %id, state = %resolved.state, "review resolved");
                    self.follow_up(&resolved).await?;
                    return Ok(ContractStatus::from(&resolved));
                }
                Applied::Superseded(fresh) => contract = fresh,
            }
        }
    }

    /// Take and handle one task from `queue`. `None` when nothing is visible.
    pub async fn process_next(&self, queue: QueueName) -> Result<Option<Disposition>> {
        let Some(delivery) = self.router.next(queue).await? else {
            return Ok(None);
        };
        self.handle(delivery).await.map(Some)
    }

    /// Enqueue whatever a contract resting in its current state is owed:
    /// PO generation once validated, a notification once it needs review,
    /// completes or fails.
    async fn follow_up(&self, contract: &Contract) -> Result<()> {
        if contract.state == ContractState::Validated {
            return self
                .router
                .dispatch(&Task::po_generation(contract.id))
                .await;
        }
        let Some(template) = NotificationTemplate::for_state(contract.state) else {
            return Ok(());
        };
        let settled = contract
            .notification(template)
            .is_some_and(|n| n.status.is_settled());
        if settled {
            return Ok(());
        }
        self.router
            .dispatch(&Task::notification(contract.id, template))
            .await
    }
}
