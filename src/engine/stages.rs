//! Stage handlers and the retry wrapper around them.
//!
//! Every handler starts from a fresh read of the contract and decides from
//! its state what, if anything, is left to do. Duplicate and stale
//! deliveries therefore fall through as no-ops.

use std::future::Future;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{Instrument, debug, info, warn};

use super::{Disposition, Pipeline};
use crate::collab::notification_variables;
use crate::config::StageConfig;
use crate::error::{Failure, Result};
use crate::event::PipelineEvent;
use crate::lifecycle::{Applied, Transition, lease_remaining, lease_until};
use crate::model::{ContractState, Delivery, EffectStatus, Stage, Task};
use crate::retry::RetryDecision;
use crate::telemetry::pipeline::{record_outcome, start_stage_span};
use crate::validation::Verdict;

/// Result of running a stage handler once.
#[derive(Debug)]
enum StageOutcome {
    Done,
    Stale,
    Defer(std::time::Duration),
    Failed(Failure),
}

/// Run `work` under the stage's time limits. `None` when the hard limit
/// cancelled it.
async fn run_with_limits<F: Future>(stage: Stage, limits: &StageConfig, work: F) -> Option<F::Output> {
    let soft = limits.soft_limit();
    let guarded = async {
        tokio::pin!(work);
        tokio::select! {
            out = &mut work => out,
            _ = tokio::time::sleep(soft) => {
                warn!(
                    stage = stage.as_str(),
                    soft_limit_secs = limits.soft_limit_secs,
                    "stage exceeded soft time limit"
                );
                work.await
            }
        }
    };
    tokio::time::timeout(limits.hard_limit(), guarded).await.ok()
}

impl Pipeline {
    /// Run the handler for one delivery, then ack or hand it back.
    ///
    /// Errors only when the queue rejects the ack or nack; the delivery is
    /// then redelivered after its visibility window.
    pub async fn handle(&self, delivery: Delivery) -> Result<Disposition> {
        let span = start_stage_span(&delivery.task);
        let outcome_span = span.clone();
        async move {
            let task = &delivery.task;
            let started = Instant::now();
            let limits = self.config.stages.get(task.stage);

            let disposition = match run_with_limits(task.stage, limits, self.run_stage(task)).await {
                Some(Ok(StageOutcome::Done)) => Disposition::Done,
                Some(Ok(StageOutcome::Stale)) => Disposition::Stale,
                Some(Ok(StageOutcome::Defer(delay))) => Disposition::Deferred(delay),
                Some(Ok(StageOutcome::Failed(failure))) => self.settle_failure(task, failure).await,
                Some(Err(e)) => {
                    warn!(error = %e, "stage interrupted, handing task back");
                    Disposition::Deferred(self.config.worker.infra_retry())
                }
                None => {
                    let failure = Failure::Transient(format!(
                        "{} exceeded hard time limit of {}s",
                        task.stage, limits.hard_limit_secs
                    ));
                    self.settle_failure(task, failure).await
                }
            };

            record_outcome(&outcome_span, disposition.label());
            self.events.emit(PipelineEvent::StageFinished {
                contract_id: task.contract_id,
                stage: task.stage,
                outcome: disposition.label().to_string(),
                latency_ms: started.elapsed().as_millis() as u64,
                attempt_count: task.payload.attempt,
                delivery_count: task.delivery_count,
            });

            match &disposition {
                Disposition::Deferred(delay) => self.router.defer(&delivery, *delay).await?,
                _ => self.router.ack(&delivery).await?,
            }
            Ok(disposition)
        }
        .instrument(span)
        .await
    }

    async fn run_stage(&self, task: &Task) -> Result<StageOutcome> {
        match task.stage {
            Stage::Extraction | Stage::Validation => self.run_extraction(task).await,
            Stage::PoGeneration => self.run_po_generation(task).await,
            Stage::Notification => self.run_notification(task).await,
        }
    }

    async fn settle_failure(&self, task: &Task, failure: Failure) -> Disposition {
        let settled = match task.stage {
            Stage::Notification => self.notification_failed(task, failure).await,
            _ => self.retry_or_fail(task, failure).await,
        };
        settled.unwrap_or_else(|e| {
            warn!(error = %e, "could not record stage failure, handing task back");
            Disposition::Deferred(self.config.worker.infra_retry())
        })
    }

    // -----------------------------------------------------------------------
    // Extraction and validation
    // -----------------------------------------------------------------------

    /// Drive the contract from `RECEIVED` to `VALIDATED` or `NEEDS_REVIEW`.
    async fn run_extraction(&self, task: &Task) -> Result<StageOutcome> {
        let mut contract = self.lifecycle.load(task.contract_id).await?;
        let redelivered = task.delivery_count > 1;

        loop {
            if task.payload.attempt < contract.attempts_for(Stage::Extraction) {
                return Ok(StageOutcome::Stale);
            }
            contract = match contract.state {
                ContractState::Received => self
                    .lifecycle
                    .apply(&contract, Transition::Dispatch)
                    .await?
                    .into_contract(),
                ContractState::Extracting => {
                    let extraction = match self.ocr.extract(&contract.document).await {
                        Ok(extraction) => extraction,
                        Err(failure) => return Ok(StageOutcome::Failed(failure)),
                    };
                    info!(
                        contract_id = %contract.id,
                        accuracy_score = extraction.accuracy_score,
                        "extraction succeeded"
                    );
                    let extracted = Transition::Extracted {
                        data: extraction.data,
                        accuracy_score: extraction.accuracy_score,
                    };
                    self.lifecycle
                        .apply(&contract, extracted)
                        .await?
                        .into_contract()
                }
                ContractState::Extracted => self
                    .lifecycle
                    .apply(&contract, Transition::BeginValidation)
                    .await?
                    .into_contract(),
                ContractState::Validating => {
                    let data = contract.extracted_data.clone().unwrap_or(Value::Null);
                    let score = contract.accuracy_score.unwrap_or(0.0);
                    let transition = match self.config.validation.evaluate(&data, score) {
                        Verdict::Accepted => Transition::Validated,
                        Verdict::NeedsReview(reasons) => Transition::NeedsReview { reasons },
                    };
                    match self.lifecycle.apply(&contract, transition).await? {
                        Applied::Committed(validated) => {
                            self.follow_up(&validated).await?;
                            return Ok(StageOutcome::Done);
                        }
                        Applied::Superseded(fresh) => fresh,
                    }
                }
                ContractState::Validated | ContractState::NeedsReview | ContractState::Failed => {
                    // A redelivery may be the one that was cut off before
                    // enqueueing the follow-up.
                    if redelivered {
                        self.follow_up(&contract).await?;
                    }
                    return Ok(StageOutcome::Stale);
                }
                ContractState::GeneratingPo | ContractState::Completed => {
                    return Ok(StageOutcome::Stale);
                }
            };
        }
    }

    // -----------------------------------------------------------------------
    // PO generation
    // -----------------------------------------------------------------------

    async fn run_po_generation(&self, task: &Task) -> Result<StageOutcome> {
        let mut contract = self.lifecycle.load(task.contract_id).await?;
        let redelivered = task.delivery_count > 1;
        let lease = self.config.stages.po_generation.hard_limit();

        // Claim the lease, or find out someone else holds or finished it.
        loop {
            if task.payload.attempt < contract.attempts_for(Stage::PoGeneration) {
                return Ok(StageOutcome::Stale);
            }
            let now = Utc::now();
            let claim = match contract.state {
                ContractState::Validated => Transition::BeginPoGeneration {
                    lease_until: lease_until(now, lease),
                },
                ContractState::GeneratingPo => {
                    if let Some(remaining) = lease_remaining(contract.po_lease_until, now) {
                        return Ok(StageOutcome::Defer(remaining));
                    }
                    Transition::ReclaimPoGeneration {
                        lease_until: lease_until(now, lease),
                    }
                }
                ContractState::Completed | ContractState::Failed => {
                    if redelivered {
                        self.follow_up(&contract).await?;
                    }
                    return Ok(StageOutcome::Stale);
                }
                _ => return Ok(StageOutcome::Stale),
            };
            match self.lifecycle.apply(&contract, claim).await? {
                Applied::Committed(claimed) => {
                    contract = claimed;
                    break;
                }
                Applied::Superseded(fresh) => contract = fresh,
            }
        }

        let artifact_ref = match self.renderer.generate(&contract).await {
            Ok(artifact_ref) => artifact_ref,
            Err(failure) => return Ok(StageOutcome::Failed(failure)),
        };
        let completed = Transition::Completed {
            artifact_ref: artifact_ref.clone(),
        };
        match self.lifecycle.apply(&contract, completed).await? {
            Applied::Committed(done) => {
                info!(contract_id = %done.id, %artifact_ref, "purchase order generated");
                self.events.emit(PipelineEvent::PurchaseOrderGenerated {
                    contract_id: done.id,
                    artifact_ref,
                });
                self.follow_up(&done).await?;
                Ok(StageOutcome::Done)
            }
            Applied::Superseded(_) => Ok(StageOutcome::Stale),
        }
    }

    // -----------------------------------------------------------------------
    // Notification
    // -----------------------------------------------------------------------

    async fn run_notification(&self, task: &Task) -> Result<StageOutcome> {
        let Some(template) = task.payload.template else {
            warn!(task_id = %task.task_id, "notification task without a template, dropping");
            return Ok(StageOutcome::Stale);
        };
        let mut contract = self.lifecycle.load(task.contract_id).await?;
        let lease = self.config.stages.notification.hard_limit();

        loop {
            let now = Utc::now();
            if let Some(record) = contract.notification(template) {
                if record.status.is_settled() || task.payload.attempt < record.attempts {
                    return Ok(StageOutcome::Stale);
                }
                if let EffectStatus::InFlight { lease_until: held } = &record.status {
                    if let Some(remaining) = lease_remaining(Some(*held), now) {
                        return Ok(StageOutcome::Defer(remaining));
                    }
                }
            }
            let claim = Transition::NotificationClaimed {
                template,
                lease_until: lease_until(now, lease),
            };
            match self.lifecycle.apply(&contract, claim).await? {
                Applied::Committed(claimed) => {
                    contract = claimed;
                    break;
                }
                Applied::Superseded(fresh) => contract = fresh,
            }
        }

        let variables = notification_variables(&contract);
        if let Err(failure) = self.notifier.send(template, &variables).await {
            return Ok(StageOutcome::Failed(failure));
        }
        // Other writers may bump the version while the send is in flight.
        loop {
            let delivered = Transition::NotificationDelivered { template };
            match self.lifecycle.apply(&contract, delivered).await? {
                Applied::Committed(marked) => {
                    contract = marked;
                    break;
                }
                Applied::Superseded(fresh) => contract = fresh,
            }
        }
        info!(contract_id = %contract.id, template = template.id(), "notification sent");
        self.events.emit(PipelineEvent::NotificationSent {
            contract_id: contract.id,
            template,
        });
        Ok(StageOutcome::Done)
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    /// Schedule the next attempt or fail the contract.
    ///
    /// The retry task is enqueued before the attempt is recorded, so a crash
    /// in between leaves a task that finds nothing stale rather than a
    /// recorded retry with no task.
    async fn retry_or_fail(&self, task: &Task, failure: Failure) -> Result<Disposition> {
        let stage = match task.stage {
            Stage::Validation => Stage::Extraction,
            other => other,
        };
        let active = match stage {
            Stage::PoGeneration => ContractState::GeneratingPo,
            _ => ContractState::Extracting,
        };

        let contract = self.lifecycle.load(task.contract_id).await?;
        if task.payload.attempt < contract.attempts_for(stage) || contract.state.is_terminal() {
            return Ok(Disposition::Stale);
        }
        if contract.state != active {
            // Cut off past the failing call; a redelivery resumes from here.
            return Ok(match contract.state {
                ContractState::Received => Disposition::Stale,
                _ => Disposition::Deferred(self.config.worker.infra_retry()),
            });
        }

        if let Failure::Unauthorized(detail) = &failure {
            self.raise_alert(task, format!("{stage} rejected credentials: {detail}"));
        }

        let policy = &self.config.stages.get(stage).retry;
        match policy.decide(&failure, contract.attempts_for(stage)) {
            RetryDecision::Retry { attempt, delay } => {
                let retry = task.retry(attempt, delay);
                self.router.dispatch_after(&retry, delay).await?;

                let scheduled = Transition::RetryScheduled {
                    stage,
                    attempt,
                    reason: failure.to_string(),
                };
                if !self.lifecycle.apply(&contract, scheduled).await?.is_committed() {
                    debug!(
                        contract_id = %contract.id,
                        task_id = %retry.task_id,
                        stage = stage.as_str(),
                        attempt,
                        "retry not recorded, enqueued task will be acked as stale"
                    );
                    return Ok(Disposition::Stale);
                }
                info!(
                    contract_id = %contract.id,
                    stage = stage.as_str(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    failure = failure.kind(),
                    "retry scheduled"
                );
                self.events.emit(PipelineEvent::RetryScheduled {
                    contract_id: contract.id,
                    stage,
                    attempt_count: attempt,
                    delay_ms: delay.as_millis() as u64,
                    failure: failure.kind().to_string(),
                });
                Ok(Disposition::Retried { attempt, delay })
            }
            RetryDecision::GiveUp { attempt, reason } => {
                let failed = Transition::Failed {
                    reason: reason.clone(),
                    attempt: Some(attempt),
                };
                match self.lifecycle.apply(&contract, failed).await? {
                    Applied::Committed(failed) => {
                        warn!(
                            contract_id = %failed.id,
                            stage = stage.as_str(),
                            attempt,
                            %reason,
                            "contract failed"
                        );
                        self.follow_up(&failed).await?;
                        Ok(Disposition::Failed { reason })
                    }
                    Applied::Superseded(_) => Ok(Disposition::Stale),
                }
            }
        }
    }

    /// Retry a failed send, or abandon it. The contract state is untouched.
    async fn notification_failed(&self, task: &Task, failure: Failure) -> Result<Disposition> {
        let Some(template) = task.payload.template else {
            return Ok(Disposition::Stale);
        };
        let contract = self.lifecycle.load(task.contract_id).await?;
        let Some(record) = contract.notification(template) else {
            return Ok(Disposition::Stale);
        };
        if !matches!(record.status, EffectStatus::InFlight { .. })
            || task.payload.attempt < record.attempts
        {
            return Ok(Disposition::Stale);
        }

        if let Failure::Unauthorized(detail) = &failure {
            self.raise_alert(task, format!("notifier rejected credentials: {detail}"));
        }

        let policy = &self.config.stages.notification.retry;
        match policy.decide(&failure, record.attempts) {
            RetryDecision::Retry { attempt, delay } => {
                let retry = task.retry(attempt, delay);
                self.router.dispatch_after(&retry, delay).await?;
                let pending = Transition::NotificationRetry {
                    template,
                    attempts: attempt,
                };
                if !self.lifecycle.apply(&contract, pending).await?.is_committed() {
                    debug!(
                        contract_id = %contract.id,
                        task_id = %retry.task_id,
                        template = template.id(),
                        attempt,
                        "notification retry not recorded, enqueued task may be redundant"
                    );
                    return Ok(Disposition::Stale);
                }
                self.events.emit(PipelineEvent::RetryScheduled {
                    contract_id: contract.id,
                    stage: Stage::Notification,
                    attempt_count: attempt,
                    delay_ms: delay.as_millis() as u64,
                    failure: failure.kind().to_string(),
                });
                Ok(Disposition::Retried { attempt, delay })
            }
            RetryDecision::GiveUp { attempt, reason } => {
                let abandoned = Transition::NotificationAbandoned {
                    template,
                    attempts: attempt,
                    reason: reason.clone(),
                };
                if !self.lifecycle.apply(&contract, abandoned).await?.is_committed() {
                    return Ok(Disposition::Stale);
                }
                self.raise_alert(task, format!("notification {template} abandoned: {reason}"));
                Ok(Disposition::Failed { reason })
            }
        }
    }

    fn raise_alert(&self, task: &Task, message: String) {
        self.events.emit(PipelineEvent::OperationalAlert {
            contract_id: Some(task.contract_id),
            message,
        });
    }
}
