//! Contract lifecycle state machine.
//!
//! [`plan`] computes the next record for a transition without touching the
//! store. [`Lifecycle::apply`] writes it conditioned on the version the plan
//! was computed from. A lost race comes back as [`Applied::Superseded`] with
//! the winner's record, which callers treat as already done.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{EventSink, PipelineEvent};
use crate::model::{
    Contract, ContractId, ContractState, EffectStatus, NotificationRecord, NotificationTemplate,
    Stage, StageAttempts, TransitionRecord,
};
use crate::store::ContractStore;

/// A requested change to one contract.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `RECEIVED -> EXTRACTING` when an extraction delivery picks it up.
    Dispatch,
    Extracted {
        data: Value,
        accuracy_score: f64,
    },
    /// Self-transition recording a retryable failure of the current stage.
    RetryScheduled {
        stage: Stage,
        attempt: u32,
        reason: String,
    },
    BeginValidation,
    Validated,
    NeedsReview {
        reasons: Vec<String>,
    },
    /// Reviewer override out of `NEEDS_REVIEW`.
    ReviewApproved {
        corrected_data: Option<Value>,
        reviewer: String,
    },
    BeginPoGeneration {
        lease_until: DateTime<Utc>,
    },
    /// Take over PO generation whose previous lease is gone.
    ReclaimPoGeneration {
        lease_until: DateTime<Utc>,
    },
    Completed {
        artifact_ref: String,
    },
    Failed {
        reason: String,
        /// Failed attempts to record, when the failure consumed one.
        attempt: Option<u32>,
    },
    NotificationClaimed {
        template: NotificationTemplate,
        lease_until: DateTime<Utc>,
    },
    NotificationRetry {
        template: NotificationTemplate,
        attempts: u32,
    },
    NotificationDelivered {
        template: NotificationTemplate,
    },
    NotificationAbandoned {
        template: NotificationTemplate,
        attempts: u32,
        reason: String,
    },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Dispatch => "dispatch",
            Transition::Extracted { .. } => "extracted",
            Transition::RetryScheduled { .. } => "retry_scheduled",
            Transition::BeginValidation => "begin_validation",
            Transition::Validated => "validated",
            Transition::NeedsReview { .. } => "needs_review",
            Transition::ReviewApproved { .. } => "review_approved",
            Transition::BeginPoGeneration { .. } => "begin_po_generation",
            Transition::ReclaimPoGeneration { .. } => "reclaim_po_generation",
            Transition::Completed { .. } => "completed",
            Transition::Failed { .. } => "failed",
            Transition::NotificationClaimed { .. } => "notification_claimed",
            Transition::NotificationRetry { .. } => "notification_retry",
            Transition::NotificationDelivered { .. } => "notification_delivered",
            Transition::NotificationAbandoned { .. } => "notification_abandoned",
        }
    }
}

/// Stage whose attempts are counted while a contract sits in `state`.
fn stage_of(state: ContractState) -> Option<Stage> {
    match state {
        ContractState::Received | ContractState::Extracting | ContractState::Extracted => {
            Some(Stage::Extraction)
        }
        ContractState::Validating | ContractState::Validated | ContractState::NeedsReview => {
            Some(Stage::Validation)
        }
        ContractState::GeneratingPo => Some(Stage::PoGeneration),
        ContractState::Completed | ContractState::Failed => None,
    }
}

/// Move `next` to `to`, appending to the audit history.
fn advance(next: &mut Contract, to: ContractState, reason: Option<String>, now: DateTime<Utc>) -> Result<()> {
    let from = next.state;
    if !from.can_transition_to(to) {
        return Err(Error::InvalidTransition { from, to });
    }
    if let Some(stage) = stage_of(to) {
        if stage != next.attempts.stage {
            next.attempts = StageAttempts::fresh(stage);
        }
    }
    next.state = to;
    next.history.push(TransitionRecord {
        from_state: from,
        to_state: to,
        version: next.version + 1,
        timestamp: now,
        reason,
    });
    Ok(())
}

fn notification_entry(next: &mut Contract, template: NotificationTemplate) -> &mut NotificationRecord {
    let index = match next.notifications.iter().position(|n| n.template == template) {
        Some(index) => index,
        None => {
            next.notifications.push(NotificationRecord {
                template,
                status: EffectStatus::Pending,
                attempts: 0,
            });
            next.notifications.len() - 1
        }
    };
    &mut next.notifications[index]
}

/// Compute the record `transition` produces from `current`.
///
/// Pure: validates the edge, bumps the version and stamps `updated_at`.
pub fn plan(current: &Contract, transition: &Transition, now: DateTime<Utc>) -> Result<Contract> {
    let mut next = current.clone();
    use ContractState::*;

    match transition {
        Transition::Dispatch => advance(&mut next, Extracting, None, now)?,
        Transition::Extracted {
            data,
            accuracy_score,
        } => {
            advance(&mut next, Extracted, None, now)?;
            next.extracted_data = Some(data.clone());
            next.accuracy_score = Some(*accuracy_score);
        }
        Transition::RetryScheduled {
            stage,
            attempt,
            reason,
        } => {
            if stage_of(current.state) != Some(*stage) {
                return Err(Error::Other(format!(
                    "cannot schedule a {stage} retry while contract is {}",
                    current.state
                )));
            }
            advance(&mut next, current.state, Some(reason.clone()), now)?;
            next.attempts = StageAttempts {
                stage: *stage,
                count: *attempt,
            };
            next.po_lease_until = None;
        }
        Transition::BeginValidation => advance(&mut next, Validating, None, now)?,
        Transition::Validated => {
            advance(&mut next, Validated, None, now)?;
            next.review_reasons.clear();
        }
        Transition::NeedsReview { reasons } => {
            advance(&mut next, NeedsReview, Some(reasons.join("; ")), now)?;
            next.review_reasons = reasons.clone();
        }
        Transition::ReviewApproved {
            corrected_data,
            reviewer,
        } => {
            if current.state != NeedsReview {
                return Err(Error::InvalidTransition {
                    from: current.state,
                    to: Validated,
                });
            }
            advance(&mut next, Validated, Some(format!("approved by {reviewer}")), now)?;
            if let Some(data) = corrected_data {
                next.extracted_data = Some(data.clone());
            }
        }
        Transition::BeginPoGeneration { lease_until } => {
            advance(&mut next, GeneratingPo, None, now)?;
            next.po_lease_until = Some(*lease_until);
        }
        Transition::ReclaimPoGeneration { lease_until } => {
            if current.state != GeneratingPo {
                return Err(Error::InvalidTransition {
                    from: current.state,
                    to: GeneratingPo,
                });
            }
            if current.po_lease_until.is_some_and(|until| until > now) {
                return Err(Error::Other(format!(
                    "PO generation lease on {} is still held",
                    current.id
                )));
            }
            next.po_lease_until = Some(*lease_until);
        }
        Transition::Completed { artifact_ref } => {
            advance(&mut next, Completed, None, now)?;
            next.artifact_ref = Some(artifact_ref.clone());
            next.po_lease_until = None;
        }
        Transition::Failed { reason, attempt } => {
            advance(&mut next, Failed, Some(reason.clone()), now)?;
            next.failure_reason = Some(reason.clone());
            next.po_lease_until = None;
            if let Some(count) = attempt {
                next.attempts.count = *count;
            }
        }
        Transition::NotificationClaimed {
            template,
            lease_until,
        } => {
            notification_entry(&mut next, *template).status = EffectStatus::InFlight {
                lease_until: *lease_until,
            };
        }
        Transition::NotificationRetry { template, attempts } => {
            let record = notification_entry(&mut next, *template);
            record.status = EffectStatus::Pending;
            record.attempts = *attempts;
        }
        Transition::NotificationDelivered { template } => {
            notification_entry(&mut next, *template).status = EffectStatus::Delivered { at: now };
        }
        Transition::NotificationAbandoned {
            template,
            attempts,
            reason,
        } => {
            let record = notification_entry(&mut next, *template);
            record.status = EffectStatus::Abandoned {
                reason: reason.clone(),
            };
            record.attempts = *attempts;
        }
    }

    next.version = current.version + 1;
    next.updated_at = now;
    Ok(next)
}

/// Outcome of a conditioned write.
#[derive(Debug, Clone)]
pub enum Applied {
    /// Our write landed.
    Committed(Contract),
    /// Another writer moved the contract first. Holds the stored record.
    Superseded(Contract),
}

impl Applied {
    pub fn contract(&self) -> &Contract {
        match self {
            Applied::Committed(c) | Applied::Superseded(c) => c,
        }
    }

    pub fn into_contract(self) -> Contract {
        match self {
            Applied::Committed(c) | Applied::Superseded(c) => c,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Applied::Committed(_))
    }
}

/// The single writer of contract state and version.
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn ContractStore>,
    events: Arc<dyn EventSink>,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn ContractStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    pub async fn create(&self, contract: &Contract) -> Result<()> {
        self.store.insert(contract).await
    }

    pub async fn load(&self, id: ContractId) -> Result<Contract> {
        self.store.get(id).await
    }

    /// Apply `transition` to the snapshot `current`.
    pub async fn apply(&self, current: &Contract, transition: Transition) -> Result<Applied> {
        let next = plan(current, &transition, Utc::now())?;
        match self.store.compare_and_swap(&next, current.version).await {
            Ok(()) => {
                let appended = next.history.len() > current.history.len();
                if let Some(record) = next.history.last().filter(|_| appended) {
                    self.events.emit(PipelineEvent::StateTransition {
                        contract_id: next.id,
                        from: record.from_state,
                        to: record.to_state,
                        version: record.version,
                        reason: record.reason.clone(),
                    });
                }
                Ok(Applied::Committed(next))
            }
            Err(Error::VersionConflict { .. }) => {
                let stored = self.store.get(current.id).await?;
                debug!(
                    contract_id = %current.id,
                    transition = transition.name(),
                    expected = current.version,
                    found = stored.version,
                    "transition superseded"
                );
                Ok(Applied::Superseded(stored))
            }
            Err(e) => Err(e),
        }
    }
}

/// Expiry of a lease of length `lease` taken at `now`.
pub fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// How long until `lease_until` lapses, if it is still live.
pub fn lease_remaining(lease_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    let until = lease_until?;
    (until - now).to_std().ok().filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentRef, Submission};
    use serde_json::json;

    fn received() -> Contract {
        Contract::received(
            Submission {
                document: DocumentRef {
                    uri: "s3://contracts/msa.pdf".into(),
                    file_name: "msa.pdf".into(),
                    content_type: "application/pdf".into(),
                    size_bytes: 4096,
                },
                organization_id: "acme".into(),
                submitted_by: "kelly".into(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn every_write_bumps_version_and_history() {
        let now = Utc::now();
        let c = received();
        let c = plan(&c, &Transition::Dispatch, now).unwrap();
        let c = plan(
            &c,
            &Transition::Extracted {
                data: json!({"contract_number": "A-1"}),
                accuracy_score: 97.0,
            },
            now,
        )
        .unwrap();

        assert_eq!(c.version, 2);
        assert_eq!(c.state, ContractState::Extracted);
        assert_eq!(c.accuracy_score, Some(97.0));
        assert_eq!(c.history.len(), 2);
        assert_eq!(c.history[1].from_state, ContractState::Extracting);
        assert_eq!(c.history[1].version, 2);
    }

    #[test]
    fn skipping_a_predecessor_is_rejected() {
        let c = received();
        let err = plan(&c, &Transition::Validated, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: ContractState::Received,
                to: ContractState::Validated
            }
        ));
    }

    #[test]
    fn retry_is_a_recorded_self_transition() {
        let now = Utc::now();
        let c = plan(&received(), &Transition::Dispatch, now).unwrap();
        let c = plan(
            &c,
            &Transition::RetryScheduled {
                stage: Stage::Extraction,
                attempt: 1,
                reason: "transient failure: timeout".into(),
            },
            now,
        )
        .unwrap();

        assert_eq!(c.state, ContractState::Extracting);
        assert_eq!(c.attempts_for(Stage::Extraction), 1);
        let last = c.history.last().unwrap();
        assert_eq!(last.from_state, last.to_state);
        assert_eq!(last.reason.as_deref(), Some("transient failure: timeout"));
    }

    #[test]
    fn attempts_reset_on_stage_change() {
        let now = Utc::now();
        let mut c = plan(&received(), &Transition::Dispatch, now).unwrap();
        c.attempts.count = 3;
        let c = plan(
            &c,
            &Transition::Extracted {
                data: json!({}),
                accuracy_score: 99.0,
            },
            now,
        )
        .unwrap();
        assert_eq!(c.attempts.count, 3);
        let c = plan(&c, &Transition::BeginValidation, now).unwrap();
        assert_eq!(c.attempts, StageAttempts::fresh(Stage::Validation));
    }

    #[test]
    fn live_po_lease_cannot_be_reclaimed() {
        let now = Utc::now();
        let mut c = received();
        c.state = ContractState::GeneratingPo;
        c.po_lease_until = Some(now + chrono::Duration::seconds(60));
        assert!(
            plan(
                &c,
                &Transition::ReclaimPoGeneration {
                    lease_until: now + chrono::Duration::seconds(180)
                },
                now
            )
            .is_err()
        );

        c.po_lease_until = Some(now - chrono::Duration::seconds(1));
        let c = plan(
            &c,
            &Transition::ReclaimPoGeneration {
                lease_until: now + chrono::Duration::seconds(180),
            },
            now,
        )
        .unwrap();
        assert_eq!(c.state, ContractState::GeneratingPo);
    }

    #[test]
    fn notifications_are_recorded_in_terminal_states() {
        let now = Utc::now();
        let mut c = received();
        c.state = ContractState::Completed;
        let c = plan(
            &c,
            &Transition::NotificationClaimed {
                template: NotificationTemplate::ContractCompleted,
                lease_until: now,
            },
            now,
        )
        .unwrap();
        let c = plan(
            &c,
            &Transition::NotificationDelivered {
                template: NotificationTemplate::ContractCompleted,
            },
            now,
        )
        .unwrap();

        assert_eq!(c.notifications.len(), 1);
        assert!(c.notifications[0].status.is_settled());
        assert!(c.history.is_empty());
    }
}
