//! Structured events emitted on every transition, retry and breaker change.
//!
//! Collectors subscribe through an [`EventSink`]. In production the
//! [`TracingSink`] writes each event as a JSON log line and feeds the metric
//! instruments; [`RecordingSink`] keeps them in memory.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::breaker::BreakerState;
use crate::model::{ContractId, ContractState, NotificationTemplate, Stage};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    ContractAdmitted {
        contract_id: ContractId,
        organization_id: String,
    },
    AdmissionRejected {
        organization_id: String,
        caller: String,
        scope: String,
    },
    BatchStarted {
        batch_id: Uuid,
        size: usize,
    },
    BatchFinished {
        batch_id: Uuid,
        admitted: usize,
        rejected: usize,
        latency_ms: u64,
    },
    StateTransition {
        contract_id: ContractId,
        from: ContractState,
        to: ContractState,
        version: u64,
        reason: Option<String>,
    },
    StageFinished {
        contract_id: ContractId,
        stage: Stage,
        outcome: String,
        latency_ms: u64,
        attempt_count: u32,
        delivery_count: u32,
    },
    RetryScheduled {
        contract_id: ContractId,
        stage: Stage,
        attempt_count: u32,
        delay_ms: u64,
        failure: String,
    },
    PurchaseOrderGenerated {
        contract_id: ContractId,
        artifact_ref: String,
    },
    NotificationSent {
        contract_id: ContractId,
        template: NotificationTemplate,
    },
    BreakerStateChanged {
        breaker: String,
        from: BreakerState,
        to: BreakerState,
    },
    OperationalAlert {
        contract_id: Option<ContractId>,
        message: String,
    },
}

/// Destination for pipeline events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Logs events and records the matching metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        record_metrics(&event);
        let json = serde_json::to_string(&event).unwrap_or_default();
        if matches!(event, PipelineEvent::OperationalAlert { .. }) {
            error!(target: "contractq::events", alert = true, event = %json, "pipeline_event");
        } else {
            info!(target: "contractq::events", event = %json, "pipeline_event");
        }
    }
}

fn record_metrics(event: &PipelineEvent) {
    match event {
        PipelineEvent::ContractAdmitted { .. } => {
            metrics::contracts_submitted().add(1, &[KeyValue::new("result", "admitted")]);
        }
        PipelineEvent::AdmissionRejected { scope, .. } => {
            metrics::contracts_submitted().add(
                1,
                &[
                    KeyValue::new("result", "rejected"),
                    KeyValue::new("scope", scope.clone()),
                ],
            );
        }
        PipelineEvent::BatchStarted { .. } => {}
        PipelineEvent::BatchFinished { latency_ms, .. } => {
            metrics::batch_duration_ms().record(*latency_ms as f64, &[]);
        }
        PipelineEvent::StateTransition { from, to, .. } => {
            metrics::state_transitions().add(
                1,
                &[
                    KeyValue::new("from", from.as_str()),
                    KeyValue::new("to", to.as_str()),
                ],
            );
        }
        PipelineEvent::StageFinished {
            stage,
            outcome,
            latency_ms,
            ..
        } => {
            metrics::stage_duration_ms().record(
                *latency_ms as f64,
                &[
                    KeyValue::new("stage", stage.as_str()),
                    KeyValue::new("outcome", outcome.clone()),
                ],
            );
        }
        PipelineEvent::RetryScheduled { stage, failure, .. } => {
            metrics::retries_scheduled().add(
                1,
                &[
                    KeyValue::new("stage", stage.as_str()),
                    KeyValue::new("failure", failure.clone()),
                ],
            );
        }
        PipelineEvent::PurchaseOrderGenerated { .. } => {
            metrics::side_effects().add(1, &[KeyValue::new("effect", "purchase_order")]);
        }
        PipelineEvent::NotificationSent { template, .. } => {
            metrics::side_effects().add(
                1,
                &[
                    KeyValue::new("effect", "notification"),
                    KeyValue::new("template", template.id()),
                ],
            );
        }
        PipelineEvent::BreakerStateChanged { breaker, from, to } => {
            metrics::breaker_transitions().add(
                1,
                &[
                    KeyValue::new("breaker", breaker.clone()),
                    KeyValue::new("from", from.as_str()),
                    KeyValue::new("to", to.as_str()),
                ],
            );
        }
        PipelineEvent::OperationalAlert { .. } => {
            metrics::operational_alerts().add(1, &[]);
        }
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Delays of the retries scheduled for one contract, in order.
    pub fn retry_delays(&self, id: ContractId) -> Vec<std::time::Duration> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::RetryScheduled {
                    contract_id,
                    delay_ms,
                    ..
                } if contract_id == id => Some(std::time::Duration::from_millis(delay_ms)),
                _ => None,
            })
            .collect()
    }

    /// States one contract passed through, starting with its first target.
    pub fn states_of(&self, id: ContractId) -> Vec<ContractState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::StateTransition {
                    contract_id, to, ..
                } if contract_id == id => Some(to),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: PipelineEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
