//! Telemetry initialization, stage spans and the event sink.

use contractq::breaker::BreakerState;
use contractq::event::{EventSink, PipelineEvent, TracingSink};
use contractq::model::{ContractId, ContractState, NotificationTemplate, Stage, Task};
use contractq::telemetry::{TelemetryConfig, init_telemetry, metrics, pipeline};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Only one global subscriber per process; a second init returns Err.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "contractq-test".to_string(),
        log_level: "debug".to_string(),
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn histogram_views_install_on_meter_provider() {
    use opentelemetry::metrics::MeterProvider as _;

    let provider = SdkMeterProvider::builder()
        .with_view(metrics::histogram_view)
        .build();
    let meter = provider.meter("contractq-test");
    let stage = meter.f64_histogram(metrics::STAGE_DURATION).build();
    stage.record(42_000.0, &[KeyValue::new("stage", "extraction")]);
    let batch = meter.f64_histogram(metrics::BATCH_DURATION).build();
    batch.record(12.0, &[]);
}

#[test]
fn stage_span_records_outcome() {
    let task = Task::extraction(ContractId::new());
    let span = pipeline::start_stage_span(&task);
    pipeline::record_outcome(&span, "done");
}

#[test]
fn tracing_sink_accepts_every_event() {
    let id = ContractId::new();
    let sink = TracingSink;
    let events = [
        PipelineEvent::ContractAdmitted {
            contract_id: id,
            organization_id: "org-1".to_string(),
        },
        PipelineEvent::AdmissionRejected {
            organization_id: "org-1".to_string(),
            caller: "alice".to_string(),
            scope: "caller alice".to_string(),
        },
        PipelineEvent::BatchStarted {
            batch_id: id.0,
            size: 3,
        },
        PipelineEvent::BatchFinished {
            batch_id: id.0,
            admitted: 2,
            rejected: 1,
            latency_ms: 4,
        },
        PipelineEvent::StateTransition {
            contract_id: id,
            from: ContractState::Received,
            to: ContractState::Extracting,
            version: 1,
            reason: None,
        },
        PipelineEvent::StageFinished {
            contract_id: id,
            stage: Stage::Extraction,
            outcome: "done".to_string(),
            latency_ms: 12,
            attempt_count: 0,
            delivery_count: 1,
        },
        PipelineEvent::RetryScheduled {
            contract_id: id,
            stage: Stage::Extraction,
            attempt_count: 1,
            delay_ms: 2_000,
            failure: "transient".to_string(),
        },
        PipelineEvent::PurchaseOrderGenerated {
            contract_id: id,
            artifact_ref: "s3://po/1.pdf".to_string(),
        },
        PipelineEvent::NotificationSent {
            contract_id: id,
            template: NotificationTemplate::ContractCompleted,
        },
        PipelineEvent::BreakerStateChanged {
            breaker: "ocr".to_string(),
            from: BreakerState::Closed,
            to: BreakerState::Open,
        },
        PipelineEvent::OperationalAlert {
            contract_id: Some(id),
            message: "ocr rejected credentials".to_string(),
        },
    ];
    for event in events {
        sink.emit(event);
    }
}

#[test]
fn events_serialize_with_type_tag() {
    let event = PipelineEvent::StateTransition {
        contract_id: ContractId::new(),
        from: ContractState::Validating,
        to: ContractState::NeedsReview,
        version: 4,
        reason: Some("accuracy score 62 below threshold 95".to_string()),
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "state_transition");
    assert_eq!(json["from"], "VALIDATING");
    assert_eq!(json["to"], "NEEDS_REVIEW");
    assert_eq!(json["version"], 4);
}
