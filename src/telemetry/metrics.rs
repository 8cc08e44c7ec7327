//! Metric instrument factories for contractq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"contractq"` meter.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry_sdk::metrics::{Aggregation, Instrument, Stream};

pub const STAGE_DURATION: &str = "contractq.stage.duration_ms";
pub const BATCH_DURATION: &str = "contractq.batch.duration_ms";

/// Stage latency buckets in ms. Stages run from sub-second sends up to the
/// five-minute extraction hard limit, so the upper buckets track the limits.
const STAGE_BOUNDS_MS: [f64; 14] = [
    50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0,
    120_000.0, 180_000.0, 240_000.0, 300_000.0,
];

/// Batch admission does no stage work, only validation and enqueueing.
const BATCH_BOUNDS_MS: [f64; 9] = [5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 5_000.0];

/// Bucket boundaries for a contractq histogram, `None` for SDK defaults.
pub fn histogram_bounds(instrument: &str) -> Option<&'static [f64]> {
    match instrument {
        STAGE_DURATION => Some(&STAGE_BOUNDS_MS),
        BATCH_DURATION => Some(&BATCH_BOUNDS_MS),
        _ => None,
    }
}

/// Meter provider view applying [`histogram_bounds`].
pub fn histogram_view(instrument: &Instrument) -> Option<Stream> {
    let bounds = histogram_bounds(instrument.name())?;
    Stream::builder()
        .with_aggregation(Aggregation::ExplicitBucketHistogram {
            boundaries: bounds.to_vec(),
            record_min_max: true,
        })
        .build()
        .ok()
}

/// Returns the shared meter for contractq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("contractq")
}

/// Counter: submissions seen by the admission controller.
/// Labels: `result` ("admitted" | "rejected"), `scope` on rejection.
pub fn contracts_submitted() -> Counter<u64> {
    meter()
        .u64_counter("contractq.contracts.submitted")
        .with_description("Number of contract submissions")
        .build()
}

/// Counter: contract state transitions, including retry self-transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("contractq.contracts.state_transitions")
        .with_description("Number of contract state transitions")
        .build()
}

/// Counter: retries scheduled.
/// Labels: `stage`, `failure`.
pub fn retries_scheduled() -> Counter<u64> {
    meter()
        .u64_counter("contractq.retries.scheduled")
        .with_description("Number of stage retries scheduled")
        .build()
}

/// Histogram: stage handler latency per delivery.
/// Labels: `stage`, `outcome`.
pub fn stage_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram(STAGE_DURATION)
        .with_description("Stage handler duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Histogram: wall time to admit one batch of submissions.
pub fn batch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram(BATCH_DURATION)
        .with_description("Batch submission duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: circuit breaker state changes.
/// Labels: `breaker`, `from`, `to`.
pub fn breaker_transitions() -> Counter<u64> {
    meter()
        .u64_counter("contractq.breaker.transitions")
        .with_description("Number of circuit breaker state changes")
        .build()
}

/// Counter: queue-level operations (send, read, ack, nack).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("contractq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Gauge: tasks held per queue. Drives horizontal scaling.
/// Labels: `queue`.
pub fn queue_depth() -> Gauge<u64> {
    meter()
        .u64_gauge("contractq.queue.depth")
        .with_description("Tasks held by each queue")
        .build()
}

/// Counter: external side effects performed.
/// Labels: `effect` ("purchase_order" | "notification"), `template`.
pub fn side_effects() -> Counter<u64> {
    meter()
        .u64_counter("contractq.side_effects")
        .with_description("Number of side effects performed")
        .build()
}

/// Counter: operational alerts (credential or configuration failures).
pub fn operational_alerts() -> Counter<u64> {
    meter()
        .u64_counter("contractq.alerts")
        .with_description("Number of operational alerts raised")
        .build()
}
