//! Stage execution span helpers.

use tracing::Span;

use crate::model::Task;

/// Start a span for one delivery of `task`.
///
/// `stage.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_stage_span(task: &Task) -> Span {
    tracing::info_span!(
        "pipeline.stage",
        "stage.name" = task.stage.as_str(),
        "contract.id" = %task.contract_id,
        "task.id" = %task.task_id,
        "task.attempt" = task.payload.attempt,
        "task.delivery_count" = task.delivery_count,
        "stage.outcome" = tracing::field::Empty,
    )
}

pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("stage.outcome", outcome);
}
