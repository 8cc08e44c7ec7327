//! Task queue router.
//!
//! Routes tasks to the queue for their stage and hides visibility windows and
//! delayed delivery behind a small API. Every operation is counted in
//! `contractq.queue.operations`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::debug;

use crate::error::Result;
use crate::model::{Delivery, QueueName, Task};
use crate::queue::TaskQueue;
use crate::telemetry::metrics;

const DEFAULT_VISIBILITY: Duration = Duration::from_secs(330);

#[derive(Clone)]
pub struct TaskRouter {
    queue: Arc<dyn TaskQueue>,
    visibility: HashMap<QueueName, Duration>,
}

impl TaskRouter {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        visibility: impl IntoIterator<Item = (QueueName, Duration)>,
    ) -> Self {
        Self {
            queue,
            visibility: visibility.into_iter().collect(),
        }
    }

    pub fn visibility(&self, queue: QueueName) -> Duration {
        self.visibility
            .get(&queue)
            .copied()
            .unwrap_or(DEFAULT_VISIBILITY)
    }

    /// Create every queue.
    pub async fn init(&self) -> Result<()> {
        for queue in QueueName::ALL {
            self.queue.ensure_queue(queue).await?;
        }
        Ok(())
    }

    /// Enqueue `task`, invisible until its `not_before`.
    pub async fn dispatch(&self, task: &Task) -> Result<()> {
        self.dispatch_after(task, task.remaining_delay(Utc::now())).await
    }

    /// Enqueue `task`, invisible for `delay`.
    pub async fn dispatch_after(&self, task: &Task, delay: Duration) -> Result<()> {
        let queue = task.queue();
        self.queue.enqueue(queue, task, delay).await?;
        record(queue, "send");
        debug!(
            queue = %queue,
            task_id = %task.task_id,
            contract_id = %task.contract_id,
            attempt = task.payload.attempt,
            delay_ms = delay.as_millis() as u64,
            "task dispatched"
        );
        Ok(())
    }

    /// Next visible task on `queue`, hidden for that queue's visibility window.
    pub async fn next(&self, queue: QueueName) -> Result<Option<Delivery>> {
        let delivery = self.queue.dequeue(queue, self.visibility(queue)).await?;
        if delivery.is_some() {
            record(queue, "read");
        }
        Ok(delivery)
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.queue.ack(delivery.queue, delivery.receipt).await?;
        record(delivery.queue, "ack");
        Ok(())
    }

    /// Hand the delivery back, visible again after `delay`.
    pub async fn defer(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        self.queue
            .nack(delivery.queue, delivery.receipt, delay)
            .await?;
        record(delivery.queue, "nack");
        Ok(())
    }

    pub async fn depth(&self, queue: QueueName) -> Result<u64> {
        self.queue.depth(queue).await
    }

    pub async fn depths(&self) -> Result<Vec<(QueueName, u64)>> {
        let mut depths = Vec::with_capacity(QueueName::ALL.len());
        for queue in QueueName::ALL {
            depths.push((queue, self.queue.depth(queue).await?));
        }
        Ok(depths)
    }
}

fn record(queue: QueueName, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.as_str()),
            KeyValue::new("operation", operation),
        ],
    );
}
