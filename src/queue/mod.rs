//! Durable queue collaborator.
//!
//! At-least-once delivery: a dequeued task stays invisible for the visibility
//! window and becomes deliverable again unless it is acked first. Enqueue with
//! a delay keeps the task invisible until the delay has elapsed.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Delivery, QueueName, Receipt, Task};

pub use memory::MemoryQueue;

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Create the queue if it does not exist.
    async fn ensure_queue(&self, queue: QueueName) -> Result<()>;

    /// Append a task, invisible for `delay`.
    async fn enqueue(&self, queue: QueueName, task: &Task, delay: Duration) -> Result<()>;

    /// Take the next visible task, hiding it for `visibility`.
    async fn dequeue(&self, queue: QueueName, visibility: Duration) -> Result<Option<Delivery>>;

    /// Remove a delivered task. Acking an unknown receipt is a no-op.
    async fn ack(&self, queue: QueueName, receipt: Receipt) -> Result<()>;

    /// Return a delivered task to the queue, visible again after `delay`.
    async fn nack(&self, queue: QueueName, receipt: Receipt, delay: Duration) -> Result<()>;

    /// Number of tasks held by the queue, visible or not.
    async fn depth(&self, queue: QueueName) -> Result<u64>;
}
