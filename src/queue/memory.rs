//! In-process queue with visibility windows on the tokio clock.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::TaskQueue;
use crate::error::Result;
use crate::model::{Delivery, QueueName, Receipt, Task};

#[derive(Debug)]
struct Message {
    id: i64,
    task: Task,
    visible_at: Instant,
    read_count: u32,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<QueueName, Vec<Message>>,
    next_id: i64,
}

/// Queue backed by a mutex-guarded map. Messages keep their id across
/// redeliveries, like a pgmq `msg_id`.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time until the earliest message in `queue` becomes visible.
    /// `None` when the queue is empty.
    pub fn time_until_next(&self, queue: QueueName) -> Option<Duration> {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .queues
            .get(&queue)?
            .iter()
            .map(|m| m.visible_at.saturating_duration_since(now))
            .min()
    }

    /// Tasks currently held by `queue`, in enqueue order.
    pub fn snapshot(&self, queue: QueueName) -> Vec<Task> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .queues
            .get(&queue)
            .map(|msgs| msgs.iter().map(|m| m.task.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn ensure_queue(&self, queue: QueueName) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.queues.entry(queue).or_default();
        Ok(())
    }

    async fn enqueue(&self, queue: QueueName, task: &Task, delay: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.queues.entry(queue).or_default().push(Message {
            id,
            task: task.clone(),
            visible_at: Instant::now() + delay,
            read_count: 0,
        });
        Ok(())
    }

    async fn dequeue(&self, queue: QueueName, visibility: Duration) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(messages) = inner.queues.get_mut(&queue) else {
            return Ok(None);
        };
        // Oldest visible first; ids break ties in enqueue order.
        let next = messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .min_by_key(|m| (m.visible_at, m.id));
        let Some(message) = next else {
            return Ok(None);
        };
        message.read_count += 1;
        message.visible_at = now + visibility;

        let mut task = message.task.clone();
        task.delivery_count = message.read_count;
        Ok(Some(Delivery {
            queue,
            receipt: Receipt(message.id),
            task,
        }))
    }

    async fn ack(&self, queue: QueueName, receipt: Receipt) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(messages) = inner.queues.get_mut(&queue) {
            messages.retain(|m| m.id != receipt.0);
        }
        Ok(())
    }

    async fn nack(&self, queue: QueueName, receipt: Receipt, delay: Duration) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(message) = inner
            .queues
            .get_mut(&queue)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.id == receipt.0))
        {
            message.visible_at = now + delay;
        }
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<u64> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.queues.get(&queue).map_or(0, |m| m.len() as u64))
    }
}
