//! Task queues on pgmq, through its SQL functions.
//!
//! Each [`QueueName`] maps to a pgmq queue `contractq_<name>` (pgmq queue
//! names cannot contain `-`). A read hides the message for the visibility
//! window; acking archives it so delivered tasks stay auditable.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::warn;

use crate::error::Result;
use crate::model::{Delivery, QueueName, Receipt, Task};
use crate::queue::TaskQueue;

const PREFIX: &str = "contractq_";

/// A message row returned by `pgmq.read`.
#[derive(Debug, Clone, sqlx::FromRow)]
struct PgmqMessage {
    msg_id: i64,
    read_ct: i32,
    message: serde_json::Value,
}

#[derive(Clone)]
pub struct PgmqQueue {
    pool: PgPool,
}

impl PgmqQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// pgmq table name for `queue`.
pub fn pgmq_name(queue: QueueName) -> String {
    format!("{PREFIX}{}", queue.as_str().replace('-', "_"))
}

/// Whole seconds, rounded up so a delay never fires early.
fn whole_secs(delay: Duration) -> i32 {
    let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
    i32::try_from(secs).unwrap_or(i32::MAX)
}

#[async_trait]
impl TaskQueue for PgmqQueue {
    async fn ensure_queue(&self, queue: QueueName) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(pgmq_name(queue))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn enqueue(&self, queue: QueueName, task: &Task, delay: Duration) -> Result<()> {
        let payload = serde_json::to_value(task)?;
        sqlx::query("SELECT pgmq.send($1, $2, $3)")
            .bind(pgmq_name(queue))
            .bind(payload)
            .bind(whole_secs(delay))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, queue: QueueName, visibility: Duration) -> Result<Option<Delivery>> {
        let name = pgmq_name(queue);
        let row: Option<PgmqMessage> = sqlx::query_as(
            "SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, 1)",
        )
        .bind(&name)
        .bind(whole_secs(visibility))
        .fetch_optional(&self.pool)
        .await?;

        let Some(msg) = row else {
            return Ok(None);
        };

        match serde_json::from_value::<Task>(msg.message) {
            Ok(mut task) => {
                task.delivery_count = u32::try_from(msg.read_ct).unwrap_or(0);
                Ok(Some(Delivery {
                    queue,
                    receipt: Receipt(msg.msg_id),
                    task,
                }))
            }
            Err(e) => {
                // Undecodable payloads would be redelivered forever.
                warn!(queue = %name, msg_id = msg.msg_id, error = %e, "archiving undecodable task");
                self.ack(queue, Receipt(msg.msg_id)).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, queue: QueueName, receipt: Receipt) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(pgmq_name(queue))
            .bind(receipt.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, queue: QueueName, receipt: Receipt, delay: Duration) -> Result<()> {
        sqlx::query("SELECT pgmq.set_vt($1, $2, $3)")
            .bind(pgmq_name(queue))
            .bind(receipt.0)
            .bind(whole_secs(delay))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<u64> {
        let (length,): (i64,) = sqlx::query_as("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(pgmq_name(queue))
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(length).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_are_pgmq_safe() {
        assert_eq!(pgmq_name(QueueName::Extraction), "contractq_extraction");
        assert_eq!(pgmq_name(QueueName::PoGeneration), "contractq_po_generation");
        assert_eq!(pgmq_name(QueueName::Notification), "contractq_notification");
    }

    #[test]
    fn delays_round_up_to_whole_seconds() {
        assert_eq!(whole_secs(Duration::ZERO), 0);
        assert_eq!(whole_secs(Duration::from_millis(1)), 1);
        assert_eq!(whole_secs(Duration::from_secs(30)), 30);
        assert_eq!(whole_secs(Duration::from_millis(1500)), 2);
    }
}
