//! Queued units of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::contract::{ContractId, NotificationTemplate, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// The independent queues. A backlog in one never blocks the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Extraction,
    PoGeneration,
    Notification,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [
        QueueName::Extraction,
        QueueName::PoGeneration,
        QueueName::Notification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Extraction => "extraction",
            QueueName::PoGeneration => "po-generation",
            QueueName::Notification => "notification",
        }
    }

    /// Queue that carries tasks for `stage`. Validation runs inline after extraction.
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Extraction | Stage::Validation => QueueName::Extraction,
            Stage::PoGeneration => QueueName::PoGeneration,
            Stage::Notification => QueueName::Notification,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extraction" => Ok(QueueName::Extraction),
            "po-generation" | "po_generation" => Ok(QueueName::PoGeneration),
            "notification" => Ok(QueueName::Notification),
            _ => Err(crate::error::Error::Other(format!("unknown queue: {s}"))),
        }
    }
}

/// Stage-specific parameters carried by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Business attempt this task was scheduled for. Deliveries older than
    /// the contract's recorded attempt are stale.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<NotificationTemplate>,
}

/// A queued unit of work bound to one contract and one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub contract_id: ContractId,
    pub stage: Stage,
    pub payload: TaskPayload,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest execution time. The router never delivers before it.
    pub not_before: DateTime<Utc>,
    /// Queue-level redelivery counter, filled in on delivery.
    #[serde(default)]
    pub delivery_count: u32,
}

impl Task {
    pub fn new(contract_id: ContractId, stage: Stage, payload: TaskPayload) -> Self {
        let now = Utc::now();
        Self {
            task_id: TaskId::new(),
            contract_id,
            stage,
            payload,
            enqueued_at: now,
            not_before: now,
            delivery_count: 0,
        }
    }

    pub fn extraction(contract_id: ContractId) -> Self {
        Self::new(
            contract_id,
            Stage::Extraction,
            TaskPayload {
                attempt: 0,
                template: None,
            },
        )
    }

    pub fn po_generation(contract_id: ContractId) -> Self {
        Self::new(
            contract_id,
            Stage::PoGeneration,
            TaskPayload {
                attempt: 0,
                template: None,
            },
        )
    }

    pub fn notification(contract_id: ContractId, template: NotificationTemplate) -> Self {
        Self::new(
            contract_id,
            Stage::Notification,
            TaskPayload {
                attempt: 0,
                template: Some(template),
            },
        )
    }

    /// A fresh task for the next attempt, not deliverable before `delay` elapses.
    pub fn retry(&self, attempt: u32, delay: std::time::Duration) -> Self {
        let now = Utc::now();
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        Self {
            task_id: TaskId::new(),
            contract_id: self.contract_id,
            stage: self.stage,
            payload: TaskPayload {
                attempt,
                template: self.payload.template,
            },
            enqueued_at: now,
            not_before: now.checked_add_signed(delay).unwrap_or(now),
            delivery_count: 0,
        }
    }

    pub fn queue(&self) -> QueueName {
        QueueName::for_stage(self.stage)
    }

    /// Time left until `not_before`.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.not_before - now).to_std().unwrap_or_default()
    }
}

/// Opaque handle for acknowledging one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt(pub i64);

/// A task handed to exactly one worker until acked or its visibility lapses.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: QueueName,
    pub receipt: Receipt,
    pub task: Task,
}
