//! Downstream collaborators: the PO renderer and the notification sender.
//!
//! Both are invoked at most once per contract (per template, for
//! notifications) by the stage handlers; neither needs to deduplicate.

pub mod http;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::Failure;
use crate::model::{Contract, NotificationTemplate};

pub use http::{HttpNotifier, HttpRenderer};

#[async_trait]
pub trait PoRenderer: Send + Sync {
    /// Render the purchase order for a validated contract, returning a
    /// reference to the stored artifact.
    async fn generate(&self, contract: &Contract) -> Result<String, Failure>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, template: NotificationTemplate, variables: &Value) -> Result<(), Failure>;
}

/// Template variables for a contract notification.
pub fn notification_variables(contract: &Contract) -> Value {
    json!({
        "contract_id": contract.id,
        "organization_id": contract.organization_id,
        "submitted_by": contract.submitted_by,
        "file_name": contract.document.file_name,
        "state": contract.state,
        "accuracy_score": contract.accuracy_score,
        "artifact_ref": contract.artifact_ref,
        "failure_reason": contract.failure_reason,
        "review_reasons": contract.review_reasons,
        "contract_number": contract
            .extracted_data
            .as_ref()
            .and_then(|d| d.get("contract_number"))
            .cloned(),
    })
}
