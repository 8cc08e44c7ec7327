//! Contract record and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for contract IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractId(pub Uuid);

impl ContractId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContractId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContractId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ContractId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractState {
    /// Admitted, extraction task enqueued.
    Received,
    /// An extraction delivery has picked it up. Retries stay here.
    Extracting,
    /// OCR succeeded; `extracted_data` and `accuracy_score` are set.
    Extracted,
    /// Validation rules are being applied.
    Validating,
    /// Passed validation, PO generation pending.
    Validated,
    /// Below threshold or missing fields. Parked until a reviewer acts.
    NeedsReview,
    /// PO renderer invoked under a lease.
    GeneratingPo,
    /// Done. Terminal.
    Completed,
    /// Exhausted retries or terminal error. Terminal.
    Failed,
}

impl ContractState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ContractState) -> bool {
        use ContractState::*;
        if to == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Received, Extracting)
                | (Extracting, Extracting)     // retry bookkeeping
                | (Extracting, Extracted)
                | (Extracted, Validating)
                | (Validating, Validated)
                | (Validating, NeedsReview)
                | (NeedsReview, Validated)     // reviewer approval
                | (Validated, GeneratingPo)
                | (GeneratingPo, GeneratingPo) // retry bookkeeping, lease reclaim
                | (GeneratingPo, Completed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, ContractState::Completed | ContractState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContractState::Received => "RECEIVED",
            ContractState::Extracting => "EXTRACTING",
            ContractState::Extracted => "EXTRACTED",
            ContractState::Validating => "VALIDATING",
            ContractState::Validated => "VALIDATED",
            ContractState::NeedsReview => "NEEDS_REVIEW",
            ContractState::GeneratingPo => "GENERATING_PO",
            ContractState::Completed => "COMPLETED",
            ContractState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ContractState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContractState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RECEIVED" => Ok(ContractState::Received),
            "EXTRACTING" => Ok(ContractState::Extracting),
            "EXTRACTED" => Ok(ContractState::Extracted),
            "VALIDATING" => Ok(ContractState::Validating),
            "VALIDATED" => Ok(ContractState::Validated),
            "NEEDS_REVIEW" => Ok(ContractState::NeedsReview),
            "GENERATING_PO" => Ok(ContractState::GeneratingPo),
            "COMPLETED" => Ok(ContractState::Completed),
            "FAILED" => Ok(ContractState::Failed),
            _ => Err(Error::Other(format!("unknown contract state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One phase of contract processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Validation,
    PoGeneration,
    Notification,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Validation => "validation",
            Stage::PoGeneration => "po_generation",
            Stage::Notification => "notification",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Business retry counter, scoped to the stage currently being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempts {
    pub stage: Stage,
    pub count: u32,
}

impl StageAttempts {
    pub fn fresh(stage: Stage) -> Self {
        Self { stage, count: 0 }
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Where the uploaded document lives. The pipeline never carries the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Blob store location (e.g. `s3://contracts/acme/2024-17.pdf`).
    pub uri: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

impl DocumentRef {
    /// Lower-cased file extension, if any.
    pub fn extension(&self) -> Option<String> {
        let (_, ext) = self.file_name.rsplit_once('.')?;
        Some(ext.to_ascii_lowercase())
    }
}

/// An inbound processing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub document: DocumentRef,
    pub organization_id: String,
    /// The caller charged by the admission controller.
    pub submitted_by: String,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Notification template, one per outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    ContractCompleted,
    ContractFailed,
    ContractReviewRequired,
}

impl NotificationTemplate {
    pub fn id(self) -> &'static str {
        match self {
            NotificationTemplate::ContractCompleted => "contract_completed",
            NotificationTemplate::ContractFailed => "contract_failed",
            NotificationTemplate::ContractReviewRequired => "contract_review_required",
        }
    }

    /// Template announcing a contract that has come to rest in `state`.
    pub fn for_state(state: ContractState) -> Option<Self> {
        match state {
            ContractState::Completed => Some(NotificationTemplate::ContractCompleted),
            ContractState::Failed => Some(NotificationTemplate::ContractFailed),
            ContractState::NeedsReview => Some(NotificationTemplate::ContractReviewRequired),
            _ => None,
        }
    }
}

impl std::fmt::Display for NotificationTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Progress of one side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EffectStatus {
    /// A retry is scheduled; nobody holds it.
    Pending,
    /// Claimed by a delivery until `lease_until`.
    InFlight { lease_until: DateTime<Utc> },
    Delivered { at: DateTime<Utc> },
    Abandoned { reason: String },
}

impl EffectStatus {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            EffectStatus::Delivered { .. } | EffectStatus::Abandoned { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub template: NotificationTemplate,
    pub status: EffectStatus,
    /// Failed send attempts so far.
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// One entry of the embedded transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from_state: ContractState,
    pub to_state: ContractState,
    /// Version the contract reached with this transition.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// A contract document tracked by the pipeline. Stored as one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub organization_id: String,
    pub submitted_by: String,
    pub document: DocumentRef,

    pub state: ContractState,
    pub attempts: StageAttempts,

    /// Populated by extraction; absent until that stage succeeds.
    pub extracted_data: Option<serde_json::Value>,
    /// OCR confidence on a 0-100 scale.
    pub accuracy_score: Option<f64>,
    pub review_reasons: Vec<String>,
    pub failure_reason: Option<String>,

    /// Reference returned by the PO renderer.
    pub artifact_ref: Option<String>,
    /// Holder's lease on PO generation while `GENERATING_PO`.
    pub po_lease_until: Option<DateTime<Utc>>,
    pub notifications: Vec<NotificationRecord>,

    /// Incremented on every write. Conditioned writes compare against it.
    pub version: u64,
    pub history: Vec<TransitionRecord>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    /// A freshly admitted contract in `RECEIVED`.
    pub fn received(submission: Submission, now: DateTime<Utc>) -> Self {
        Self {
            id: ContractId::new(),
            organization_id: submission.organization_id,
            submitted_by: submission.submitted_by,
            document: submission.document,
            state: ContractState::Received,
            attempts: StageAttempts::fresh(Stage::Extraction),
            extracted_data: None,
            accuracy_score: None,
            review_reasons: Vec::new(),
            failure_reason: None,
            artifact_ref: None,
            po_lease_until: None,
            notifications: Vec::new(),
            version: 0,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attempts recorded against `stage`; zero if another stage is current.
    pub fn attempts_for(&self, stage: Stage) -> u32 {
        if stage == Stage::Notification {
            return 0;
        }
        if self.attempts.stage == stage {
            self.attempts.count
        } else {
            0
        }
    }

    pub fn notification(&self, template: NotificationTemplate) -> Option<&NotificationRecord> {
        self.notifications.iter().find(|n| n.template == template)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Query view returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractStatus {
    pub id: ContractId,
    pub state: ContractState,
    pub version: u64,
    pub attempt_count: u32,
    pub extracted_data: Option<serde_json::Value>,
    pub accuracy_score: Option<f64>,
    pub failure_reason: Option<String>,
    pub review_reasons: Vec<String>,
    pub artifact_ref: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Contract> for ContractStatus {
    fn from(c: &Contract) -> Self {
        Self {
            id: c.id,
            state: c.state,
            version: c.version,
            attempt_count: c.attempts.count,
            extracted_data: c.extracted_data.clone(),
            accuracy_score: c.accuracy_score,
            failure_reason: c.failure_reason.clone(),
            review_reasons: c.review_reasons.clone(),
            artifact_ref: c.artifact_ref.clone(),
            updated_at: c.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ContractState::*;

    #[test]
    fn happy_path_edges_are_allowed() {
        let path = [
            Received,
            Extracting,
            Extracted,
            Validating,
            Validated,
            GeneratingPo,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn no_edge_skips_a_predecessor() {
        assert!(!Received.can_transition_to(Extracted));
        assert!(!Extracting.can_transition_to(Validated));
        assert!(!Extracted.can_transition_to(Validated));
        assert!(!Validated.can_transition_to(Completed));
        assert!(!NeedsReview.can_transition_to(GeneratingPo));
    }

    #[test]
    fn failed_reachable_from_every_non_terminal_state() {
        for state in [
            Received,
            Extracting,
            Extracted,
            Validating,
            Validated,
            NeedsReview,
            GeneratingPo,
        ] {
            assert!(state.can_transition_to(Failed), "{state} -> FAILED");
        }
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn state_round_trips_through_strings() {
        for state in [Received, NeedsReview, GeneratingPo, Failed] {
            assert_eq!(state.as_str().parse::<ContractState>().unwrap(), state);
        }
        assert_eq!("needs_review".parse::<ContractState>().unwrap(), NeedsReview);
        assert!("archived".parse::<ContractState>().is_err());
    }

    #[test]
    fn document_extension_is_lowercased() {
        let doc = DocumentRef {
            uri: "s3://bucket/a".into(),
            file_name: "Master.Agreement.PDF".into(),
            content_type: "application/pdf".into(),
            size_bytes: 10,
        };
        assert_eq!(doc.extension().as_deref(), Some("pdf"));
    }
}
