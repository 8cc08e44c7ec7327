//! Error types for contractq.
//!
//! [`Error`] is what stores, queues and the public API return. [`Failure`]
//! is the classified outcome of one stage attempt; the retry engine turns it
//! into a retry or a `FAILED` transition and it never reaches the queue layer.

use std::time::Duration;

use thiserror::Error;

use crate::model::{ContractId, ContractState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("contract not found: {0}")]
    NotFound(ContractId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: ContractState,
        to: ContractState,
    },

    #[error("version conflict on contract {id}: expected version {expected}")]
    VersionConflict { id: ContractId, expected: u64 },

    #[error("admission rejected for {scope}, retry after {retry_after:?}")]
    AdmissionRejected { scope: String, retry_after: Duration },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("queue unavailable: {0}")]
    Queue(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classified failure of a stage attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Failure {
    /// Network error or timeout.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Upstream throttling. Retried with a longer backoff.
    #[error("rate limited upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// The breaker short-circuited the call; no request was issued.
    #[error("circuit open, next probe in {remaining:?}")]
    CircuitOpen { remaining: Duration },

    /// Malformed input. Terminal for the document.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Credential or configuration problem. Terminal, and an operational alert.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl Failure {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Failure::Transient(_) | Failure::RateLimited { .. } | Failure::CircuitOpen { .. }
        )
    }

    /// Whether this failure says something about the dependency's health.
    ///
    /// Per-document rejections and short-circuited calls do not.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, Failure::Transient(_) | Failure::RateLimited { .. })
    }

    /// Short label for metrics and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Failure::Transient(_) => "transient",
            Failure::RateLimited { .. } => "rate_limited",
            Failure::CircuitOpen { .. } => "circuit_open",
            Failure::Invalid(_) => "invalid",
            Failure::Unauthorized(_) => "unauthorized",
        }
    }
}
