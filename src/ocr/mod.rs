//! OCR client collaborator.
//!
//! The vendor is unreliable, throttled and slow. [`GuardedOcr`] puts every
//! call behind the circuit breaker and a bounded timeout.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::breaker::CircuitBreaker;
use crate::error::Failure;
use crate::model::DocumentRef;

pub use http::HttpOcrClient;

/// Structured fields and the confidence they were read with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub data: Value,
    /// 0-100.
    pub accuracy_score: f64,
}

#[async_trait]
pub trait OcrClient: Send + Sync {
    async fn extract(&self, document: &DocumentRef, timeout: Duration)
    -> Result<Extraction, Failure>;
}

/// OCR calls through the breaker, cut off after `timeout`.
pub struct GuardedOcr {
    client: Arc<dyn OcrClient>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl GuardedOcr {
    pub fn new(client: Arc<dyn OcrClient>, breaker: Arc<CircuitBreaker>, timeout: Duration) -> Self {
        Self {
            client,
            breaker,
            timeout,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn extract(&self, document: &DocumentRef) -> Result<Extraction, Failure> {
        let timeout = self.timeout;
        let client = &self.client;
        self.breaker
            .call(move || async move {
                match tokio::time::timeout(timeout, client.extract(document, timeout)).await {
                    Ok(result) => result,
                    Err(_) => Err(Failure::Transient(format!(
                        "OCR call timed out after {}s",
                        timeout.as_secs()
                    ))),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerState};
    use crate::event::RecordingSink;

    struct Hanging;

    #[async_trait]
    impl OcrClient for Hanging {
        async fn extract(&self, _: &DocumentRef, _: Duration) -> Result<Extraction, Failure> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(Failure::Transient("unreachable".into()))
        }
    }

    fn doc() -> DocumentRef {
        DocumentRef {
            uri: "s3://contracts/x.pdf".into(),
            file_name: "x.pdf".into(),
            content_type: "application/pdf".into(),
            size_bytes: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_transient_and_counts_against_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(
            "ocr",
            BreakerConfig {
                min_calls: 1,
                window_size: 1,
                ..BreakerConfig::default()
            },
            Arc::new(RecordingSink::new()),
        ));
        let ocr = GuardedOcr::new(Arc::new(Hanging), breaker.clone(), Duration::from_secs(30));

        let err = ocr.extract(&doc()).await.unwrap_err();
        assert!(matches!(err, Failure::Transient(_)));
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = ocr.extract(&doc()).await.unwrap_err();
        assert!(matches!(err, Failure::CircuitOpen { .. }));
    }
}
