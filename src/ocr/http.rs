//! HTTP adapter for the OCR vendor.
//!
//! Failure classification is shared with the other HTTP collaborators.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{Extraction, OcrClient};
use crate::error::Failure;
use crate::model::DocumentRef;

pub struct HttpOcrClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
}

impl HttpOcrClient {
    pub fn new(endpoint: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    data: serde_json::Value,
    /// Vendors report either 0-1 or 0-100.
    confidence: f64,
}

#[async_trait]
impl OcrClient for HttpOcrClient {
    async fn extract(
        &self,
        document: &DocumentRef,
        timeout: Duration,
    ) -> Result<Extraction, Failure> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .timeout(timeout)
            .json(&json!({
                "document_uri": document.uri,
                "file_name": document.file_name,
                "content_type": document.content_type,
            }))
            .send()
            .await
            .map_err(classify_transport)?;

        let response = check_status(response).await?;
        let body: OcrResponse = response
            .json()
            .await
            .map_err(|e| Failure::Transient(format!("unreadable OCR response: {e}")))?;

        let accuracy_score = normalize_score(body.confidence);
        debug!(uri = %document.uri, accuracy_score, "OCR extraction returned");
        Ok(Extraction {
            data: body.data,
            accuracy_score,
        })
    }
}

fn normalize_score(raw: f64) -> f64 {
    let score = if raw <= 1.0 { raw * 100.0 } else { raw };
    score.clamp(0.0, 100.0)
}

/// Map a transport error to a failure class.
pub(crate) fn classify_transport(err: reqwest::Error) -> Failure {
    if err.is_timeout() {
        Failure::Transient(format!("request timed out: {err}"))
    } else if err.is_builder() {
        Failure::Invalid(format!("request could not be built: {err}"))
    } else {
        Failure::Transient(format!("request failed: {err}"))
    }
}

/// Pass successful responses through; classify the rest.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, Failure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, retry_after, &body))
}

pub(crate) fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Failure {
    let detail = format!("{status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::TOO_MANY_REQUESTS => Failure::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Failure::Unauthorized(detail),
        StatusCode::REQUEST_TIMEOUT => Failure::Transient(detail),
        s if s.is_server_error() => Failure::Transient(detail),
        _ => Failure::Invalid(detail),
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
