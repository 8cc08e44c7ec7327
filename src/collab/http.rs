//! HTTP adapters for the PO renderer and notification services.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Notifier, PoRenderer};
use crate::error::Failure;
use crate::model::{Contract, NotificationTemplate};
use crate::ocr::http::{check_status, classify_transport};

/// JSON-over-HTTP endpoint with optional bearer auth.
struct Endpoint {
    client: reqwest::Client,
    url: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl Endpoint {
    fn new(url: impl Into<String>, api_key: Option<SecretString>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
            timeout,
        }
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, Failure> {
        let mut request = self.client.post(&self.url).timeout(self.timeout).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request.send().await.map_err(classify_transport)?;
        check_status(response).await
    }
}

pub struct HttpRenderer {
    endpoint: Endpoint,
}

impl HttpRenderer {
    pub fn new(url: impl Into<String>, api_key: Option<SecretString>, timeout: Duration) -> Self {
        Self {
            endpoint: Endpoint::new(url, api_key, timeout),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RenderResponse {
    artifact_ref: String,
}

#[async_trait]
impl PoRenderer for HttpRenderer {
    async fn generate(&self, contract: &Contract) -> Result<String, Failure> {
        let body = json!({
            "contract_id": contract.id,
            "organization_id": contract.organization_id,
            "extracted_data": contract.extracted_data,
        });
        let response = self.endpoint.post(&body).await?;
        let rendered: RenderResponse = response
            .json()
            .await
            .map_err(|e| Failure::Transient(format!("unreadable renderer response: {e}")))?;
        Ok(rendered.artifact_ref)
    }
}

pub struct HttpNotifier {
    endpoint: Endpoint,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>, api_key: Option<SecretString>, timeout: Duration) -> Self {
        Self {
            endpoint: Endpoint::new(url, api_key, timeout),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, template: NotificationTemplate, variables: &Value) -> Result<(), Failure> {
        let body = json!({
            "template_id": template.id(),
            "variables": variables,
        });
        self.endpoint.post(&body).await.map(|_| ())
    }
}
