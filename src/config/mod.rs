//! Typed configuration.
//!
//! Endpoints and credentials come from environment variables, loaded once at
//! startup; missing required vars fail fast. Pipeline tuning comes from an
//! optional TOML file (see [`PipelineConfig`]). Sensitive values are wrapped
//! in `SecretString` so they never reach the logs.

pub mod pipeline;
pub mod secrets;

use std::path::PathBuf;

use crate::error::{Error, Result};
use secrecy::SecretString;

pub use pipeline::{PipelineConfig, StageConfig, StagesConfig, WorkerConfig};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub ocr_endpoint: String,
    pub ocr_api_key: SecretString,
    pub po_renderer_url: String,
    pub notifier_url: String,
    /// Bearer token for the renderer and notifier, when they require one.
    pub collaborator_api_key: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub pipeline_config: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            ocr_endpoint: required_var("OCR_ENDPOINT")?,
            ocr_api_key: SecretString::from(required_var("OCR_API_KEY")?),
            po_renderer_url: required_var("PO_RENDERER_URL")?,
            notifier_url: required_var("NOTIFIER_URL")?,
            collaborator_api_key: secrets::optional_secret("COLLABORATOR_API_KEY"),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            pipeline_config: std::env::var("PIPELINE_CONFIG").ok().map(PathBuf::from),
        })
    }

    /// Pipeline tuning from `PIPELINE_CONFIG`, or the defaults when unset.
    pub fn pipeline(&self) -> Result<PipelineConfig> {
        match &self.pipeline_config {
            Some(path) => PipelineConfig::load(path),
            None => Ok(PipelineConfig::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
