//! Pipeline tuning loaded from TOML.
//!
//! Every field has a default, so an empty file (or none at all) yields a
//! working configuration.
//!
//! ```toml
//! ocr_timeout_secs = 30
//!
//! [stages.extraction]
//! concurrency = 8
//! soft_limit_secs = 240
//! hard_limit_secs = 300
//!
//! [stages.extraction.retry]
//! max_attempts = 5
//!
//! [validation]
//! threshold = 95.0
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionConfig;
use crate::breaker::BreakerConfig;
use crate::error::{Error, Result};
use crate::model::{QueueName, Stage};
use crate::retry::RetryPolicy;
use crate::validation::{DocumentRules, ValidationRules};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stages: StagesConfig,
    pub breaker: BreakerConfig,
    pub admission: AdmissionConfig,
    pub validation: ValidationRules,
    pub documents: DocumentRules,
    pub worker: WorkerConfig,
    /// Bound on a single OCR call.
    pub ocr_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: StagesConfig::default(),
            breaker: BreakerConfig::default(),
            admission: AdmissionConfig::default(),
            validation: ValidationRules::default(),
            documents: DocumentRules::default(),
            worker: WorkerConfig::default(),
            ocr_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read pipeline config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| Error::Config(format!("invalid pipeline config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        for (name, stage) in self.stages.iter() {
            if stage.concurrency == 0 {
                return Err(Error::Config(format!("stages.{name}.concurrency must be at least 1")));
            }
            if stage.soft_limit_secs > stage.hard_limit_secs {
                return Err(Error::Config(format!(
                    "stages.{name}: soft limit {}s exceeds hard limit {}s",
                    stage.soft_limit_secs, stage.hard_limit_secs
                )));
            }
            if stage.retry.max_attempts == 0 {
                return Err(Error::Config(format!(
                    "stages.{name}.retry.max_attempts must be at least 1"
                )));
            }
            if !(0.0..1.0).contains(&stage.retry.jitter) {
                return Err(Error::Config(format!(
                    "stages.{name}.retry.jitter must be in [0, 1)"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.breaker.failure_ratio) {
            return Err(Error::Config("breaker.failure_ratio must be in [0, 1]".into()));
        }
        if self.breaker.success_threshold == 0 || self.breaker.half_open_max_probes == 0 {
            return Err(Error::Config(
                "breaker.success_threshold and breaker.half_open_max_probes must be at least 1"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Limits for one stage's worker pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageConfig {
    /// Concurrent handlers per process.
    pub concurrency: usize,
    /// Past this a warning is logged; the handler keeps running.
    pub soft_limit_secs: u64,
    /// Past this the handler is cancelled and the attempt counts as transient.
    pub hard_limit_secs: u64,
    /// Broker visibility window. Defaults to the hard limit plus 30s.
    pub visibility_secs: Option<u64>,
    pub retry: RetryPolicy,
}

impl StageConfig {
    fn with_limits(soft_limit_secs: u64, hard_limit_secs: u64) -> Self {
        Self {
            concurrency: 4,
            soft_limit_secs,
            hard_limit_secs,
            visibility_secs: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn soft_limit(&self) -> Duration {
        Duration::from_secs(self.soft_limit_secs)
    }

    pub fn hard_limit(&self) -> Duration {
        Duration::from_secs(self.hard_limit_secs)
    }

    pub fn visibility(&self) -> Duration {
        Duration::from_secs(
            self.visibility_secs
                .unwrap_or(self.hard_limit_secs.saturating_add(30)),
        )
    }
}

/// A `[stages.*]` table as written; absent keys keep that stage's defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StagePatch {
    concurrency: Option<usize>,
    soft_limit_secs: Option<u64>,
    hard_limit_secs: Option<u64>,
    visibility_secs: Option<u64>,
    retry: Option<RetryPolicy>,
}

impl StagePatch {
    fn onto(self, mut base: StageConfig) -> StageConfig {
        if let Some(concurrency) = self.concurrency {
            base.concurrency = concurrency;
        }
        if let Some(soft) = self.soft_limit_secs {
            base.soft_limit_secs = soft;
        }
        if let Some(hard) = self.hard_limit_secs {
            base.hard_limit_secs = hard;
        }
        if self.visibility_secs.is_some() {
            base.visibility_secs = self.visibility_secs;
        }
        if let Some(retry) = self.retry {
            base.retry = retry;
        }
        base
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StagesPatch {
    extraction: StagePatch,
    po_generation: StagePatch,
    notification: StagePatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StagesPatch")]
pub struct StagesConfig {
    pub extraction: StageConfig,
    pub po_generation: StageConfig,
    pub notification: StageConfig,
}

impl Default for StagesConfig {
    fn default() -> Self {
        StagesPatch::default().into()
    }
}

impl From<StagesPatch> for StagesConfig {
    fn from(patch: StagesPatch) -> Self {
        Self {
            extraction: patch.extraction.onto(StageConfig::with_limits(240, 300)),
            po_generation: patch.po_generation.onto(StageConfig::with_limits(120, 180)),
            notification: patch.notification.onto(StageConfig::with_limits(30, 60)),
        }
    }
}

impl StagesConfig {
    /// Settings for `stage`. Validation runs inside the extraction handler.
    pub fn get(&self, stage: Stage) -> &StageConfig {
        match stage {
            Stage::Extraction | Stage::Validation => &self.extraction,
            Stage::PoGeneration => &self.po_generation,
            Stage::Notification => &self.notification,
        }
    }

    pub fn for_queue(&self, queue: QueueName) -> &StageConfig {
        match queue {
            QueueName::Extraction => &self.extraction,
            QueueName::PoGeneration => &self.po_generation,
            QueueName::Notification => &self.notification,
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&'static str, &StageConfig)> {
        [
            ("extraction", &self.extraction),
            ("po_generation", &self.po_generation),
            ("notification", &self.notification),
        ]
        .into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep between polls of an empty queue.
    pub poll_interval_ms: u64,
    /// Redelivery delay after a store or queue error mid-task.
    pub infra_retry_secs: u64,
    /// Interval between queue depth reports.
    pub depth_report_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            infra_retry_secs: 5,
            depth_report_secs: 15,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn infra_retry(&self) -> Duration {
        Duration::from_secs(self.infra_retry_secs)
    }

    pub fn depth_report(&self) -> Duration {
        Duration::from_secs(self.depth_report_secs)
    }
}
