//! Retry/backoff policy.
//!
//! A pure decision over a classified [`Failure`] and the attempts already
//! recorded for the stage. No queue or network access happens here.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Failure;

/// Per-stage retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Failed attempts after which the contract is failed.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Relative jitter applied to each delay, e.g. 0.2 for ±20%.
    pub jitter: f64,
    /// Multiplier applied to the delay when upstream throttled us.
    pub rate_limited_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 600_000,
            jitter: 0.2,
            rate_limited_factor: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-enqueue as business attempt `attempt`, not before `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Drive the contract to `FAILED`, recording `attempt` failed attempts.
    GiveUp { attempt: u32, reason: String },
}

impl RetryPolicy {
    /// Unjittered delay before attempt `attempt`: `min(base * 2^attempt, cap)`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn decide(&self, failure: &Failure, prior_attempts: u32) -> RetryDecision {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.decide_with(failure, prior_attempts, sample)
    }

    /// Deterministic form of [`decide`](Self::decide); `jitter_sample` is in `[-1, 1]`.
    pub fn decide_with(
        &self,
        failure: &Failure,
        prior_attempts: u32,
        jitter_sample: f64,
    ) -> RetryDecision {
        let attempt = prior_attempts.saturating_add(1);

        if !failure.is_retryable() {
            return RetryDecision::GiveUp {
                attempt,
                reason: failure.to_string(),
            };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                attempt,
                reason: format!("retries exhausted after {attempt} attempts: {failure}"),
            };
        }

        let cap = Duration::from_millis(self.max_delay_ms);
        let base = self.base_delay_for(attempt);
        let spread = 1.0 + self.jitter * jitter_sample.clamp(-1.0, 1.0);
        let jittered = base.mul_f64(spread.max(0.0)).min(cap);

        let delay = match failure {
            Failure::RateLimited { retry_after } => jittered
                .saturating_mul(self.rate_limited_factor.max(1))
                .min(cap)
                .max(retry_after.unwrap_or_default()),
            Failure::CircuitOpen { remaining } => jittered.max(*remaining),
            _ => jittered,
        };

        RetryDecision::Retry { attempt, delay }
    }
}
