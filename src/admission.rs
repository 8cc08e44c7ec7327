//! Admission control: token buckets per caller and per organization.
//!
//! Both buckets are checked under one lock before either is charged, so a
//! request is either admitted in full or rejected without side effects.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// `limit` requests per `window_secs`, refilled continuously.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub window_secs: u64,
}

impl RateLimit {
    pub const fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window_secs: 60,
        }
    }

    fn tokens_per_sec(&self) -> f64 {
        if self.window_secs == 0 {
            return f64::INFINITY;
        }
        f64::from(self.limit) / self.window_secs as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub per_caller: RateLimit,
    pub per_organization: RateLimit,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            per_caller: RateLimit::per_minute(100),
            per_organization: RateLimit::per_minute(500),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    updated: Instant,
}

impl Bucket {
    fn full(limit: &RateLimit, now: Instant) -> Self {
        Self {
            tokens: f64::from(limit.limit),
            updated: now,
        }
    }

    fn refill(&mut self, limit: &RateLimit, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        let refilled = self.tokens + elapsed * limit.tokens_per_sec();
        self.tokens = refilled.min(f64::from(limit.limit));
        self.updated = now;
    }

    /// Time until one whole token is available.
    fn wait(&self, limit: &RateLimit) -> Duration {
        let rate = limit.tokens_per_sec();
        if rate <= 0.0 {
            return Duration::from_secs(limit.window_secs);
        }
        Duration::from_secs_f64(((1.0 - self.tokens).max(0.0) / rate).min(limit.window_secs as f64))
    }
}

/// Interval between sweeps of refilled buckets.
const SWEEP_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Buckets {
    callers: HashMap<String, Bucket>,
    organizations: HashMap<String, Bucket>,
    swept: Instant,
}

impl Buckets {
    fn new(now: Instant) -> Self {
        Self {
            callers: HashMap::new(),
            organizations: HashMap::new(),
            swept: now,
        }
    }

    /// Forget buckets that have refilled; a full bucket admits exactly like a new one.
    fn sweep(&mut self, config: &AdmissionConfig, now: Instant) {
        if now.saturating_duration_since(self.swept) < SWEEP_EVERY {
            return;
        }
        self.swept = now;
        prune(&mut self.callers, &config.per_caller, now);
        prune(&mut self.organizations, &config.per_organization, now);
    }
}

fn prune(buckets: &mut HashMap<String, Bucket>, limit: &RateLimit, now: Instant) {
    buckets.retain(|_, bucket| {
        bucket.refill(limit, now);
        bucket.tokens < f64::from(limit.limit)
    });
}

#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    buckets: Mutex<Buckets>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(Buckets::new(Instant::now())),
        }
    }

    /// Charge one request to `caller` and `organization_id`.
    ///
    /// Fails with `Error::AdmissionRejected` when either bucket is empty.
    pub fn admit(&self, caller: &str, organization_id: &str) -> Result<()> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets.sweep(&self.config, now);
        let Buckets {
            callers,
            organizations,
            ..
        } = &mut *buckets;

        let caller_limit = &self.config.per_caller;
        let org_limit = &self.config.per_organization;

        let caller_bucket = callers
            .entry(caller.to_string())
            .or_insert_with(|| Bucket::full(caller_limit, now));
        caller_bucket.refill(caller_limit, now);

        let org_bucket = organizations
            .entry(organization_id.to_string())
            .or_insert_with(|| Bucket::full(org_limit, now));
        org_bucket.refill(org_limit, now);

        if caller_bucket.tokens < 1.0 {
            return Err(Error::AdmissionRejected {
                scope: format!("caller {caller}"),
                retry_after: caller_bucket.wait(caller_limit),
            });
        }
        if org_bucket.tokens < 1.0 {
            return Err(Error::AdmissionRejected {
                scope: format!("organization {organization_id}"),
                retry_after: org_bucket.wait(org_limit),
            });
        }

        caller_bucket.tokens -= 1.0;
        org_bucket.tokens -= 1.0;
        Ok(())
    }

    #[cfg(test)]
    fn tracked(&self) -> (usize, usize) {
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        (buckets.callers.len(), buckets.organizations.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rejected_request_charges_nothing() {
        let controller = AdmissionController::new(AdmissionConfig {
            per_caller: RateLimit::per_minute(10),
            per_organization: RateLimit::per_minute(2),
        });
        controller.admit("ana", "acme").unwrap();
        controller.admit("ana", "acme").unwrap();
        // Org exhausted; ana's own bucket must not be charged for the rejection.
        assert!(controller.admit("ana", "acme").is_err());

        // A different org still sees ana with 8 tokens.
        for _ in 0..8 {
            controller.admit("ana", "globex").unwrap();
        }
        assert!(controller.admit("ana", "globex").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refilled_buckets_are_forgotten() {
        let controller = AdmissionController::new(AdmissionConfig {
            per_caller: RateLimit {
                limit: 2,
                window_secs: 600,
            },
            per_organization: RateLimit::per_minute(100),
        });
        controller.admit("idle", "acme").unwrap();
        controller.admit("busy", "acme").unwrap();
        controller.admit("busy", "acme").unwrap();
        assert_eq!(controller.tracked(), (2, 1));

        // idle is full again after 300s; busy has regained a single token.
        tokio::time::advance(Duration::from_secs(301)).await;
        controller.admit("busy", "acme").unwrap();
        assert_eq!(controller.tracked(), (1, 1));

        assert!(controller.admit("busy", "acme").is_err());
        controller.admit("idle", "acme").unwrap();
        controller.admit("idle", "acme").unwrap();
        assert!(controller.admit("idle", "acme").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_reflects_refill_rate() {
        let controller = AdmissionController::new(AdmissionConfig {
            per_caller: RateLimit::per_minute(1),
            per_organization: RateLimit::per_minute(100),
        });
        controller.admit("ana", "acme").unwrap();
        match controller.admit("ana", "acme") {
            Err(Error::AdmissionRejected { retry_after, scope }) => {
                assert_eq!(scope, "caller ana");
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::from_secs(59));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
