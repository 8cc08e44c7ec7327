//! Circuit breaker guarding the OCR dependency.
//!
//! One mutex-guarded sliding window of recent outcomes. The lock is never
//! held across an await: callers take a [`Permit`], make the call, then
//! record the outcome through the permit.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::Failure;
use crate::event::{EventSink, PipelineEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Number of most recent calls considered.
    pub window_size: usize,
    /// Calls required in the window before the ratio is evaluated.
    pub min_calls: usize,
    /// Trip when the failure ratio exceeds this.
    pub failure_ratio: f64,
    pub cooldown_secs: u64,
    /// Concurrent probes allowed while half-open.
    pub half_open_max_probes: u32,
    /// Consecutive probe successes needed to close.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            min_calls: 10,
            failure_ratio: 0.5,
            cooldown_secs: 30,
            half_open_max_probes: 1,
            success_threshold: 3,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// `true` is a failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    probe_successes: u32,
}

type Change = Option<(BreakerState, BreakerState)>;

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                opened_at: None,
                probes_in_flight: 0,
                probe_successes: 0,
            }),
            config,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Run `f` through the breaker. Short-circuits with `CircuitOpen` without
    /// calling `f` while open.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T, Failure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let permit = self.try_acquire()?;
        let result = f().await;
        permit.record(&result);
        result
    }

    /// Ask to issue one call.
    pub fn try_acquire(&self) -> Result<Permit<'_>, Failure> {
        let (result, change) = {
            let mut inner = self.lock();
            let mut change = None;

            if inner.state == BreakerState::Open {
                let elapsed = inner
                    .opened_at
                    .map_or(self.config.cooldown(), |at| at.elapsed());
                if elapsed < self.config.cooldown() {
                    return Err(Failure::CircuitOpen {
                        remaining: self.config.cooldown() - elapsed,
                    });
                }
                inner.state = BreakerState::HalfOpen;
                inner.probes_in_flight = 0;
                inner.probe_successes = 0;
                change = Some((BreakerState::Open, BreakerState::HalfOpen));
            }

            let state = inner.state;
            let probes = inner.probes_in_flight;
            let result = match state {
                BreakerState::Closed => Ok(Permit::new(self, false)),
                BreakerState::HalfOpen if probes < self.config.half_open_max_probes => {
                    inner.probes_in_flight += 1;
                    Ok(Permit::new(self, true))
                }
                _ => Err(Failure::CircuitOpen {
                    remaining: Duration::ZERO,
                }),
            };
            (result, change)
        };
        self.publish(change);
        result
    }

    fn record(&self, probe: bool, failed: bool) {
        let change = {
            let mut inner = self.lock();
            if probe {
                self.record_probe(&mut inner, failed)
            } else {
                self.record_closed(&mut inner, failed)
            }
        };
        self.publish(change);
    }

    fn record_probe(&self, inner: &mut Inner, failed: bool) -> Change {
        inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        if inner.state != BreakerState::HalfOpen {
            return None;
        }
        if failed {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_successes = 0;
            return Some((BreakerState::HalfOpen, BreakerState::Open));
        }
        inner.probe_successes += 1;
        if inner.probe_successes >= self.config.success_threshold {
            inner.state = BreakerState::Closed;
            inner.window.clear();
            inner.opened_at = None;
            return Some((BreakerState::HalfOpen, BreakerState::Closed));
        }
        None
    }

    fn record_closed(&self, inner: &mut Inner, failed: bool) -> Change {
        // Outcomes of calls admitted before a trip are dropped.
        if inner.state != BreakerState::Closed {
            return None;
        }
        if inner.window.len() >= self.config.window_size.max(1) {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);

        let calls = inner.window.len();
        if calls < self.config.min_calls.max(1) {
            return None;
        }
        let failures = inner.window.iter().filter(|f| **f).count();
        if failures as f64 / calls as f64 > self.config.failure_ratio {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            return Some((BreakerState::Closed, BreakerState::Open));
        }
        None
    }

    fn publish(&self, change: Change) {
        let Some((from, to)) = change else {
            return;
        };
        if to == BreakerState::Open {
            warn!(breaker = %self.name, %from, %to, "circuit breaker opened");
        } else {
            info!(breaker = %self.name, %from, %to, "circuit breaker state changed");
        }
        self.events.emit(PipelineEvent::BreakerStateChanged {
            breaker: self.name.clone(),
            from,
            to,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission of one call. Dropping it without recording counts as a failure,
/// so a call cancelled by a timeout is not lost.
#[must_use = "record the call outcome on the permit"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    recorded: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            recorded: false,
        }
    }

    /// Record the outcome. Failures that say nothing about the dependency's
    /// health count as successes.
    pub fn record<T>(mut self, result: &Result<T, Failure>) {
        let failed = matches!(result, Err(f) if f.counts_against_breaker());
        self.recorded = true;
        self.breaker.record(self.probe, failed);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.record(self.probe, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RecordingSink;

    fn breaker(config: BreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("ocr", config, Arc::new(RecordingSink::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_min_calls() {
        let b = breaker(BreakerConfig::default());
        for _ in 0..9 {
            let _ = b
                .call(|| async { Err::<(), _>(Failure::Transient("reset".into())) })
                .await;
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_documents_do_not_trip() {
        let b = breaker(BreakerConfig::default());
        for _ in 0..20 {
            let _ = b
                .call(|| async { Err::<(), _>(Failure::Invalid("blank".into())) })
                .await;
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_permit_counts_as_failure() {
        let b = breaker(BreakerConfig {
            min_calls: 1,
            window_size: 1,
            ..BreakerConfig::default()
        });
        drop(b.try_acquire().unwrap());
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_concurrent_probes() {
        let b = breaker(BreakerConfig {
            min_calls: 1,
            window_size: 1,
            ..BreakerConfig::default()
        });
        let _ = b
            .call(|| async { Err::<(), _>(Failure::Transient("reset".into())) })
            .await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe = b.try_acquire().unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(matches!(
            b.try_acquire(),
            Err(Failure::CircuitOpen { remaining }) if remaining == Duration::ZERO
        ));
        probe.record(&Ok::<(), Failure>(()));
    }
}
