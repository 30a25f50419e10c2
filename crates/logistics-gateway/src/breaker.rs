//! Per-dependency circuit breakers.
//!
//! ```text
//! Closed → Open:      consecutive failures >= threshold, or failure rate over
//!                     the sliding window >= rate (after minimum_calls)
//! Open → HalfOpen:    cooldown elapsed (checked on the next acquire)
//! HalfOpen → Closed:  the single probe succeeds
//! HalfOpen → Open:    the single probe fails
//! ```
//!
//! One breaker exists per dependency and is shared by every request to it.
//! All transitions happen under the breaker's mutex.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::metrics::{BREAKER_REJECTIONS, BREAKER_STATE};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_rate: f64,
    pub window_size: usize,
    pub minimum_calls: usize,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate: 0.5,
            window_size: 20,
            minimum_calls: 10,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit open")]
pub struct BreakerOpen;

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Most recent call outcomes, `true` = failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        BREAKER_STATE
            .with_label_values(&[&name])
            .set(CircuitState::Closed.gauge_value());
        Self {
            name,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window: VecDeque::with_capacity(config.window_size),
                opened_at: None,
                probe_in_flight: false,
            }),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask permission for one call. An open breaker, or a half-open breaker
    /// whose probe is already in flight, rejects without touching the network.
    pub fn try_acquire(self: &Arc<Self>) -> Result<Permit, BreakerOpen> {
        let mut inner = self.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return Err(self.reject());
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.reject());
                }
                inner.probe_in_flight = true;
                true
            }
        };
        Ok(Permit {
            breaker: Arc::clone(self),
            probe,
            recorded: false,
        })
    }

    fn reject(&self) -> BreakerOpen {
        BREAKER_REJECTIONS.with_label_values(&[&self.name]).inc();
        BreakerOpen
    }

    fn record(&self, probe: bool, failed: bool) {
        let mut inner = self.lock();

        if probe {
            inner.probe_in_flight = false;
            if inner.state != CircuitState::HalfOpen {
                return;
            }
            if failed {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
                tracing::warn!(dependency = %self.name, "probe failed, circuit reopened");
            } else {
                inner.consecutive_failures = 0;
                inner.window.clear();
                inner.opened_at = None;
                self.transition(&mut inner, CircuitState::Closed);
                tracing::info!(dependency = %self.name, "probe succeeded, circuit closed");
            }
            return;
        }

        // Calls admitted while closed that finish after the breaker moved on
        // carry no information about the current state.
        if inner.state != CircuitState::Closed {
            return;
        }

        if inner.window.len() == self.config.window_size.max(1) {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);

        if !failed {
            inner.consecutive_failures = 0;
            return;
        }
        inner.consecutive_failures += 1;

        let failures = inner.window.iter().filter(|f| **f).count();
        let rate = failures as f64 / inner.window.len() as f64;
        let rate_tripped =
            inner.window.len() >= self.config.minimum_calls && rate >= self.config.failure_rate;

        if inner.consecutive_failures >= self.config.failure_threshold || rate_tripped {
            tracing::warn!(
                dependency = %self.name,
                consecutive_failures = inner.consecutive_failures,
                failure_rate = rate,
                "circuit opened"
            );
            inner.opened_at = Some(Instant::now());
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state != to {
            tracing::debug!(dependency = %self.name, from = %inner.state, to = %to, "breaker transition");
        }
        inner.state = to;
        BREAKER_STATE
            .with_label_values(&[&self.name])
            .set(to.gauge_value());
    }
}

/// Permission for a single call. Report the outcome with [`Permit::success`]
/// or [`Permit::failure`]; a permit dropped without a report (the request was
/// cancelled mid-call) counts as a failure.
#[must_use = "a dropped permit is recorded as a failure"]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    recorded: bool,
}

impl Permit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.recorded = true;
        self.breaker.record(self.probe, false);
    }

    pub fn failure(mut self) {
        self.recorded = true;
        self.breaker.record(self.probe, true);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.record(self.probe, true);
        }
    }
}

/// Lazily created breakers keyed by dependency name.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, self.config.clone())));
        Arc::clone(entry.value())
    }

    /// Current state of every breaker created so far, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
