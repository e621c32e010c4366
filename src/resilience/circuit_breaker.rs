//! Count-based circuit breaker.
//!
//! CLOSED records call outcomes in a sliding window and trips to OPEN once the
//! failure rate reaches the threshold. OPEN rejects every call until the open
//! duration elapses, then the next call moves the breaker to HALF_OPEN, which
//! admits a fixed number of trial calls and decides OPEN or CLOSED from them.

use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::ResilienceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Percentage of failed calls (0..=100) that trips the breaker.
    pub failure_rate_threshold: f64,
    /// Number of most recent outcomes considered while CLOSED.
    pub sliding_window_size: usize,
    /// Outcomes required before the failure rate is evaluated.
    pub minimum_calls: usize,
    pub open_duration: Duration,
    pub half_open_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            sliding_window_size: 100,
            minimum_calls: 10,
            open_duration: Duration::from_secs(60),
            half_open_calls: 10,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// `true` marks a failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trials_issued: usize,
    trial_outcomes: Vec<bool>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        let config = CircuitBreakerConfig {
            sliding_window_size: config.sliding_window_size.max(1),
            minimum_calls: config.minimum_calls.max(1),
            half_open_calls: config.half_open_calls.max(1),
            ..config
        };
        Self {
            name: name.to_string(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.sliding_window_size),
                opened_at: None,
                trials_issued: 0,
                trial_outcomes: Vec::new(),
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

    /// Ask permission for one call. Returns false when the call must be rejected.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let cooled_down = inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.open_duration)
                .unwrap_or(true);
            if !cooled_down {
                return false;
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.trials_issued >= self.config.half_open_calls {
                return false;
            }
            inner.trials_issued += 1;
        }

        true
    }

    pub fn on_success(&self) {
        self.record(false);
    }

    pub fn on_failure(&self) {
        self.record(true);
    }

    /// Run `fut` under the breaker.
    pub async fn call<T, E, Fut>(&self, fut: Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.acquire() else {
            tracing::error!(breaker = %self.name, "Circuit breaker is OPEN - call not permitted");
            return Err(ResilienceError::CircuitOpen(self.name.clone()));
        };

        match fut.await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(ResilienceError::Inner(e))
            }
        }
    }

    /// Like [`try_acquire`](Self::try_acquire), but the admitted call counts as
    /// a failure if the permit is dropped before an outcome is recorded.
    pub fn acquire(&self) -> Option<CallPermit<'_>> {
        self.try_acquire().then(|| CallPermit {
            breaker: self,
            recorded: false,
        })
    }

    fn record(&self, failed: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.window.push_back(failed);
                while inner.window.len() > self.config.sliding_window_size {
                    inner.window.pop_front();
                }
                if inner.window.len() >= self.config.minimum_calls {
                    let rate = failure_rate(inner.window.iter().copied());
                    if rate >= self.config.failure_rate_threshold {
                        tracing::error!(
                            breaker = %self.name,
                            failure_rate = rate,
                            "Circuit breaker failure rate exceeded"
                        );
                        self.transition(&mut inner, CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                inner.trial_outcomes.push(failed);
                if inner.trial_outcomes.len() >= self.config.half_open_calls {
                    let rate = failure_rate(inner.trial_outcomes.iter().copied());
                    let next = if rate >= self.config.failure_rate_threshold {
                        CircuitState::Open
                    } else {
                        CircuitState::Closed
                    };
                    self.transition(&mut inner, next);
                }
            }
            // Late outcomes of calls admitted before the breaker opened.
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        tracing::warn!(
            breaker = %self.name,
            from = ?inner.state,
            to = ?to,
            "Circuit breaker state transition"
        );
        inner.state = to;
        inner.trials_issued = 0;
        inner.trial_outcomes.clear();
        match to {
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                inner.window.clear();
                inner.opened_at = None;
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // Breaker state stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One admitted call. Dropping it unrecorded (cancelled or panicked call)
/// records a failure so HALF_OPEN trial slots are always returned.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    recorded: bool,
}

impl CallPermit<'_> {
    pub fn success(mut self) {
        self.recorded = true;
        self.breaker.on_success();
    }

    pub fn failure(mut self) {
        self.recorded = true;
        self.breaker.on_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            tracing::warn!(breaker = %self.breaker.name, "Call abandoned before completion, counting as failure");
            self.breaker.on_failure();
        }
    }
}

fn failure_rate(outcomes: impl Iterator<Item = bool>) -> f64 {
    let (total, failed) = outcomes.fold((0usize, 0usize), |(t, f), failed| {
        (t + 1, f + failed as usize)
    });
    if total == 0 {
        return 0.0;
    }
    failed as f64 * 100.0 / total as f64
}
