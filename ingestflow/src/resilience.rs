//! Retry backoff and circuit breaking around unreliable external calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::{Error, Result};

/// Shape of the delay curve between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles with each attempt.
    #[default]
    Exponential,
}

/// Backoff policy applied between attempts of a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Curve shape.
    #[serde(default)]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    pub delay_ms: u64,
    /// Upper bound for a single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Whether to add up to 25% random jitter.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            kind: BackoffKind::Fixed,
            delay_ms: ms,
            max_delay_ms: ms,
            jitter: false,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay before retrying after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = match self.kind {
            BackoffKind::Fixed => self.delay_ms as f64,
            BackoffKind::Exponential => {
                self.delay_ms as f64 * 2f64.powi(attempt.saturating_sub(1).min(32) as i32)
            }
        };

        let delay_ms = base_delay.min(self.max_delay_ms as f64) as u64;

        let final_delay = if self.jitter {
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay)
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail immediately.
    Open,
    /// One trial call is allowed to check for recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_transition: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    last_transition: DateTime<Utc>,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.last_transition = Utc::now();
        match to {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.opened_at_wall = Some(self.last_transition);
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.opened_at = None;
                self.opened_at_wall = None;
            }
            CircuitState::HalfOpen => {}
        }
    }
}

/// Circuit breaker for one named operation.
///
/// All fields live behind one mutex so every transition is atomic with
/// respect to concurrent callers sharing the key.
pub struct CircuitBreaker {
    key: String,
    failure_threshold: u32,
    open_duration: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            key: key.into(),
            failure_threshold: failure_threshold.max(1),
            open_duration,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                opened_at_wall: None,
                last_transition: Utc::now(),
                trial_in_flight: false,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state, applying the open -> half-open transition if the open
    /// duration has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_cooldown(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.check_cooldown(&mut inner);
        BreakerSnapshot {
            key: self.key.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.failure_threshold,
            opened_at: inner.opened_at_wall,
            last_transition: inner.last_transition,
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails with [`Error::CircuitOpen`] without invoking `operation` while the
    /// circuit is open, or while a half-open trial is already in flight.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(e) => permit.fail(e),
        }
        result
    }

    /// Reset to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        inner.transition(CircuitState::Closed);
        debug!(key = %self.key, "Circuit breaker reset to closed state");
    }

    fn acquire(&self) -> Result<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        self.check_cooldown(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                debug!(key = %self.key, "Circuit breaker admitting half-open trial call");
                Ok(CallPermit::new(self, true))
            }
            CircuitState::HalfOpen => Err(self.open_error(&inner)),
            CircuitState::Open => Err(self.open_error(&inner)),
        }
    }

    fn open_error(&self, inner: &BreakerInner) -> Error {
        let retry_after = inner
            .opened_at
            .map(|at| self.open_duration.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO);
        Error::CircuitOpen {
            key: self.key.clone(),
            retry_after,
        }
    }

    fn check_cooldown(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.open_duration
        {
            inner.transition(CircuitState::HalfOpen);
            inner.trial_in_flight = false;
            debug!(key = %self.key, "Circuit breaker transitioned to half-open state");
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.transition(CircuitState::Closed);
                info!(key = %self.key, "Circuit breaker closed after successful trial call");
            }
            // A call admitted while closed finished after the circuit moved on.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, trial: bool, error: &Error) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.transition(CircuitState::Open);
                    warn!(
                        key = %self.key,
                        failures = inner.consecutive_failures,
                        error = %error,
                        "Circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.transition(CircuitState::Open);
                warn!(key = %self.key, error = %error, "Circuit breaker reopened after failed trial call");
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

/// Admission for one call. Dropping an unsettled trial permit (the call's
/// future was cancelled) frees the half-open slot without a transition.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn succeed(&mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    fn fail(&mut self, error: &Error) {
        self.settled = true;
        self.breaker.record_failure(self.trial, error);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial();
        }
    }
}

/// Lazily-created circuit breakers keyed by operation name
/// (e.g. `webFlow:<chatbotId>`).
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold,
            open_duration,
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_millis(config.open_duration_ms),
        )
    }

    /// Get or create the breaker for a key.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(key) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    key,
                    self.failure_threshold,
                    self.open_duration,
                ))
            })
            .clone()
    }

    /// Run `operation` through the breaker registered under `key`.
    pub async fn call<F, Fut, T>(&self, key: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.get(key);
        breaker.call(operation).await
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        breakers.iter().map(|b| b.snapshot()).collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::from_config(&BreakerConfig::default())
    }
}
