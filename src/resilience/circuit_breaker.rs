//! Circuit breaker guarding a failing dependency.
//!
//! States:
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected immediately until the open timeout
//!   elapses. Rejections surface as transport errors naming the open
//!   circuit.
//! - **HalfOpen**: a limited probe; enough successes close the circuit,
//!   any failure reopens it.
//!
//! State lives behind a `std::sync::Mutex` so one breaker instance serves
//! both the blocking and the asynchronous execution paths; the lock is
//! never held across a suspension point.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{AsyncOperation, AsyncPolicy, Operation, Policy};
use crate::error::DispatchError;

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: usize,
    /// How long the circuit stays open before probing, in milliseconds.
    pub open_timeout_ms: u64,
    /// Successes required in HalfOpen before the circuit closes.
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 30_000,
            success_threshold: 1,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failure_count: usize,
    success_count: usize,
    last_failure: Option<Instant>,
}

/// Three-state circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker from configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            name: "CircuitBreaker".to_string(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Name carried in rejection errors and logs. Defaults to the
    /// reserved registry key.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Force the breaker back to Closed. For tests and operators.
    pub fn reset(&self) {
        let mut inner = self.lock();
        info!(breaker = %self.name, "Circuit breaker manually reset to closed");
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rejection(&self) -> DispatchError {
        DispatchError::Transport(format!("circuit breaker '{}' is open", self.name))
    }

    fn can_attempt(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let open_timeout = Duration::from_millis(self.config.open_timeout_ms);
                let expired = inner
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= open_timeout);
                if expired {
                    info!(breaker = %self.name, "Circuit breaker transitioning open -> half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                }
                expired
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(breaker = %self.name, "Circuit breaker transitioning half-open -> closed");
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_failure = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker transitioning closed -> open"
                    );
                    inner.state = BreakerState::Open;
                }
            }
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "Circuit breaker transitioning half-open -> open");
                inner.state = BreakerState::Open;
                inner.failure_count = 1;
                inner.success_count = 0;
            }
            BreakerState::Open => inner.failure_count += 1,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl Policy for CircuitBreaker {
    fn execute(&self, op: Operation<'_>) -> Result<(), DispatchError> {
        if !self.can_attempt() {
            warn!(breaker = %self.name, "Circuit breaker is open, rejecting call");
            return Err(self.rejection());
        }
        match op() {
            Ok(()) => {
                self.on_success();
                Ok(())
            }
            Err(failure) => {
                self.on_failure();
                Err(failure)
            }
        }
    }
}

#[async_trait]
impl AsyncPolicy for CircuitBreaker {
    async fn execute_async(
        &self,
        op: AsyncOperation<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        if !self.can_attempt() {
            warn!(breaker = %self.name, "Circuit breaker is open, rejecting call");
            return Err(self.rejection());
        }
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            outcome = op() => outcome,
        };
        match outcome {
            Ok(()) => {
                self.on_success();
                Ok(())
            }
            Err(failure) => {
                self.on_failure();
                Err(failure)
            }
        }
    }
}
