//! Retry policy: exponential backoff with jitter.
//!
//! Uses `backon` to build the delay schedule. Only transient failures are
//! retried; contract, configuration, and handler failures surface
//! immediately. Exhausting the schedule surfaces the final failure
//! unchanged.

use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::{AsyncOperation, AsyncPolicy, Operation, Policy};
use crate::error::DispatchError;

/// Retry schedule configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Minimum delay between attempts in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds.
    pub max_delay_ms: u64,
    /// Maximum number of retries after the first attempt.
    pub max_retries: usize,
    /// Add jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 10,
            max_delay_ms: 2_000,
            max_retries: 3,
            jitter: true,
        }
    }
}

/// Retry with exponential backoff.
pub struct RetryPolicy {
    backoff: ExponentialBuilder,
}

impl RetryPolicy {
    /// Create a retry policy from configuration.
    pub fn new(config: RetryConfig) -> Self {
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(config.min_delay_ms))
            .with_max_delay(Duration::from_millis(config.max_delay_ms))
            .with_max_times(config.max_retries);
        if config.jitter {
            backoff = backoff.with_jitter();
        }
        Self { backoff }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl Policy for RetryPolicy {
    fn execute(&self, op: Operation<'_>) -> Result<(), DispatchError> {
        let mut delays = self.backoff.build();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op() {
                Ok(()) => return Ok(()),
                Err(failure) if failure.is_transient() => match delays.next() {
                    Some(delay) => {
                        warn!(
                            attempt = attempt,
                            error = %failure,
                            delay = ?delay,
                            "Operation failed, retrying after backoff"
                        );
                        std::thread::sleep(delay);
                    }
                    None => {
                        error!(
                            attempts = attempt,
                            error = %failure,
                            "Operation failed and retry schedule exhausted"
                        );
                        return Err(failure);
                    }
                },
                Err(failure) => return Err(failure),
            }
        }
    }
}

#[async_trait]
impl AsyncPolicy for RetryPolicy {
    async fn execute_async(
        &self,
        op: AsyncOperation<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let mut delays = self.backoff.build();
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                outcome = op() => outcome,
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(failure) if failure.is_transient() => match delays.next() {
                    Some(delay) => {
                        warn!(
                            attempt = attempt,
                            error = %failure,
                            delay = ?delay,
                            "Operation failed, retrying after backoff"
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        error!(
                            attempts = attempt,
                            error = %failure,
                            "Operation failed and retry schedule exhausted"
                        );
                        return Err(failure);
                    }
                },
                Err(failure) => return Err(failure),
            }
        }
    }
}
