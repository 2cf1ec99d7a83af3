//! Resilience policies applied around broker and store I/O.
//!
//! This module contains:
//! - `Policy` / `AsyncPolicy` traits: opaque executors wrapped around
//!   fallible operations
//! - `RetryPolicy`: exponential backoff with jitter
//! - `CircuitBreaker`: three-state breaker guarding a failing dependency
//!
//! Policies compose by nesting executes; the external bus nests retry
//! inside the circuit breaker for outbox clearing and applies retry alone
//! on the request-reply paths.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use retry::{RetryConfig, RetryPolicy};

/// A fallible blocking operation a policy can re-run.
pub type Operation<'a> = &'a mut dyn FnMut() -> Result<(), DispatchError>;

/// A factory of fallible futures a policy can re-run.
///
/// The factory is invoked once per attempt; captures are cloned into each
/// produced future so attempts are independent.
pub type AsyncOperation<'a> =
    &'a mut (dyn FnMut() -> BoxFuture<'static, Result<(), DispatchError>> + Send);

/// Blocking resilience decorator.
pub trait Policy: Send + Sync {
    /// Execute the operation under this policy.
    fn execute(&self, op: Operation<'_>) -> Result<(), DispatchError>;
}

/// Asynchronous resilience decorator.
#[async_trait]
pub trait AsyncPolicy: Send + Sync {
    /// Execute the operation under this policy, honouring cancellation
    /// before every attempt and during backoff waits.
    async fn execute_async(
        &self,
        op: AsyncOperation<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError>;
}
