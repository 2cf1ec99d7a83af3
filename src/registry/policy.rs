//! Named resilience policy registry.
//!
//! Reserved names cover the policies the core itself applies around
//! broker I/O. `with_defaults` installs a standard retry and circuit
//! breaker under every reserved name the caller did not supply, so a
//! freshly built processor always has a working envelope.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DispatchError;
use crate::resilience::{AsyncPolicy, CircuitBreaker, Policy, RetryPolicy};

/// Blocking circuit breaker applied around outbox clearing.
pub const CIRCUIT_BREAKER: &str = "CircuitBreaker";
/// Blocking retry applied inside the circuit breaker and on call paths.
pub const RETRY_POLICY: &str = "RetryPolicy";
/// Asynchronous circuit breaker.
pub const CIRCUIT_BREAKER_ASYNC: &str = "CircuitBreaker.Async";
/// Asynchronous retry.
pub const RETRY_POLICY_ASYNC: &str = "RetryPolicy.Async";

/// Name to policy executor.
#[derive(Default)]
pub struct PolicyRegistry {
    sync_policies: HashMap<String, Arc<dyn Policy>>,
    async_policies: HashMap<String, Arc<dyn AsyncPolicy>>,
}

impl PolicyRegistry {
    /// Empty registry; reserved names resolve to nothing until added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with default policies under the reserved names.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.ensure_defaults();
        registry
    }

    /// Install defaults for any reserved name not yet present.
    pub fn ensure_defaults(&mut self) {
        self.sync_policies
            .entry(RETRY_POLICY.to_string())
            .or_insert_with(|| Arc::new(RetryPolicy::default()));
        self.sync_policies
            .entry(CIRCUIT_BREAKER.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::default().with_name(CIRCUIT_BREAKER)));
        self.async_policies
            .entry(RETRY_POLICY_ASYNC.to_string())
            .or_insert_with(|| Arc::new(RetryPolicy::default()));
        self.async_policies
            .entry(CIRCUIT_BREAKER_ASYNC.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::default().with_name(CIRCUIT_BREAKER_ASYNC))
            });
    }

    /// Add or replace a blocking policy.
    pub fn add(&mut self, name: impl Into<String>, policy: Arc<dyn Policy>) -> &mut Self {
        self.sync_policies.insert(name.into(), policy);
        self
    }

    /// Add or replace an asynchronous policy.
    pub fn add_async(&mut self, name: impl Into<String>, policy: Arc<dyn AsyncPolicy>) -> &mut Self {
        self.async_policies.insert(name.into(), policy);
        self
    }

    /// Blocking policy by name; configuration failure when missing.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Policy>, DispatchError> {
        self.sync_policies.get(name).cloned().ok_or_else(|| {
            DispatchError::Configuration(format!("no policy registered under '{name}'"))
        })
    }

    /// Asynchronous policy by name; configuration failure when missing.
    pub fn get_async(&self, name: &str) -> Result<Arc<dyn AsyncPolicy>, DispatchError> {
        self.async_policies.get(name).cloned().ok_or_else(|| {
            DispatchError::Configuration(format!("no async policy registered under '{name}'"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_reserved_names() {
        let registry = PolicyRegistry::with_defaults();
        assert!(registry.get(RETRY_POLICY).is_ok());
        assert!(registry.get(CIRCUIT_BREAKER).is_ok());
        assert!(registry.get_async(RETRY_POLICY_ASYNC).is_ok());
        assert!(registry.get_async(CIRCUIT_BREAKER_ASYNC).is_ok());
    }

    #[test]
    fn test_missing_policy_is_configuration_error() {
        let registry = PolicyRegistry::new();
        let err = match registry.get(RETRY_POLICY) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, DispatchError::Configuration(_)));
    }

    #[test]
    fn test_caller_policy_survives_ensure_defaults() {
        struct AlwaysFail;

        impl Policy for AlwaysFail {
            fn execute(
                &self,
                _op: crate::resilience::Operation<'_>,
            ) -> Result<(), DispatchError> {
                Err(DispatchError::Transport("custom policy".into()))
            }
        }

        let mut registry = PolicyRegistry::new();
        registry.add(RETRY_POLICY, Arc::new(AlwaysFail));
        registry.ensure_defaults();

        let err = registry
            .get(RETRY_POLICY)
            .unwrap()
            .execute(&mut || Ok(()))
            .unwrap_err();
        assert!(err.to_string().contains("custom policy"));
    }
}
