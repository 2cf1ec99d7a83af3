//! Error taxonomy for dispatch operations.
//!
//! Every façade operation surfaces a `DispatchError`. The variants map to
//! distinct failure kinds rather than concrete collaborator types:
//! - `Configuration`: a required collaborator (factory, outbox, producer,
//!   mapper, channel factory, reply subscription) is missing.
//! - `Contract`: the caller violated an invariant (handler count, zero
//!   timeout, rejected duplicate).
//! - `Handler`: an error raised by user handler code, carried unchanged.
//! - `Transport`: broker or store I/O failure, retryable under policy.

use uuid::Uuid;

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced by the command processor and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A required collaborator is not configured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The caller violated an operation invariant.
    #[error("contract violation: {0}")]
    Contract(String),

    /// No outbox entry exists for the given message id.
    #[error("no outbox entry found for message id {0}")]
    NotFound(Uuid),

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// One or more handlers failed during a publish fan-out.
    ///
    /// Inner errors are ordered by handler registration order.
    #[error("publish failed with {} handler error(s)", .0.len())]
    Aggregate(Vec<DispatchError>),

    /// A receive exceeded its budget without the channel signalling
    /// the soft timeout indicator.
    #[error("timed out waiting for reply")]
    Timeout,

    /// An error raised by a user handler, propagated unchanged.
    #[error("handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Broker or store I/O failure. Circuit breaker rejections also
    /// surface here, naming the open circuit.
    #[error("transport error: {0}")]
    Transport(String),
}

impl DispatchError {
    /// Wrap a user handler error.
    pub fn handler(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Handler(Box::new(err))
    }

    /// Wrap a plain string as a user handler error.
    pub fn handler_msg(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into().into())
    }

    /// Whether a retry policy should attempt the operation again.
    ///
    /// Only transport-level failures are transient; contract,
    /// configuration, and handler failures will never succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_counts_inner_errors() {
        let err = DispatchError::Aggregate(vec![
            DispatchError::handler_msg("boom"),
            DispatchError::handler_msg("bang"),
        ]);
        assert!(err.to_string().contains("2 handler error(s)"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(DispatchError::Transport("broker down".into()).is_transient());
        assert!(DispatchError::Timeout.is_transient());
        assert!(!DispatchError::Configuration("no outbox".into()).is_transient());
        assert!(!DispatchError::Contract("bad timeout".into()).is_transient());
        assert!(!DispatchError::Cancelled.is_transient());
        assert!(!DispatchError::handler_msg("boom").is_transient());
    }

    #[test]
    fn test_handler_error_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = DispatchError::handler(io);
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "disk gone");
    }
}
