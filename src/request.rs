//! Request model: commands, events, and calls.
//!
//! A request is any value that can travel through the processor. The marker
//! traits determine dispatch semantics:
//! - `Command`: exactly one handler; the first failure is the caller's.
//! - `Event`: zero or more handlers; failures are aggregated.
//! - `Call`: a command that expects a typed response over an ephemeral
//!   reply channel.

use uuid::Uuid;

/// A dispatchable request.
///
/// The id is stable from construction and keys inbox deduplication and
/// outbox entries.
pub trait Request: Send + 'static {
    /// Unique identity of this request instance.
    fn id(&self) -> Uuid;
}

/// A request handled by exactly one handler.
pub trait Command: Request {}

/// A request fanned out to zero or more handlers.
///
/// Events are cloned once per handler chain, so they must be `Clone`.
pub trait Event: Request + Clone {}

/// Where a remote handler should route its reply.
///
/// Both fields are set to the fresh channel id when a call begins, and the
/// reply is accepted only if its correlation id matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyAddress {
    /// Topic of the ephemeral reply channel.
    pub topic: String,
    /// Correlation id the reply must echo.
    pub correlation_id: String,
}

/// A command expecting a response from a remote handler.
pub trait Call: Command {
    /// The reply type, dispatched locally as a command on receipt.
    type Response: Command;

    /// Reply address carried on the outbound request.
    fn reply_address(&self) -> &ReplyAddress;

    /// Mutable reply address, rewritten by the processor before sending.
    fn reply_address_mut(&mut self) -> &mut ReplyAddress;
}

/// Last path segment of a type name, for error messages and logs.
pub(crate) fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
