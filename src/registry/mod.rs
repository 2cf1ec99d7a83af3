//! Registries consumed by the processor.
//!
//! - `SubscriberRegistry`: request type -> ordered handler registrations,
//!   with middleware declarations riding on each registration
//! - `MapperRegistry`: request type -> bidirectional wire codec
//! - `PolicyRegistry`: name -> resilience policy

mod mapper;
mod policy;
mod subscriber;

pub use mapper::{MapperRegistry, MessageMapper};
pub use policy::{
    PolicyRegistry, CIRCUIT_BREAKER, CIRCUIT_BREAKER_ASYNC, RETRY_POLICY, RETRY_POLICY_ASYNC,
};
pub use subscriber::{
    AsyncMiddlewareRegistration, AsyncSubscriber, MiddlewareRegistration, SubscriberRegistry,
    SyncSubscriber, Timing,
};
